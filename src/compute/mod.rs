//! Distributed Task Execution Module
//!
//! Runs named tasks on one node or on every node and turns the per-node
//! outcomes into a single cluster-wide status.
//!
//! ## Protocol Overview
//! 1. **Dispatch**: the coordinator casts `startNodeTask` to the target nodes.
//! 2. **Execution**: each worker runs its locally registered copy and keeps a
//!    heartbeat on the progress record.
//! 3. **Tracking**: the coordinator pulls progress each round. Stale, unreachable,
//!    suspected and failing nodes are settled as FAILED; `max_task_duration`
//!    caps the whole run.
//! 4. **Verdict**: the aggregate is persisted, pushed to every other node and the
//!    per-node records are cleared so the task id can run again.
//!
//! ## Submodules
//! - **`types`**: task state, status and progress records.
//! - **`task`**: the `GridTask` trait and the closure-backed `FnTask`.
//! - **`protocol`**: typed worker RPC requests and responses.
//! - **`registry`**: per-node map from task id to task object.
//! - **`worker`**: node-side execution, heartbeat and stored verdicts.
//! - **`dispatcher`**: RPC fan-out helpers.
//! - **`coordinator`**: the tracking loop and the non-coordinator wait.
//! - **`service`**: `GridCompute`, the public facade over jobs, tasks and pipelines.

pub mod coordinator;
pub mod dispatcher;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod task;
pub mod types;
pub mod worker;

#[cfg(test)]
mod tests;
