//! Distributed Grid Library
//!
//! Cluster coordination and distributed job execution. Every node of a
//! cluster makes the same calls; the elected coordinator drives the work and
//! the other nodes follow, so application code does not branch on its role.
//!
//! ## Architecture Modules
//!
//! - **`grid`**: a node's handle on the cluster: membership view, coordinator flag,
//!   broadcast messaging and listeners.
//! - **`transport`**: how nodes reach each other. `LocalCluster` keeps every node in
//!   one process; `GossipTransport` runs UDP gossip plus HTTP worker RPC.
//! - **`membership`**: SWIM-like gossip membership and failure detection backing the
//!   networked transport.
//! - **`job`**: run-on-one / run-on-all jobs with state broadcast, heartbeats and
//!   durable snapshots.
//! - **`compute`**: heartbeat-tracked tasks dispatched by the coordinator and
//!   aggregated into a cluster-wide status; the `GridCompute` facade.
//! - **`pipeline`**: ordered stages with `always` / `only_if` modifiers, stop
//!   requests and a resumable checkpoint.
//! - **`storage`**: durable namespaced state (in-memory or file-backed).
//! - **`config`** / **`error`**: timing configuration and the error type.

pub mod compute;
pub mod config;
pub mod error;
pub mod grid;
pub mod job;
pub mod membership;
pub mod pipeline;
pub mod storage;
pub mod transport;
