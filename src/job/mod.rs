//! Job Module
//!
//! Jobs are named async bodies whose progress travels as broadcast state
//! snapshots (`GridMessage::JobState`) rather than RPC.
//!
//! ## Submodules
//! - **`executor`**: runs a body locally with a periodic heartbeat broadcast.
//! - **`listener`**: follows a job running elsewhere, with a durable-state fallback.
//! - **`runner`**: the four execution policies built on the two above.

pub mod executor;
pub mod listener;
pub mod runner;
pub mod types;

#[cfg(test)]
mod tests;
