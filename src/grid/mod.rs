//! Grid Module
//!
//! The grid is a node's handle on the cluster. It wraps a `Transport` and
//! exposes the membership view, the coordinator flag, broadcast/unicast of
//! grid payloads and a listener registry. It is also the transport's
//! handler: incoming payloads fan out to listeners, incoming worker RPCs go
//! to the node's `Worker`.
//!
//! Several grids can live in one process (one per simulated node); nothing
//! here is process-global.

pub mod context;
pub mod service;
pub mod types;
