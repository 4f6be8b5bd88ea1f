//! Worker RPC over HTTP
//!
//! `GossipTransport` carries every `WorkerRequest` as a JSON POST to the
//! target node's HTTP port. The handler's error travels back in the body so
//! the caller can report it as an exception rather than a dead node.

use crate::compute::protocol::{WorkerRequest, WorkerResponse};
use crate::membership::types::NodeId;
use serde::{Deserialize, Serialize};

pub const ENDPOINT_WORKER_RPC: &str = "/internal/worker";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRpcRequest {
    pub from: NodeId,
    pub request: WorkerRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRpcResponse {
    pub response: Option<WorkerResponse>,
    pub error: Option<String>,
}

impl WorkerRpcResponse {
    pub fn ok(response: WorkerResponse) -> Self {
        Self {
            response: Some(response),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            response: None,
            error: Some(message.into()),
        }
    }
}
