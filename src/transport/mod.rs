//! Transport Module
//!
//! The grid never talks to the network directly. It consumes a [`Transport`]:
//! membership view, coordinator flag, broadcast/unicast of grid payloads, and
//! typed worker RPC with per-node response classification.
//!
//! ## Implementations
//! - **`local`**: `LocalCluster`, N nodes inside one process. Used by tests and
//!   by single-process deployments.
//! - **`gossip`**: `GossipTransport`, UDP gossip membership plus JSON-over-HTTP
//!   worker RPC for multi-process clusters.

pub mod gossip;
pub mod handlers;
pub mod local;
pub mod protocol;


use crate::compute::protocol::{WorkerRequest, WorkerResponse};
use crate::grid::types::GridMessage;
use crate::membership::types::NodeId;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

/// Membership snapshot handed to view-change callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    pub members: Vec<NodeId>,
    pub coordinator: Option<NodeId>,
}

/// Outcome of one target of a gather RPC.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcResponse {
    /// The target answered.
    Received(WorkerResponse),
    /// The target's handler returned an error.
    Exception(String),
    /// The target is a member but currently suspected of having failed.
    Suspected,
    /// The target is not a (live) member or could not be contacted.
    Unreachable,
    /// No answer within the timeout.
    NoResponse,
}

impl RpcResponse {
    pub fn was_received(&self) -> bool {
        matches!(self, RpcResponse::Received(_))
    }
}

/// The grid side of a transport: where deliveries end up.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    async fn on_message(&self, from: NodeId, message: GridMessage);

    async fn on_request(&self, from: NodeId, request: WorkerRequest) -> Result<WorkerResponse>;

    fn on_view_change(&self, view: ClusterView);
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn local_address(&self) -> NodeId;

    fn cluster_members(&self) -> Vec<NodeId>;

    fn coordinator(&self) -> Option<NodeId>;

    fn is_coordinator(&self) -> bool {
        self.coordinator().as_ref() == Some(&self.local_address())
    }

    /// Installs the handler that receives messages, requests and view changes.
    fn bind(&self, handler: Weak<dyn TransportHandler>);

    /// Delivers to every member, the sender included.
    async fn send(&self, message: GridMessage) -> Result<()>;

    async fn send_to(&self, to: &NodeId, message: GridMessage) -> Result<()>;

    /// Fire-and-forget request to each target.
    async fn cast(&self, targets: &[NodeId], request: WorkerRequest);

    /// Sends `request` to every target and collects what came back within `timeout`.
    async fn call(
        &self,
        targets: &[NodeId],
        request: WorkerRequest,
        timeout: Duration,
    ) -> HashMap<NodeId, RpcResponse>;

    async fn close(&self);
}

/// A late-bound, weakly held handler shared between a transport and its
/// delivery tasks.
#[derive(Default)]
pub struct HandlerSlot {
    handler: RwLock<Option<Weak<dyn TransportHandler>>>,
}

impl HandlerSlot {
    pub fn set(&self, handler: Weak<dyn TransportHandler>) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = Some(handler);
        }
    }

    pub fn get(&self) -> Option<Arc<dyn TransportHandler>> {
        self.handler
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(|weak| weak.upgrade()))
    }
}
