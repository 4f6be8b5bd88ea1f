//! In-process cluster.
//!
//! Every node of a `LocalCluster` lives in the same process and is reached by
//! calling its handler directly. Membership is join-ordered and the oldest
//! member is the coordinator, so removing the first node elects the next one.

use super::{ClusterView, HandlerSlot, RpcResponse, Transport, TransportHandler};
use crate::compute::protocol::WorkerRequest;
use crate::grid::types::GridMessage;
use crate::membership::types::NodeId;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

struct LocalNode {
    id: NodeId,
    handler: HandlerSlot,
    suspected: AtomicBool,
}

#[derive(Default)]
struct ClusterState {
    nodes: RwLock<Vec<Arc<LocalNode>>>,
    next_index: AtomicUsize,
}

/// Handle on a simulated cluster. Cheap to clone.
#[derive(Clone, Default)]
pub struct LocalCluster {
    state: Arc<ClusterState>,
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node named `node-<n>` and returns its transport.
    pub fn join(&self) -> Arc<LocalTransport> {
        let index = self.state.next_index.fetch_add(1, Ordering::SeqCst);
        self.join_as(NodeId(format!("node-{}", index)))
    }

    pub fn join_as(&self, id: NodeId) -> Arc<LocalTransport> {
        let node = Arc::new(LocalNode {
            id: id.clone(),
            handler: HandlerSlot::default(),
            suspected: AtomicBool::new(false),
        });

        if let Ok(mut nodes) = self.state.nodes.write() {
            nodes.retain(|existing| existing.id != id);
            nodes.push(node.clone());
        }
        tracing::info!("Local node {} joined ({} members)", id, self.members().len());
        self.notify_view_change();

        Arc::new(LocalTransport {
            cluster: self.clone(),
            node,
        })
    }

    /// Removes a node. Later requests to it come back `Unreachable`.
    pub fn leave(&self, id: &NodeId) {
        let removed = match self.state.nodes.write() {
            Ok(mut nodes) => {
                let before = nodes.len();
                nodes.retain(|node| &node.id != id);
                before != nodes.len()
            }
            Err(_) => false,
        };

        if removed {
            tracing::info!("Local node {} left ({} members)", id, self.members().len());
            self.notify_view_change();
        }
    }

    /// Marks a node as suspected: it stays a member but gather RPCs to it
    /// report `Suspected`.
    pub fn set_suspected(&self, id: &NodeId, suspected: bool) {
        if let Some(node) = self.node(id) {
            node.suspected.store(suspected, Ordering::SeqCst);
        }
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.nodes().iter().map(|node| node.id.clone()).collect()
    }

    pub fn coordinator(&self) -> Option<NodeId> {
        self.nodes().first().map(|node| node.id.clone())
    }

    pub fn view(&self) -> ClusterView {
        ClusterView {
            members: self.members(),
            coordinator: self.coordinator(),
        }
    }

    fn nodes(&self) -> Vec<Arc<LocalNode>> {
        self.state
            .nodes
            .read()
            .map(|nodes| nodes.clone())
            .unwrap_or_default()
    }

    fn node(&self, id: &NodeId) -> Option<Arc<LocalNode>> {
        self.nodes().into_iter().find(|node| &node.id == id)
    }

    fn notify_view_change(&self) {
        let view = self.view();
        for node in self.nodes() {
            if let Some(handler) = node.handler.get() {
                handler.on_view_change(view.clone());
            }
        }
    }
}

/// One node's view of a [`LocalCluster`].
pub struct LocalTransport {
    cluster: LocalCluster,
    node: Arc<LocalNode>,
}

impl LocalTransport {
    pub fn cluster(&self) -> &LocalCluster {
        &self.cluster
    }

    async fn call_one(
        &self,
        target: &NodeId,
        request: WorkerRequest,
        timeout: Duration,
    ) -> RpcResponse {
        let Some(node) = self.cluster.node(target) else {
            return RpcResponse::Unreachable;
        };
        if node.suspected.load(Ordering::SeqCst) {
            return RpcResponse::Suspected;
        }
        let Some(handler) = node.handler.get() else {
            return RpcResponse::Unreachable;
        };

        match tokio::time::timeout(timeout, handler.on_request(self.node.id.clone(), request)).await
        {
            Ok(Ok(response)) => RpcResponse::Received(response),
            Ok(Err(e)) => RpcResponse::Exception(format!("{:#}", e)),
            Err(_) => RpcResponse::NoResponse,
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_address(&self) -> NodeId {
        self.node.id.clone()
    }

    fn cluster_members(&self) -> Vec<NodeId> {
        self.cluster.members()
    }

    fn coordinator(&self) -> Option<NodeId> {
        self.cluster.coordinator()
    }

    fn bind(&self, handler: Weak<dyn TransportHandler>) {
        self.node.handler.set(handler);
    }

    async fn send(&self, message: GridMessage) -> Result<()> {
        for node in self.cluster.nodes() {
            if let Some(handler) = node.handler.get() {
                handler
                    .on_message(self.node.id.clone(), message.clone())
                    .await;
            }
        }
        Ok(())
    }

    async fn send_to(&self, to: &NodeId, message: GridMessage) -> Result<()> {
        let node = self
            .cluster
            .node(to)
            .ok_or_else(|| anyhow::anyhow!("{} is not a member", to))?;

        if let Some(handler) = node.handler.get() {
            handler.on_message(self.node.id.clone(), message).await;
        }
        Ok(())
    }

    async fn cast(&self, targets: &[NodeId], request: WorkerRequest) {
        for target in targets {
            let Some(handler) = self.cluster.node(target).and_then(|node| node.handler.get())
            else {
                tracing::debug!("Dropping {} for non-member {}", request.name(), target);
                continue;
            };

            let from = self.node.id.clone();
            let request = request.clone();
            let target = target.clone();
            tokio::spawn(async move {
                let name = request.name();
                if let Err(e) = handler.on_request(from, request).await {
                    tracing::warn!("{} on {} failed: {:#}", name, target, e);
                }
            });
        }
    }

    async fn call(
        &self,
        targets: &[NodeId],
        request: WorkerRequest,
        timeout: Duration,
    ) -> HashMap<NodeId, RpcResponse> {
        let calls = targets.iter().map(|target| {
            let request = request.clone();
            async move {
                let response = self.call_one(target, request, timeout).await;
                (target.clone(), response)
            }
        });

        futures::future::join_all(calls).await.into_iter().collect()
    }

    async fn close(&self) {
        self.cluster.leave(&self.node.id);
    }
}
