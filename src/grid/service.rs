use super::context::GridContext;
use super::types::{GridMessage, ListenerId, MessageListener};
use crate::compute::protocol::{WorkerRequest, WorkerResponse};
use crate::compute::service::GridCompute;
use crate::compute::worker::Worker;
use crate::config::GridConfig;
use crate::error::{GridError, GridResult};
use crate::membership::types::NodeId;
use crate::storage::StateStore;
use crate::transport::{ClusterView, Transport, TransportHandler};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio_util::sync::CancellationToken;

pub struct Grid {
    transport: Arc<dyn Transport>,
    storage: Arc<dyn StateStore>,
    config: GridConfig,
    worker: Worker,
    listeners: DashMap<ListenerId, Arc<dyn MessageListener>>,
    next_listener_id: AtomicU64,
    /// Last coordinator seen, to log transitions.
    coordinator: Mutex<Option<NodeId>>,
    shutdown: CancellationToken,
}

impl Grid {
    /// Builds a grid on top of a transport and binds itself as the transport's handler.
    pub fn new(
        transport: Arc<dyn Transport>,
        storage: Arc<dyn StateStore>,
        config: GridConfig,
    ) -> Arc<Self> {
        let node_id = transport.local_address();
        let coordinator = transport.coordinator();

        let grid = Arc::new_cyclic(|weak: &Weak<Grid>| Self {
            worker: Worker::new(node_id.clone(), config.clone(), weak.clone()),
            transport,
            storage,
            config,
            listeners: DashMap::new(),
            next_listener_id: AtomicU64::new(1),
            coordinator: Mutex::new(coordinator.clone()),
            shutdown: CancellationToken::new(),
        });

        let weak: Weak<Grid> = Arc::downgrade(&grid);
        let handler: Weak<dyn TransportHandler> = weak;
        grid.transport.bind(handler);

        tracing::info!(
            "Grid node {} started ({} members, coordinator {:?})",
            node_id,
            grid.members().len(),
            coordinator
        );

        grid
    }

    pub fn node_id(&self) -> NodeId {
        self.transport.local_address()
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.transport.cluster_members()
    }

    pub fn coordinator(&self) -> Option<NodeId> {
        self.transport.coordinator()
    }

    pub fn is_coordinator(&self) -> bool {
        self.transport.is_coordinator()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn storage(&self) -> &Arc<dyn StateStore> {
        &self.storage
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn context(self: &Arc<Self>) -> GridContext {
        GridContext::new(self.clone())
    }

    pub fn compute(self: &Arc<Self>) -> GridCompute {
        GridCompute::new(self.clone())
    }

    /// Broadcast to every member, this node included.
    pub async fn send(&self, message: GridMessage) -> GridResult<()> {
        self.transport
            .send(message)
            .await
            .map_err(|e| GridError::Transport(format!("{:#}", e)))
    }

    pub async fn send_to(&self, to: &NodeId, message: GridMessage) -> GridResult<()> {
        self.transport
            .send_to(to, message)
            .await
            .map_err(|e| GridError::Transport(format!("{:#}", e)))
    }

    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.insert(id, listener);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Cancelled when the grid shuts down. Every coordination wait races it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Sleeps for `duration` unless the grid shuts down first.
    pub(crate) async fn pause(&self, duration: std::time::Duration, waiting_for: &str) -> GridResult<()> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(GridError::Interrupted(waiting_for.to_string())),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    pub async fn shutdown(&self) {
        tracing::info!("Grid node {} shutting down", self.node_id());
        self.shutdown.cancel();
        self.transport.close().await;
    }

    fn record_view(&self, view: &ClusterView) {
        let local = self.node_id();
        let previous = match self.coordinator.lock() {
            Ok(mut current) => {
                if *current == view.coordinator {
                    None
                } else {
                    Some(std::mem::replace(&mut *current, view.coordinator.clone()))
                }
            }
            Err(_) => None,
        };

        match previous {
            Some(previous) => {
                tracing::info!(
                    "Coordinator changed: {:?} -> {:?}",
                    previous,
                    view.coordinator
                );
                if view.coordinator.as_ref() == Some(&local) {
                    tracing::info!("Node {} is now the coordinator", local);
                }
            }
            None => {
                tracing::debug!("View changed: {} members", view.members.len());
            }
        }
    }
}

#[async_trait]
impl TransportHandler for Grid {
    async fn on_message(&self, from: NodeId, message: GridMessage) {
        let listeners: Vec<Arc<dyn MessageListener>> = self
            .listeners
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for listener in listeners {
            listener.on_message(&from, &message);
        }
    }

    async fn on_request(&self, _from: NodeId, request: WorkerRequest) -> Result<WorkerResponse> {
        self.worker.handle(request)
    }

    fn on_view_change(&self, view: ClusterView) {
        self.record_view(&view);
    }
}
