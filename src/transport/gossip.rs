//! Networked transport.
//!
//! Membership and grid payloads ride on the UDP gossip socket of a
//! [`MembershipService`]; worker RPCs are JSON POSTs to each node's HTTP port.
//! The coordinator is the smallest alive node id, so every node with the same
//! view elects the same one without a separate election round.

use super::handlers::handle_worker_rpc;
use super::protocol::{ENDPOINT_WORKER_RPC, WorkerRpcRequest, WorkerRpcResponse};
use super::{ClusterView, HandlerSlot, RpcResponse, Transport, TransportHandler};
use crate::compute::protocol::WorkerRequest;
use crate::grid::types::GridMessage;
use crate::membership::service::MembershipService;
use crate::membership::types::{NodeId, NodeState};

use anyhow::Result;
use async_trait::async_trait;
use axum::{Extension, Router, routing::post};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const VIEW_CHECK_INTERVAL: Duration = Duration::from_millis(500);
const CAST_TIMEOUT: Duration = Duration::from_secs(2);
const CAST_ATTEMPTS: usize = 3;

pub struct GossipTransport {
    membership: Arc<MembershipService>,
    handler: Arc<HandlerSlot>,
    http_client: reqwest::Client,
    shutdown: CancellationToken,
}

impl GossipTransport {
    /// Starts gossip, the inbox pump, the view watcher and the worker RPC server.
    pub async fn start(membership: Arc<MembershipService>) -> Result<Arc<Self>> {
        let transport = Arc::new(Self {
            membership: membership.clone(),
            handler: Arc::new(HandlerSlot::default()),
            http_client: reqwest::Client::new(),
            shutdown: CancellationToken::new(),
        });

        membership.clone().start().await;
        transport.spawn_inbox_pump();
        transport.spawn_view_watcher();
        transport.serve_worker_rpc().await?;

        Ok(transport)
    }

    pub fn membership(&self) -> &Arc<MembershipService> {
        &self.membership
    }

    fn spawn_inbox_pump(&self) {
        let Some(mut inbox) = self.membership.take_grid_inbox() else {
            tracing::warn!("Grid inbox already taken, grid messages will not be delivered");
            return;
        };
        let handler = self.handler.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = inbox.recv() => received,
                };
                let Some((from, message)) = received else {
                    break;
                };

                match handler.get() {
                    Some(handler) => handler.on_message(from, message).await,
                    None => tracing::trace!("Dropping grid message from {}: no handler", from),
                }
            }
        });
    }

    fn spawn_view_watcher(&self) {
        let membership = self.membership.clone();
        let handler = self.handler.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(VIEW_CHECK_INTERVAL);
            let mut last_view: Option<ClusterView> = None;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let view = ClusterView {
                    members: membership.alive_member_ids(),
                    coordinator: membership.coordinator(),
                };
                if last_view.as_ref() == Some(&view) {
                    continue;
                }

                if let Some(handler) = handler.get() {
                    handler.on_view_change(view.clone());
                }
                last_view = Some(view);
            }
        });
    }

    async fn serve_worker_rpc(&self) -> Result<()> {
        let http_addr = self.membership.local_node.http_addr;
        let app = Router::new()
            .route(ENDPOINT_WORKER_RPC, post(handle_worker_rpc))
            .layer(Extension(self.handler.clone()));

        let listener = tokio::net::TcpListener::bind(http_addr).await?;
        tracing::info!("Worker RPC listening on {}", http_addr);

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                tracing::error!("Worker RPC server failed: {}", e);
            }
        });

        Ok(())
    }

    async fn call_one(
        &self,
        target: &NodeId,
        request: WorkerRequest,
        timeout: Duration,
    ) -> RpcResponse {
        if *target == self.membership.local_node.id {
            let Some(handler) = self.handler.get() else {
                return RpcResponse::Unreachable;
            };
            return match tokio::time::timeout(timeout, handler.on_request(target.clone(), request))
                .await
            {
                Ok(Ok(response)) => RpcResponse::Received(response),
                Ok(Err(e)) => RpcResponse::Exception(format!("{:#}", e)),
                Err(_) => RpcResponse::NoResponse,
            };
        }

        let Some(node) = self.membership.get_member(target) else {
            return RpcResponse::Unreachable;
        };
        match node.state {
            NodeState::Suspect => return RpcResponse::Suspected,
            NodeState::Dead => return RpcResponse::Unreachable,
            NodeState::Alive => {}
        }

        let url = format!("http://{}{}", node.http_addr, ENDPOINT_WORKER_RPC);
        let body = WorkerRpcRequest {
            from: self.membership.local_node.id.clone(),
            request,
        };

        let response = match post_with_retry(&self.http_client, url, &body, timeout, 1).await {
            Ok(response) => response,
            Err(e) => return classify_http_error(&e),
        };

        match response.json::<WorkerRpcResponse>().await {
            Ok(WorkerRpcResponse {
                response: Some(response),
                ..
            }) => RpcResponse::Received(response),
            Ok(WorkerRpcResponse {
                error: Some(error), ..
            }) => RpcResponse::Exception(error),
            Ok(_) => RpcResponse::Exception("Empty worker response".to_string()),
            Err(e) => RpcResponse::Exception(format!("Malformed worker response: {}", e)),
        }
    }
}

fn classify_http_error(error: &anyhow::Error) -> RpcResponse {
    match error.downcast_ref::<reqwest::Error>() {
        Some(e) if e.is_timeout() => RpcResponse::NoResponse,
        Some(e) if e.is_connect() => RpcResponse::Unreachable,
        _ => RpcResponse::Exception(format!("{:#}", error)),
    }
}

#[async_trait]
impl Transport for GossipTransport {
    fn local_address(&self) -> NodeId {
        self.membership.local_node.id.clone()
    }

    fn cluster_members(&self) -> Vec<NodeId> {
        self.membership.alive_member_ids()
    }

    fn coordinator(&self) -> Option<NodeId> {
        self.membership.coordinator()
    }

    fn bind(&self, handler: Weak<dyn TransportHandler>) {
        self.handler.set(handler);
    }

    async fn send(&self, message: GridMessage) -> Result<()> {
        self.membership.broadcast_grid_message(message).await
    }

    async fn send_to(&self, to: &NodeId, message: GridMessage) -> Result<()> {
        self.membership.send_grid_message(to, message).await
    }

    async fn cast(&self, targets: &[NodeId], request: WorkerRequest) {
        for target in targets {
            if *target == self.membership.local_node.id {
                if let Some(handler) = self.handler.get() {
                    let from = target.clone();
                    let request = request.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handler.on_request(from, request).await {
                            tracing::warn!("Local worker request failed: {:#}", e);
                        }
                    });
                }
                continue;
            }

            let Some(node) = self.membership.get_member(target) else {
                tracing::debug!("Dropping {} for unknown member {}", request.name(), target);
                continue;
            };

            let url = format!("http://{}{}", node.http_addr, ENDPOINT_WORKER_RPC);
            let body = WorkerRpcRequest {
                from: self.membership.local_node.id.clone(),
                request: request.clone(),
            };
            let http_client = self.http_client.clone();
            let target = target.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    post_with_retry(&http_client, url, &body, CAST_TIMEOUT, CAST_ATTEMPTS).await
                {
                    tracing::warn!("{} to {} failed: {:#}", body.request.name(), target, e);
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
        self.shutdown.cancel();
        self.membership.stop();
    }
}

async fn post_with_retry<T: serde::Serialize>(
    http_client: &reqwest::Client,
    url: String,
    payload: &T,
    timeout: Duration,
    attempts: usize,
) -> Result<reqwest::Response> {
    let mut delay_ms = 150u64;

    for attempt in 0..attempts {
        let response = http_client
            .post(url.clone())
            .json(payload)
            .timeout(timeout)
            .send()
            .await;

        match response {
            Ok(resp) => return Ok(resp),
            Err(e) => {
                if attempt + 1 == attempts {
                    return Err(anyhow::anyhow!(e));
                }
                // Jitter keeps retries from several nodes apart
                let jitter = rand::random::<u64>() % 50;
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms * 2).min(1200);
            }
        }
    }

    Err(anyhow::anyhow!("Retry attempts exhausted"))
}
