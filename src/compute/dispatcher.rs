//! Thin RPC fan-out over the transport.

use super::protocol::{TaskSpec, WorkerRequest};
use super::types::{ExecutionMode, TaskProgress};
use crate::membership::types::NodeId;
use crate::pipeline::types::PipelineResult;
use crate::transport::{RpcResponse, Transport};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct WorkDispatcher {
    transport: Arc<dyn Transport>,
    rpc_timeout: Duration,
}

impl WorkDispatcher {
    pub fn new(transport: Arc<dyn Transport>, rpc_timeout: Duration) -> Self {
        Self {
            transport,
            rpc_timeout,
        }
    }

    /// Nodes a task runs on: the coordinator alone, or every current member.
    pub fn target_nodes(&self, mode: ExecutionMode) -> Vec<NodeId> {
        match mode {
            ExecutionMode::SingleNode => self.transport.coordinator().into_iter().collect(),
            ExecutionMode::AllNodes => self.transport.cluster_members(),
        }
    }

    fn other_members(&self) -> Vec<NodeId> {
        let local = self.transport.local_address();
        self.transport
            .cluster_members()
            .into_iter()
            .filter(|node| *node != local)
            .collect()
    }

    pub async fn start_task_on_nodes(&self, spec: &TaskSpec) {
        let targets = self.target_nodes(spec.mode);
        tracing::debug!("Dispatching task {} to {} node(s)", spec.id, targets.len());
        self.transport
            .cast(&targets, WorkerRequest::StartNodeTask(spec.clone()))
            .await;
    }

    pub async fn start_task_on_node(&self, spec: &TaskSpec, node: &NodeId) {
        self.transport
            .cast(
                std::slice::from_ref(node),
                WorkerRequest::StartNodeTask(spec.clone()),
            )
            .await;
    }

    pub async fn stop_task_on_nodes(&self, task_id: &str) {
        let targets = self.transport.cluster_members();
        self.transport
            .cast(
                &targets,
                WorkerRequest::StopNodeTask {
                    task_id: task_id.to_string(),
                },
            )
            .await;
    }

    /// Pulls progress from `nodes`, bounded by the RPC timeout.
    pub async fn get_task_progress_from_nodes(
        &self,
        task_id: &str,
        nodes: &[NodeId],
    ) -> HashMap<NodeId, RpcResponse> {
        self.transport
            .call(
                nodes,
                WorkerRequest::GetNodeTaskProgress {
                    task_id: task_id.to_string(),
                },
                self.rpc_timeout,
            )
            .await
    }

    /// Running notices are fire-and-forget.
    pub async fn notify_grid_task_progress(&self, task_id: &str, progress: TaskProgress) {
        let targets = self.other_members();
        self.transport
            .cast(
                &targets,
                WorkerRequest::SetGridTaskProgress {
                    task_id: task_id.to_string(),
                    progress,
                },
            )
            .await;
    }

    /// The final verdict waits for acknowledgements (or the timeout).
    pub async fn set_grid_task_progress_on_nodes(&self, task_id: &str, progress: TaskProgress) {
        let targets = self.other_members();
        let responses = self
            .transport
            .call(
                &targets,
                WorkerRequest::SetGridTaskProgress {
                    task_id: task_id.to_string(),
                    progress,
                },
                self.rpc_timeout,
            )
            .await;
        log_unacknowledged("setGridTaskProgress", &responses);
    }

    pub async fn clear_task_status_on_nodes(&self, task_id: &str) {
        let targets = self.transport.cluster_members();
        let responses = self
            .transport
            .call(
                &targets,
                WorkerRequest::ClearTaskStatus {
                    task_id: task_id.to_string(),
                },
                self.rpc_timeout,
            )
            .await;
        log_unacknowledged("clearTaskStatus", &responses);
    }

    pub async fn set_pipeline_done_on_nodes(&self, pipeline_id: &str, result: PipelineResult) {
        let targets = self.other_members();
        let responses = self
            .transport
            .call(
                &targets,
                WorkerRequest::SetPipelineDone {
                    pipeline_id: pipeline_id.to_string(),
                    result,
                },
                self.rpc_timeout,
            )
            .await;
        log_unacknowledged("setPipelineDone", &responses);
    }

    /// Anycast to the current coordinator.
    pub async fn stop_pipeline_on_coordinator(&self, pipeline_id: &str) -> bool {
        let Some(coordinator) = self.transport.coordinator() else {
            return false;
        };

        let responses = self
            .transport
            .call(
                std::slice::from_ref(&coordinator),
                WorkerRequest::StopPipeline {
                    pipeline_id: pipeline_id.to_string(),
                },
                self.rpc_timeout,
            )
            .await;

        responses
            .get(&coordinator)
            .map(RpcResponse::was_received)
            .unwrap_or(false)
    }
}

fn log_unacknowledged(method: &str, responses: &HashMap<NodeId, RpcResponse>) {
    for (node, response) in responses {
        if !response.was_received() {
            tracing::warn!("{} not acknowledged by {}: {:?}", method, node, response);
        }
    }
}
