//! Cluster-wide Task Tracking
//!
//! The coordinator dispatches a task, then polls the nodes it runs on until
//! every one of them is done, stale, unreachable or out of time. The
//! aggregated outcome is persisted, pushed to the other nodes and only then
//! returned. Other nodes wait for that pushed verdict.

use super::dispatcher::WorkDispatcher;
use super::protocol::{TaskSpec, WorkerResponse};
use super::task::GridTask;
use super::types::{TaskProgress, TaskStatus, now_ms};
use crate::error::{GridError, GridResult};
use crate::grid::service::Grid;
use crate::membership::types::NodeId;
use crate::storage::DurableMap;
use crate::transport::RpcResponse;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub const TASK_STATES_NAMESPACE: &str = "__taskStates";

#[derive(Clone)]
pub struct WorkCoordinator {
    grid: Arc<Grid>,
    dispatcher: WorkDispatcher,
    task_states: DurableMap<TaskStatus>,
}

impl WorkCoordinator {
    pub fn new(grid: Arc<Grid>) -> Self {
        let dispatcher = WorkDispatcher::new(grid.transport().clone(), grid.config().rpc_timeout());
        let task_states = DurableMap::new(grid.storage().clone(), TASK_STATES_NAMESPACE);
        Self {
            grid,
            dispatcher,
            task_states,
        }
    }

    pub fn dispatcher(&self) -> &WorkDispatcher {
        &self.dispatcher
    }

    /// Last persisted cluster-wide status of a task.
    pub fn stored_status(&self, task_id: &str) -> GridResult<Option<TaskStatus>> {
        self.task_states.get(task_id)
    }

    pub async fn execute_task(&self, task: Arc<dyn GridTask>) -> GridResult<TaskStatus> {
        self.grid.worker().register_task(task.clone());

        if self.grid.is_coordinator() {
            self.coordinate(task).await
        } else {
            self.await_verdict(task).await
        }
    }

    /// Asks every node to stop the task. Running bodies are told once; waiters stop waiting.
    pub async fn stop_task(&self, task_id: &str) {
        tracing::info!("Stopping task {} on all nodes", task_id);
        self.dispatcher.stop_task_on_nodes(task_id).await;
    }

    async fn await_verdict(&self, task: Arc<dyn GridTask>) -> GridResult<TaskStatus> {
        let task_id = task.id().to_string();
        let worker = self.grid.worker();
        let expiry = self.grid.config().heartbeat_expiry_ms;
        let waiting_since = now_ms();

        tracing::debug!("Waiting for coordinator verdict on task {}", task_id);

        loop {
            if let Some(verdict) = worker.take_terminal_grid_task_progress(&task_id) {
                tracing::debug!("Task {} ended {:?}", task_id, verdict.state());
                return Ok(verdict.status);
            }

            if worker.is_stop_requested(&task_id) {
                tracing::info!("Task {} stopped, no longer waiting", task_id);
                return Ok(TaskStatus::completed(None));
            }

            if self.grid.is_coordinator() {
                tracing::info!("Became coordinator while waiting on task {}", task_id);
                return self.coordinate(task).await;
            }

            let last_seen = worker
                .grid_task_progress(&task_id)
                .and_then(|progress| progress.last_heartbeat)
                .unwrap_or(0)
                .max(waiting_since);
            if now_ms().saturating_sub(last_seen) > expiry {
                tracing::warn!(
                    "No coordinator heartbeat for task {} within {} ms",
                    task_id,
                    expiry
                );
                return Err(GridError::CoordinatorExpired(task_id));
            }

            self.grid
                .pause(self.grid.config().wait_poll_interval(), &task_id)
                .await?;
        }
    }

    async fn coordinate(&self, task: Arc<dyn GridTask>) -> GridResult<TaskStatus> {
        let task_id = task.id().to_string();
        let stored = self.task_states.get(&task_id)?;

        if task.is_once()
            && let Some(status) = stored.as_ref().filter(|status| status.state.is_terminal())
        {
            tracing::info!(
                "Task {} already ran ({:?}), not running it again",
                task_id,
                status.state
            );
            self.publish_verdict(&task_id, status.clone()).await;
            return Ok(status.clone());
        }

        let resuming = stored
            .as_ref()
            .is_some_and(|status| status.state.is_running());
        self.task_states.put(&task_id, &TaskStatus::running())?;

        let spec = task.spec();
        if resuming {
            tracing::info!("Task {} already running, resuming tracking", task_id);
        } else {
            self.dispatcher.start_task_on_nodes(&spec).await;
        }

        let statuses = self.track(&spec).await?;
        let status = task.aggregate(&statuses);

        tracing::info!("Task {} finished cluster-wide: {:?}", task_id, status.state);
        self.task_states.put(&task_id, &status)?;
        self.publish_verdict(&task_id, status.clone()).await;

        Ok(status)
    }

    /// Polls until every target node is done. Returns one status per node,
    /// ordered by node id.
    async fn track(&self, spec: &TaskSpec) -> GridResult<Vec<TaskStatus>> {
        let config = self.grid.config();
        let expiry = config.heartbeat_expiry_ms;
        let started_at = now_ms();
        let deadline = started_at.saturating_add(config.max_task_duration_ms);

        let mut done: BTreeMap<NodeId, TaskStatus> = BTreeMap::new();
        let mut last_seen: HashMap<NodeId, u64> = HashMap::new();
        let mut round: u64 = 0;

        loop {
            let pending: Vec<NodeId> = self
                .dispatcher
                .target_nodes(spec.mode)
                .into_iter()
                .filter(|node| !done.contains_key(node))
                .collect();

            if pending.is_empty() {
                break;
            }

            if now_ms() > deadline {
                tracing::warn!(
                    "Task {} exceeded {} ms, giving up on {} node(s)",
                    spec.id,
                    config.max_task_duration_ms,
                    pending.len()
                );
                for node in pending {
                    done.insert(
                        node,
                        TaskStatus::failed(format!(
                            "Task timed out after {} ms",
                            config.max_task_duration_ms
                        )),
                    );
                }
                break;
            }

            self.dispatcher
                .notify_grid_task_progress(&spec.id, TaskProgress::now(TaskStatus::running()))
                .await;

            let responses = self
                .dispatcher
                .get_task_progress_from_nodes(&spec.id, &pending)
                .await;
            let now = now_ms();

            for node in pending {
                let response = responses.get(&node).cloned().unwrap_or(RpcResponse::NoResponse);
                match response {
                    RpcResponse::Received(WorkerResponse::Progress(progress)) => {
                        if let Some(heartbeat) = progress.last_heartbeat {
                            last_seen.insert(node.clone(), heartbeat);
                        }

                        if progress.state().is_terminal() {
                            tracing::debug!("{} reported {:?} for {}", node, progress.state(), spec.id);
                            done.insert(node, progress.status);
                        } else if progress.is_stale(started_at, now, expiry) {
                            tracing::warn!("{} missed heartbeats for task {}", node, spec.id);
                            done.insert(node.clone(), stale_status(&node, expiry));
                        } else if progress.last_heartbeat.is_none() && round > 0 {
                            tracing::debug!("{} has no trace of task {}, resending start", node, spec.id);
                            self.dispatcher.start_task_on_node(spec, &node).await;
                        }
                    }
                    RpcResponse::NoResponse => {
                        let reference = last_seen.get(&node).copied().unwrap_or(0).max(started_at);
                        if now.saturating_sub(reference) > expiry {
                            done.insert(node.clone(), stale_status(&node, expiry));
                        }
                    }
                    other => {
                        tracing::warn!("Progress pull from {} for {} failed: {:?}", node, spec.id, other);
                        done.insert(
                            node.clone(),
                            TaskStatus::failed(format!("Node {} did not report progress: {:?}", node, other)),
                        );
                    }
                }
            }

            round += 1;
            if self
                .dispatcher
                .target_nodes(spec.mode)
                .iter()
                .all(|node| done.contains_key(node))
            {
                break;
            }

            self.grid
                .pause(config.task_polling_interval(), &spec.id)
                .await?;
        }

        Ok(done.into_values().collect())
    }

    /// Pushes the verdict to the other nodes, then lets every node forget the run.
    async fn publish_verdict(&self, task_id: &str, status: TaskStatus) {
        self.dispatcher
            .set_grid_task_progress_on_nodes(task_id, TaskProgress::now(status))
            .await;
        self.dispatcher.clear_task_status_on_nodes(task_id).await;
    }
}

fn stale_status(node: &NodeId, expiry_ms: u64) -> TaskStatus {
    TaskStatus::failed(format!(
        "No heartbeat from node {} within {} ms",
        node, expiry_ms
    ))
}
