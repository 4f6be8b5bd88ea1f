//! Node-side Task Runner
//!
//! Every node owns one `Worker`. It is the target of all worker RPCs: it
//! starts registered tasks, keeps their progress fresh with a heartbeat, and
//! stores the verdicts and signals coordinators push to it.
//!
//! ## Responsibilities
//! - **Execution**: a start request launches the task body on its own tokio task;
//!   panics and errors become FAILED, never propagate.
//! - **Heartbeat**: a sidecar task refreshes `last_heartbeat` while the body runs and
//!   forwards stop requests to the task.
//! - **Retention**: terminal progress and terminal coordinator verdicts are dropped
//!   after a grace period.
//! - **Stop requests**: only recorded for a registered task, so a stop that lands
//!   after `clear_task_status` cannot leak into the next run of the same id.

use super::protocol::{TaskSpec, WorkerRequest, WorkerResponse};
use super::registry::TaskRegistry;
use super::task::GridTask;
use super::types::{TaskProgress, TaskStatus, now_ms};
use crate::config::GridConfig;
use crate::grid::context::GridContext;
use crate::grid::service::Grid;
use crate::membership::types::NodeId;
use crate::pipeline::types::PipelineResult;

use anyhow::Result;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, Weak};

pub struct Worker {
    node_id: NodeId,
    config: GridConfig,
    grid: Weak<Grid>,
    registry: TaskRegistry,
    /// Starts that arrived before the task was registered on this node.
    pending_starts: DashMap<String, TaskSpec>,
    local_progress: Arc<DashMap<String, TaskProgress>>,
    stop_requests: Arc<DashSet<String>>,
    /// Last verdict the coordinator pushed, per task.
    grid_progress: Arc<DashMap<String, TaskProgress>>,
    pipeline_stops: DashSet<String>,
    pipeline_done: DashMap<String, PipelineResult>,
}

impl Worker {
    pub(crate) fn new(node_id: NodeId, config: GridConfig, grid: Weak<Grid>) -> Self {
        Self {
            node_id,
            config,
            grid,
            registry: TaskRegistry::new(),
            pending_starts: DashMap::new(),
            local_progress: Arc::new(DashMap::new()),
            stop_requests: Arc::new(DashSet::new()),
            grid_progress: Arc::new(DashMap::new()),
            pipeline_stops: DashSet::new(),
            pipeline_done: DashMap::new(),
        }
    }

    /// Typed dispatch of an incoming worker RPC.
    pub fn handle(&self, request: WorkerRequest) -> Result<WorkerResponse> {
        tracing::trace!("{} handling {}", self.node_id, request.name());

        match request {
            WorkerRequest::StartNodeTask(spec) => {
                self.start_node_task(spec);
                Ok(WorkerResponse::Ack)
            }
            WorkerRequest::StopNodeTask { task_id } => {
                self.stop_node_task(&task_id);
                Ok(WorkerResponse::Ack)
            }
            WorkerRequest::GetNodeTaskProgress { task_id } => {
                Ok(WorkerResponse::Progress(self.node_task_progress(&task_id)))
            }
            WorkerRequest::SetGridTaskProgress { task_id, progress } => {
                self.set_grid_task_progress(&task_id, progress);
                Ok(WorkerResponse::Ack)
            }
            WorkerRequest::ClearTaskStatus { task_id } => {
                self.clear_task_status(&task_id);
                Ok(WorkerResponse::Ack)
            }
            WorkerRequest::SetPipelineDone {
                pipeline_id,
                result,
            } => {
                self.set_pipeline_done(&pipeline_id, result);
                Ok(WorkerResponse::Ack)
            }
            WorkerRequest::StopPipeline { pipeline_id } => {
                self.request_pipeline_stop(&pipeline_id);
                Ok(WorkerResponse::Ack)
            }
        }
    }

    // --- Tasks ---

    /// Makes a task startable on this node. A start that arrived earlier is honored now.
    pub fn register_task(&self, task: Arc<dyn GridTask>) {
        let task_id = task.id().to_string();
        self.registry.register(task.clone());

        if self.pending_starts.remove(&task_id).is_some() {
            tracing::debug!("Task {} registered after its start request", task_id);
            self.launch(task);
        }
    }

    pub fn start_node_task(&self, spec: TaskSpec) {
        if let Some(task) = self.registry.get(&spec.id) {
            self.launch(task);
            return;
        }

        let task_id = spec.id.clone();
        tracing::debug!(
            "Task {} not registered on {} yet, parking start",
            task_id,
            self.node_id
        );
        self.pending_starts.insert(task_id.clone(), spec);

        // Registration may have raced the insert above.
        if let Some(task) = self.registry.get(&task_id)
            && self.pending_starts.remove(&task_id).is_some()
        {
            self.launch(task);
        }
    }

    fn launch(&self, task: Arc<dyn GridTask>) {
        let task_id = task.id().to_string();

        match self.local_progress.entry(task_id.clone()) {
            Entry::Occupied(existing) => {
                tracing::debug!(
                    "Task {} already {:?} on {}, ignoring start",
                    task_id,
                    existing.get().state(),
                    self.node_id
                );
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(TaskProgress::now(TaskStatus::running()));
            }
        }

        let Some(grid) = self.grid.upgrade() else {
            self.local_progress.insert(
                task_id,
                TaskProgress::now(TaskStatus::failed("Grid is shutting down")),
            );
            return;
        };
        let context = GridContext::new(grid);

        tracing::info!("Starting task {} on {}", task_id, self.node_id);

        let heartbeat = self.spawn_heartbeat(task.clone());
        let local_progress = self.local_progress.clone();
        let cleanup_delay = self.config.progress_cleanup_delay();
        let node_id = self.node_id.clone();

        tokio::spawn(async move {
            let body = {
                let task = task.clone();
                tokio::spawn(async move { task.execute(context).await })
            };

            let status = match body.await {
                Ok(Ok(result)) => {
                    tracing::info!("Task {} completed on {}", task_id, node_id);
                    TaskStatus::completed(result)
                }
                Ok(Err(e)) => {
                    tracing::warn!("Task {} failed on {}: {:#}", task_id, node_id, e);
                    TaskStatus::failed(format!("{:#}", e))
                }
                Err(e) => {
                    tracing::error!("Task {} panicked on {}: {}", task_id, node_id, e);
                    TaskStatus::failed(format!("Task panicked: {}", e))
                }
            };

            heartbeat.abort();

            let progress = TaskProgress::now(status);
            let finished_at = progress.last_heartbeat;
            local_progress.insert(task_id.clone(), progress);

            forget_after(local_progress, task_id, finished_at, cleanup_delay);
        });
    }

    /// Refreshes the heartbeat of a running task and relays a stop request once.
    fn spawn_heartbeat(&self, task: Arc<dyn GridTask>) -> tokio::task::JoinHandle<()> {
        let local_progress = self.local_progress.clone();
        let stop_requests = self.stop_requests.clone();
        let interval = self.config.task_heartbeat_interval();

        tokio::spawn(async move {
            let task_id = task.id().to_string();
            let mut stop_relayed = false;

            loop {
                tokio::time::sleep(interval).await;

                if let Some(mut progress) = local_progress.get_mut(&task_id)
                    && progress.state().is_running()
                {
                    progress.last_heartbeat = Some(now_ms());
                }

                if !stop_relayed && stop_requests.contains(&task_id) {
                    tracing::info!("Relaying stop request to task {}", task_id);
                    task.stop();
                    stop_relayed = true;
                }
            }
        })
    }

    /// Records a stop for a task registered here. Anything else is dropped.
    pub fn stop_node_task(&self, task_id: &str) {
        self.stop_requests.insert(task_id.to_string());

        // Re-checked after the insert: `clear_task_status` unregisters first.
        if !self.registry.has_task(task_id) {
            self.stop_requests.remove(task_id);
            tracing::debug!(
                "Ignoring stop for task {} on {}: not registered",
                task_id,
                self.node_id
            );
            return;
        }
        tracing::debug!("Stop requested for task {} on {}", task_id, self.node_id);
    }

    pub fn is_stop_requested(&self, task_id: &str) -> bool {
        self.stop_requests.contains(task_id)
    }

    /// Local progress, or PENDING without heartbeat when this node never ran the task.
    pub fn node_task_progress(&self, task_id: &str) -> TaskProgress {
        self.local_progress
            .get(task_id)
            .map(|progress| progress.value().clone())
            .unwrap_or_else(TaskProgress::unknown)
    }

    /// Stores a coordinator verdict unless a more recent one is already here.
    /// A terminal verdict nobody takes is dropped after the cleanup delay.
    pub fn set_grid_task_progress(&self, task_id: &str, progress: TaskProgress) {
        let terminal_at = progress
            .state()
            .is_terminal()
            .then_some(progress.last_heartbeat);

        let stored = match self.grid_progress.entry(task_id.to_string()) {
            Entry::Occupied(mut current) => {
                let newer = progress.supersedes(current.get());
                if newer {
                    current.insert(progress);
                }
                newer
            }
            Entry::Vacant(slot) => {
                slot.insert(progress);
                true
            }
        };

        if stored && let Some(finished_at) = terminal_at {
            forget_after(
                self.grid_progress.clone(),
                task_id.to_string(),
                finished_at,
                self.config.progress_cleanup_delay(),
            );
        }
    }

    pub fn grid_task_progress(&self, task_id: &str) -> Option<TaskProgress> {
        self.grid_progress
            .get(task_id)
            .map(|progress| progress.value().clone())
    }

    /// Removes and returns the verdict if it is terminal.
    pub fn take_terminal_grid_task_progress(&self, task_id: &str) -> Option<TaskProgress> {
        self.grid_progress
            .remove_if(task_id, |_, progress| progress.state().is_terminal())
            .map(|(_, progress)| progress)
    }

    pub fn clear_task_status(&self, task_id: &str) {
        tracing::debug!("Clearing status of task {} on {}", task_id, self.node_id);
        self.registry.remove(task_id);
        self.stop_requests.remove(task_id);
        self.local_progress.remove(task_id);
        self.pending_starts.remove(task_id);
    }

    pub fn registered_tasks(&self) -> Vec<String> {
        self.registry.list_tasks()
    }

    pub fn running_task_count(&self) -> usize {
        self.local_progress
            .iter()
            .filter(|entry| entry.value().state().is_running())
            .count()
    }

    // --- Pipelines ---

    pub fn request_pipeline_stop(&self, pipeline_id: &str) {
        tracing::info!("Stop requested for pipeline {}", pipeline_id);
        self.pipeline_stops.insert(pipeline_id.to_string());
    }

    pub fn take_pipeline_stop_request(&self, pipeline_id: &str) -> bool {
        self.pipeline_stops.remove(pipeline_id).is_some()
    }

    /// Drops terminal verdicts for the stages of a pipeline that has finished.
    pub fn discard_grid_task_progress<'a>(&self, task_ids: impl IntoIterator<Item = &'a str>) {
        for task_id in task_ids {
            self.take_terminal_grid_task_progress(task_id);
        }
    }

    pub fn set_pipeline_done(&self, pipeline_id: &str, result: PipelineResult) {
        self.pipeline_done.insert(pipeline_id.to_string(), result);
    }

    pub fn take_pipeline_done(&self, pipeline_id: &str) -> Option<PipelineResult> {
        self.pipeline_done
            .remove(pipeline_id)
            .map(|(_, result)| result)
    }
}

/// Removes a terminal record after `delay` unless a newer one replaced it.
fn forget_after(
    records: Arc<DashMap<String, TaskProgress>>,
    task_id: String,
    finished_at: Option<u64>,
    delay: std::time::Duration,
) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        records.remove_if(&task_id, |_, progress| {
            progress.state().is_terminal() && progress.last_heartbeat == finished_at
        });
    });
}
