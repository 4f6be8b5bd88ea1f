//! Stage Sequencing
//!
//! The coordinator walks the stages in order, running each through the work
//! coordinator and checkpointing the active stage index in durable state.
//! Every other node registers the stage tasks and waits for the done signal.
//!
//! ## Checkpoint
//! - absent: start at stage 0
//! - `i >= 0`: stage `i` was active; stages before it are skipped unless `always`
//! - `-1`: the last run completed; the next run starts over at stage 0
//!
//! `-1` is written only when no stage failed and no stop arrived. A failed or
//! stopped run keeps the index of the stage it ended on, so the next run
//! resumes there rather than restarting from stage 0.

use super::types::{Pipeline, PipelineResult, Stage};
use crate::compute::coordinator::WorkCoordinator;
use crate::compute::types::{TaskState, TaskStatus};
use crate::error::{GridError, GridResult};
use crate::grid::service::Grid;
use crate::storage::DurableMap;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const PIPELINE_STAGES_NAMESPACE: &str = "__pipelineStages";

/// Checkpoint value of a completed pipeline.
pub const PIPELINE_COMPLETED: i64 = -1;

/// What to do with one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDirective {
    pub mark_active: bool,
    pub execute: bool,
    pub reason: &'static str,
}

impl StageDirective {
    fn new(mark_active: bool, execute: bool, reason: &'static str) -> Self {
        Self {
            mark_active,
            execute,
            reason,
        }
    }
}

/// First matching rule wins. `condition` is only evaluated when reached.
pub fn stage_directive(
    index: usize,
    start_index: usize,
    stop_requested: bool,
    earlier_failure: bool,
    always: bool,
    condition: impl FnOnce() -> bool,
) -> StageDirective {
    if stop_requested {
        return StageDirective::new(false, always, "pipeline stop requested");
    }
    if index < start_index {
        return StageDirective::new(false, always, "completed in a previous run");
    }
    if earlier_failure {
        return StageDirective::new(false, always, "an earlier stage failed");
    }
    if !condition() {
        return StageDirective::new(true, false, "condition not met");
    }
    StageDirective::new(true, true, "active")
}

#[derive(Clone)]
pub struct PipelineCoordinator {
    grid: Arc<Grid>,
    work: WorkCoordinator,
    active_stages: DurableMap<i64>,
}

impl PipelineCoordinator {
    pub fn new(grid: Arc<Grid>, work: WorkCoordinator) -> Self {
        let active_stages = DurableMap::new(grid.storage().clone(), PIPELINE_STAGES_NAMESPACE);
        Self {
            grid,
            work,
            active_stages,
        }
    }

    /// Persisted active stage index, `-1` when none.
    pub fn active_stage_index(&self, pipeline_id: &str) -> GridResult<i64> {
        Ok(self
            .active_stages
            .get(pipeline_id)?
            .unwrap_or(PIPELINE_COMPLETED))
    }

    pub async fn execute_pipeline(&self, pipeline: &Pipeline) -> GridResult<PipelineResult> {
        if pipeline.stages().is_empty() {
            return Err(GridError::InvalidPipeline(
                pipeline.id().to_string(),
                "a pipeline needs at least one stage".to_string(),
            ));
        }

        for stage in pipeline.stages() {
            self.grid.worker().register_task(stage.task().clone());
        }

        if self.grid.is_coordinator() {
            self.run(pipeline).await
        } else {
            self.await_done(pipeline).await
        }
    }

    /// Records a stop request on the coordinator. Returns whether it was delivered.
    pub async fn stop_pipeline(&self, pipeline_id: &str) -> bool {
        if self.grid.is_coordinator() {
            self.grid.worker().request_pipeline_stop(pipeline_id);
            return true;
        }
        self.work
            .dispatcher()
            .stop_pipeline_on_coordinator(pipeline_id)
            .await
    }

    async fn await_done(&self, pipeline: &Pipeline) -> GridResult<PipelineResult> {
        let pipeline_id = pipeline.id();
        let worker = self.grid.worker();
        tracing::debug!("Waiting for coordinator to finish pipeline {}", pipeline_id);

        loop {
            if let Some(result) = worker.take_pipeline_done(pipeline_id) {
                worker.discard_grid_task_progress(
                    pipeline.stages().iter().map(|stage| stage.task().id()),
                );
                return Ok(result);
            }

            if worker.take_pipeline_stop_request(pipeline_id) {
                tracing::info!("Stopped waiting for pipeline {}", pipeline_id);
                return Ok(PipelineResult::stopped_waiting(pipeline_id));
            }

            if self.grid.is_coordinator() {
                tracing::info!("Taking over pipeline {}", pipeline_id);
                return self.run(pipeline).await;
            }

            self.grid
                .pause(self.grid.config().wait_poll_interval(), pipeline_id)
                .await?;
        }
    }

    async fn run(&self, pipeline: &Pipeline) -> GridResult<PipelineResult> {
        let pipeline_id = pipeline.id();
        let start_index = match self.active_stages.get(pipeline_id)? {
            Some(index) if index > 0 => index as usize,
            _ => 0,
        };

        // A request left over from an earlier run does not apply to this one.
        self.grid.worker().take_pipeline_stop_request(pipeline_id);

        let stopped = Arc::new(AtomicBool::new(false));
        let active_task: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let monitor = self.spawn_stop_monitor(pipeline_id, stopped.clone(), active_task.clone());

        tracing::info!(
            "Running pipeline {} ({} stages) from stage {}",
            pipeline_id,
            pipeline.stages().len(),
            start_index
        );

        let outcome = self
            .run_stages(pipeline, start_index, &stopped, &active_task)
            .await;
        monitor.abort();

        let (failed_stage, last_stage_status, interrupted) = match outcome {
            Ok((failed_stage, last)) => (failed_stage, last, None),
            Err(e) => (None, None, Some(e)),
        };
        let was_stopped = stopped.load(Ordering::SeqCst);

        let result = PipelineResult {
            pipeline_id: pipeline_id.to_string(),
            state: if failed_stage.is_some() || interrupted.is_some() {
                TaskState::Failed
            } else {
                TaskState::Completed
            },
            failed_stage,
            stopped: was_stopped,
            last_stage_status,
        };

        if interrupted.is_none() && failed_stage.is_none() && !was_stopped {
            self.active_stages.put(pipeline_id, &PIPELINE_COMPLETED)?;
        }

        tracing::info!(
            "Pipeline {} ended {:?} (failed stage {:?}, stopped: {})",
            pipeline_id,
            result.state,
            result.failed_stage,
            result.stopped
        );

        self.work
            .dispatcher()
            .set_pipeline_done_on_nodes(pipeline_id, result.clone())
            .await;

        match interrupted {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    /// Returns the first failed stage and the status of the last stage run.
    async fn run_stages(
        &self,
        pipeline: &Pipeline,
        start_index: usize,
        stopped: &AtomicBool,
        active_task: &Mutex<Option<String>>,
    ) -> GridResult<(Option<usize>, Option<TaskStatus>)> {
        let pipeline_id = pipeline.id();
        let context = self.grid.context();
        let mut failed_stage: Option<usize> = None;
        let mut last_stage_status: Option<TaskStatus> = None;

        for (index, stage) in pipeline.stages().iter().enumerate() {
            let directive = stage_directive(
                index,
                start_index,
                stopped.load(Ordering::SeqCst),
                failed_stage.is_some(),
                stage.is_always(),
                || stage.should_run(&context),
            );

            if directive.mark_active {
                self.active_stages.put(pipeline_id, &(index as i64))?;
            }

            if !directive.execute {
                tracing::info!(
                    "Pipeline {} skipping stage {} ({}): {}",
                    pipeline_id,
                    index,
                    stage.task().id(),
                    directive.reason
                );
                continue;
            }

            tracing::info!(
                "Pipeline {} running stage {} ({}): {}",
                pipeline_id,
                index,
                stage.task().id(),
                directive.reason
            );

            let status = self.run_stage(stage, active_task).await?;
            if !status.state.is_completed() {
                tracing::warn!(
                    "Pipeline {} stage {} ended {:?}: {:?}",
                    pipeline_id,
                    index,
                    status.state,
                    status.error
                );
                failed_stage.get_or_insert(index);
            }
            last_stage_status = Some(status);
        }

        Ok((failed_stage, last_stage_status))
    }

    async fn run_stage(
        &self,
        stage: &Stage,
        active_task: &Mutex<Option<String>>,
    ) -> GridResult<TaskStatus> {
        set_active_task(active_task, Some(stage.task().id().to_string()));
        let outcome = self.work.execute_task(stage.task().clone()).await;
        set_active_task(active_task, None);

        match outcome {
            Ok(status) => Ok(status),
            Err(GridError::Interrupted(what)) => Err(GridError::Interrupted(what)),
            Err(e) => Ok(TaskStatus::failed(e.to_string())),
        }
    }

    fn spawn_stop_monitor(
        &self,
        pipeline_id: &str,
        stopped: Arc<AtomicBool>,
        active_task: Arc<Mutex<Option<String>>>,
    ) -> tokio::task::JoinHandle<()> {
        let grid = self.grid.clone();
        let work = self.work.clone();
        let pipeline_id = pipeline_id.to_string();
        let interval = self.grid.config().stop_monitor_interval();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                if !grid.worker().take_pipeline_stop_request(&pipeline_id) {
                    continue;
                }

                tracing::info!("Stopping pipeline {}", pipeline_id);
                stopped.store(true, Ordering::SeqCst);

                let task_id = active_task.lock().ok().and_then(|task| task.clone());
                if let Some(task_id) = task_id {
                    work.stop_task(&task_id).await;
                }
            }
        })
    }
}

fn set_active_task(active_task: &Mutex<Option<String>>, task_id: Option<String>) {
    if let Ok(mut current) = active_task.lock() {
        *current = task_id;
    }
}
