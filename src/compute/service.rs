use super::coordinator::WorkCoordinator;
use super::task::GridTask;
use super::types::TaskStatus;
use crate::error::GridResult;
use crate::grid::service::Grid;
use crate::job::runner::JobRunner;
use crate::job::types::JobState;
use crate::pipeline::coordinator::PipelineCoordinator;
use crate::pipeline::types::{Pipeline, PipelineResult};

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;

/// Entry point for running work on the grid.
///
/// Every node of the cluster makes the same call; the coordinator drives and
/// the others follow. Cheap to construct, see [`Grid::compute`].
#[derive(Clone)]
pub struct GridCompute {
    grid: Arc<Grid>,
    jobs: JobRunner,
    work: WorkCoordinator,
    pipelines: PipelineCoordinator,
}

impl GridCompute {
    pub fn new(grid: Arc<Grid>) -> Self {
        let work = WorkCoordinator::new(grid.clone());
        Self {
            jobs: JobRunner::new(grid.clone()),
            pipelines: PipelineCoordinator::new(grid.clone(), work.clone()),
            work,
            grid,
        }
    }

    pub fn grid(&self) -> &Arc<Grid> {
        &self.grid
    }

    // --- Jobs ---

    pub async fn run_on_one<Fut>(&self, job_name: &str, job: Fut) -> GridResult<JobState>
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.jobs.run_on_one(job_name, job).await
    }

    pub async fn run_on_one_once<Fut>(&self, job_name: &str, job: Fut) -> GridResult<JobState>
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.jobs.run_on_one_once(job_name, job).await
    }

    pub async fn run_on_all<Fut>(&self, job_name: &str, job: Fut) -> GridResult<JobState>
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.jobs.run_on_all(job_name, job).await
    }

    pub async fn run_on_all_once<Fut>(&self, job_name: &str, job: Fut) -> GridResult<JobState>
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.jobs.run_on_all_once(job_name, job).await
    }

    // --- Tasks ---

    pub async fn execute_task(&self, task: Arc<dyn GridTask>) -> GridResult<TaskStatus> {
        self.work.execute_task(task).await
    }

    pub async fn stop_task(&self, task_id: &str) {
        self.work.stop_task(task_id).await
    }

    // --- Pipelines ---

    pub async fn execute_pipeline(&self, pipeline: &Pipeline) -> GridResult<PipelineResult> {
        self.pipelines.execute_pipeline(pipeline).await
    }

    pub async fn stop_pipeline(&self, pipeline_id: &str) -> bool {
        self.pipelines.stop_pipeline(pipeline_id).await
    }

    pub fn pipeline_active_stage_index(&self, pipeline_id: &str) -> GridResult<i64> {
        self.pipelines.active_stage_index(pipeline_id)
    }
}
