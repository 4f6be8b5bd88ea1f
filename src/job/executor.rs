//! Local Job Execution
//!
//! Runs one job body on this node and keeps the rest of the cluster informed:
//! a RUNNING snapshot on start, one per heartbeat interval while the body runs,
//! and a final COMPLETED or FAILED snapshot. With `persist_state` every
//! snapshot is written to the durable map before it is broadcast, so nodes
//! that were not listening can still read the outcome.

use super::types::{JOB_STATES_NAMESPACE, JobState, JobStateAtTime};
use crate::error::{GridError, GridResult};
use crate::grid::service::Grid;
use crate::grid::types::GridMessage;
use crate::storage::DurableMap;

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;

pub struct JobExecutor {
    grid: Arc<Grid>,
    job_name: String,
    persist_state: bool,
    job_states: DurableMap<JobStateAtTime>,
}

impl JobExecutor {
    pub fn new(grid: Arc<Grid>, job_name: &str) -> Self {
        let job_states = DurableMap::new(grid.storage().clone(), JOB_STATES_NAMESPACE);
        Self {
            grid,
            job_name: job_name.to_string(),
            persist_state: false,
            job_states,
        }
    }

    pub fn persist_state(mut self, persist: bool) -> Self {
        self.persist_state = persist;
        self
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Runs `job` to completion. The body's errors and panics become FAILED;
    /// only grid shutdown (and storage failures) surface as `Err`.
    pub async fn execute<Fut>(&self, job: Fut) -> GridResult<JobState>
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        tracing::info!("Job {} started on {}", self.job_name, self.grid.node_id());
        self.publish(JobState::Running).await?;

        let heartbeat = self.spawn_heartbeat();
        let mut body = tokio::spawn(job);

        let outcome = tokio::select! {
            _ = self.grid.shutdown_token().cancelled() => {
                body.abort();
                None
            }
            joined = &mut body => Some(joined),
        };

        heartbeat.abort();

        let state = match outcome {
            None => {
                tracing::warn!("Job {} interrupted by shutdown", self.job_name);
                self.publish(JobState::Failed).await?;
                return Err(GridError::Interrupted(self.job_name.clone()));
            }
            Some(Ok(Ok(()))) => JobState::Completed,
            Some(Ok(Err(e))) => {
                tracing::warn!("Job {} failed: {:#}", self.job_name, e);
                JobState::Failed
            }
            Some(Err(e)) => {
                tracing::error!("Job {} panicked: {}", self.job_name, e);
                JobState::Failed
            }
        };

        self.publish(state).await?;
        tracing::info!("Job {} ended {:?}", self.job_name, state);
        Ok(state)
    }

    async fn publish(&self, state: JobState) -> GridResult<()> {
        let snapshot = JobStateAtTime::new(&self.job_name, state, self.grid.node_id().as_str());
        if self.persist_state {
            self.job_states.put(&self.job_name, &snapshot)?;
        }
        if let Err(e) = self.grid.send(GridMessage::JobState(snapshot)).await {
            tracing::warn!("Broadcast of job {} state failed: {}", self.job_name, e);
        }
        Ok(())
    }

    fn spawn_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let grid = self.grid.clone();
        let job_states = self.persist_state.then(|| self.job_states.clone());
        let job_name = self.job_name.clone();
        let interval = self.grid.config().job_heartbeat_interval();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let snapshot =
                    JobStateAtTime::new(&job_name, JobState::Running, grid.node_id().as_str());
                if let Some(job_states) = &job_states
                    && let Err(e) = job_states.put(&job_name, &snapshot)
                {
                    tracing::warn!("Could not persist heartbeat of job {}: {}", job_name, e);
                }
                if let Err(e) = grid.send(GridMessage::JobState(snapshot)).await {
                    tracing::trace!("Heartbeat of job {} not sent: {}", job_name, e);
                }
            }
        })
    }
}
