//! Job Execution Policies
//!
//! - **run_on_one**: the coordinator runs the job, other nodes skip it.
//! - **run_on_one_once**: same, unless the stored state says it already ran.
//! - **run_on_all**: every node runs its own copy under `<name>__NODE`. The
//!   coordinator wraps the whole thing in a persisted job named `<name>` that
//!   ends once every member reported; the other nodes wait on that wrapper.
//! - **run_on_all_once**: same, unless the wrapper already ran.

use super::executor::JobExecutor;
use super::listener::JobListener;
use super::types::{JOB_STATES_NAMESPACE, JobState, JobStateAtTime, node_job_name};
use crate::compute::types::now_ms;
use crate::error::GridResult;
use crate::grid::service::Grid;
use crate::grid::types::{GridMessage, ListenerId, MessageListener};
use crate::membership::types::NodeId;
use crate::storage::DurableMap;

use anyhow::Result;
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

#[derive(Clone)]
pub struct JobRunner {
    grid: Arc<Grid>,
    job_states: DurableMap<JobStateAtTime>,
}

impl JobRunner {
    pub fn new(grid: Arc<Grid>) -> Self {
        let job_states = DurableMap::new(grid.storage().clone(), JOB_STATES_NAMESPACE);
        Self { grid, job_states }
    }

    /// Stored terminal state of a job, if it ever finished.
    pub fn stored_terminal_state(&self, job_name: &str) -> GridResult<Option<JobState>> {
        Ok(self
            .job_states
            .get(job_name)?
            .map(|snapshot| snapshot.state)
            .filter(JobState::is_terminal))
    }

    pub async fn run_on_one<Fut>(&self, job_name: &str, job: Fut) -> GridResult<JobState>
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if !self.grid.is_coordinator() {
            tracing::debug!("Not the coordinator, skipping job {}", job_name);
            return Ok(JobState::Idle);
        }

        JobExecutor::new(self.grid.clone(), job_name)
            .persist_state(true)
            .execute(job)
            .await
    }

    pub async fn run_on_one_once<Fut>(&self, job_name: &str, job: Fut) -> GridResult<JobState>
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if !self.grid.is_coordinator() {
            tracing::debug!("Not the coordinator, skipping job {}", job_name);
            return Ok(JobState::Idle);
        }

        if let Some(state) = self.stored_terminal_state(job_name)? {
            tracing::info!("Job {} already ran ({:?}), skipping", job_name, state);
            return Ok(state);
        }

        self.run_on_one(job_name, job).await
    }

    pub async fn run_on_all<Fut>(&self, job_name: &str, job: Fut) -> GridResult<JobState>
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self.grid.is_coordinator() {
            self.run_on_all_as_coordinator(job_name, job).await
        } else {
            self.run_on_all_as_member(job_name, job).await
        }
    }

    pub async fn run_on_all_once<Fut>(&self, job_name: &str, job: Fut) -> GridResult<JobState>
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if let Some(state) = self.stored_terminal_state(job_name)? {
            tracing::info!("Job {} already ran ({:?}), skipping", job_name, state);
            return Ok(state);
        }

        self.run_on_all(job_name, job).await
    }

    async fn run_on_all_as_coordinator<Fut>(&self, job_name: &str, job: Fut) -> GridResult<JobState>
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let node_job = node_job_name(job_name);
        let tracker = NodeStateTracker::start(self.grid.clone(), &node_job);
        let local = JobExecutor::new(self.grid.clone(), &node_job);
        let grid = self.grid.clone();
        let wrapper_name = job_name.to_string();

        let whole_job = async move {
            let started_at = now_ms();
            local.execute(job).await?;

            let expiry = grid.config().heartbeat_expiry_ms;
            loop {
                let aggregate = aggregate_node_states(
                    &grid.members(),
                    &tracker.reports(),
                    started_at,
                    now_ms(),
                    expiry,
                );

                if aggregate.is_terminal() {
                    tracing::info!("All nodes done with {}: {:?}", wrapper_name, aggregate);
                    if aggregate == JobState::Completed {
                        return Ok(());
                    }
                    anyhow::bail!("No node completed job {}", wrapper_name);
                }

                grid.pause(grid.config().wait_poll_interval(), &wrapper_name)
                    .await?;
            }
        };

        JobExecutor::new(self.grid.clone(), job_name)
            .persist_state(true)
            .execute(whole_job)
            .await
    }

    async fn run_on_all_as_member<Fut>(&self, job_name: &str, job: Fut) -> GridResult<JobState>
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let node_job = node_job_name(job_name);
        let listener = JobListener::start_listening(self.grid.clone(), job_name);

        let local_state = JobExecutor::new(self.grid.clone(), &node_job)
            .execute(job)
            .await?;

        // The coordinator may have started tracking after our terminal broadcast.
        let announcer = self.spawn_announcer(&node_job, local_state);
        let outcome = listener.wait_for_completion().await;
        announcer.abort();

        outcome
    }

    fn spawn_announcer(&self, node_job: &str, state: JobState) -> tokio::task::JoinHandle<()> {
        let grid = self.grid.clone();
        let node_job = node_job.to_string();
        let interval = self.grid.config().job_heartbeat_interval();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let snapshot = JobStateAtTime::new(&node_job, state, grid.node_id().as_str());
                if let Err(e) = grid.send(GridMessage::JobState(snapshot)).await {
                    tracing::trace!("Re-announcing {} failed: {}", node_job, e);
                }
            }
        })
    }
}

/// Collects the latest per-node snapshot of one job name.
pub struct NodeStateTracker {
    grid: Arc<Grid>,
    listener_id: ListenerId,
    reports: Arc<DashMap<String, JobStateAtTime>>,
}

impl NodeStateTracker {
    pub fn start(grid: Arc<Grid>, job_name: &str) -> Self {
        let reports: Arc<DashMap<String, JobStateAtTime>> = Arc::new(DashMap::new());

        let sink = reports.clone();
        let name = job_name.to_string();
        let listener: Arc<dyn MessageListener> =
            Arc::new(move |_from: &NodeId, message: &GridMessage| {
                if let GridMessage::JobState(snapshot) = message
                    && snapshot.job_name == name
                {
                    let keep_existing = sink
                        .get(&snapshot.node_name)
                        .is_some_and(|existing| existing.state.is_terminal());
                    if !keep_existing {
                        sink.insert(snapshot.node_name.clone(), snapshot.clone());
                    }
                }
            });
        let listener_id = grid.add_listener(listener);

        Self {
            grid,
            listener_id,
            reports,
        }
    }

    pub fn reports(&self) -> HashMap<String, JobStateAtTime> {
        self.reports
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl Drop for NodeStateTracker {
    fn drop(&mut self) {
        self.grid.remove_listener(self.listener_id);
    }
}

/// Cluster-wide state of an all-node job.
///
/// RUNNING while any member is unreported or still running within its expiry
/// window. Otherwise the highest-ranked state across members: a single
/// COMPLETED member makes the whole job COMPLETED. Members that never reported
/// or went silent count as not having run.
pub fn aggregate_node_states(
    members: &[NodeId],
    reports: &HashMap<String, JobStateAtTime>,
    started_at: u64,
    now: u64,
    expiry_ms: u64,
) -> JobState {
    let mut best = JobState::Idle;

    for member in members {
        let state = match reports.get(member.as_str()) {
            Some(report) if report.state.is_terminal() => report.state,
            Some(report) => {
                if now.saturating_sub(report.time.max(started_at)) <= expiry_ms {
                    return JobState::Running;
                }
                JobState::Idle
            }
            None => {
                if now.saturating_sub(started_at) <= expiry_ms {
                    return JobState::Running;
                }
                JobState::Idle
            }
        };

        if state.rank() > best.rank() {
            best = state;
        }
    }

    match best {
        JobState::Completed => JobState::Completed,
        _ => JobState::Failed,
    }
}
