//! Remote Job Observation
//!
//! A `JobListener` follows a job that runs somewhere else. Broadcast snapshots
//! are the fast path. When the job goes quiet for longer than the poll
//! interval, the poller reads the durable snapshot instead, which covers a
//! sender that died before its terminal broadcast.

use super::types::{JOB_STATES_NAMESPACE, JobState, JobStateAtTime};
use crate::compute::types::now_ms;
use crate::error::{GridError, GridResult};
use crate::grid::service::Grid;
use crate::grid::types::{GridMessage, ListenerId, MessageListener};
use crate::membership::types::NodeId;
use crate::storage::DurableMap;

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy)]
struct Signal {
    state: JobState,
    received_at: u64,
}

pub struct JobListener {
    grid: Arc<Grid>,
    job_name: String,
    listener_id: ListenerId,
    state: watch::Receiver<Signal>,
    poller: tokio::task::JoinHandle<()>,
}

impl JobListener {
    pub fn start_listening(grid: Arc<Grid>, job_name: &str) -> Self {
        let started_at = now_ms();
        let (tx, rx) = watch::channel(Signal {
            state: JobState::Idle,
            received_at: started_at,
        });
        let tx = Arc::new(tx);

        let sender = tx.clone();
        let name = job_name.to_string();
        let listener: Arc<dyn MessageListener> =
            Arc::new(move |_from: &NodeId, message: &GridMessage| {
                if let GridMessage::JobState(snapshot) = message
                    && snapshot.job_name == name
                {
                    record(&sender, snapshot.state);
                }
            });
        let listener_id = grid.add_listener(listener);

        let poller = spawn_poller(&grid, job_name.to_string(), tx, started_at);

        tracing::debug!("Listening for job {}", job_name);

        Self {
            grid,
            job_name: job_name.to_string(),
            listener_id,
            state: rx,
            poller,
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn state(&self) -> JobState {
        self.state.borrow().state
    }

    /// Blocks until the job is COMPLETED or FAILED, then unregisters.
    pub async fn wait_for_completion(self) -> GridResult<JobState> {
        let mut state = self.state.clone();

        loop {
            let current = state.borrow_and_update().state;
            if current.is_terminal() {
                tracing::debug!("Job {} observed {:?}", self.job_name, current);
                return Ok(current);
            }

            tokio::select! {
                _ = self.grid.shutdown_token().cancelled() => {
                    tracing::warn!("Wait for job {} interrupted", self.job_name);
                    return Err(GridError::Interrupted(self.job_name.clone()));
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(GridError::Interrupted(self.job_name.clone()));
                    }
                }
            }
        }
    }
}

impl Drop for JobListener {
    fn drop(&mut self) {
        self.poller.abort();
        self.grid.remove_listener(self.listener_id);
    }
}

/// Terminal states are final; anything else just refreshes the arrival time.
fn record(sender: &watch::Sender<Signal>, state: JobState) {
    sender.send_if_modified(|current| {
        if current.state.is_terminal() {
            return false;
        }
        let changed = current.state != state;
        current.state = state;
        current.received_at = now_ms();
        changed
    });
}

fn spawn_poller(
    grid: &Grid,
    job_name: String,
    sender: Arc<watch::Sender<Signal>>,
    started_at: u64,
) -> tokio::task::JoinHandle<()> {
    let job_states: DurableMap<JobStateAtTime> =
        DurableMap::new(grid.storage().clone(), JOB_STATES_NAMESPACE);
    let interval = grid.config().job_poll_interval();
    let expiry = grid.config().heartbeat_expiry_ms;

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let current = *sender.borrow();
            if current.state.is_terminal() {
                break;
            }

            let now = now_ms();
            if now.saturating_sub(current.received_at) <= interval.as_millis() as u64 {
                continue;
            }

            let snapshot = match job_states.get(&job_name) {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Could not read stored state of job {}: {}", job_name, e);
                    continue;
                }
            };

            let fallback = if snapshot.state.is_running()
                && now.saturating_sub(snapshot.time) > expiry
            {
                JobState::Failed
            } else if snapshot.state.is_terminal() && snapshot.time >= started_at {
                snapshot.state
            } else {
                continue;
            };

            tracing::info!(
                "No signal for job {} since {} ms, stored state gives {:?}",
                job_name,
                now.saturating_sub(current.received_at),
                fallback
            );
            record(&sender, fallback);
        }
    })
}
