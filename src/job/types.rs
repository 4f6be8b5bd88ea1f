use serde::{Deserialize, Serialize};

/// Durable namespace holding one `JobStateAtTime` per job name.
pub const JOB_STATES_NAMESPACE: &str = "__jobStates";

const NODE_JOB_SUFFIX: &str = "__NODE";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum JobState {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_running(&self) -> bool {
        matches!(self, JobState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn has_ran(&self) -> bool {
        self.is_terminal()
    }

    /// COMPLETED > FAILED > not yet ran.
    pub fn rank(&self) -> u8 {
        match self {
            JobState::Completed => 2,
            JobState::Failed => 1,
            JobState::Idle | JobState::Running => 0,
        }
    }
}

/// A job state snapshot as broadcast and persisted by the executing node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStateAtTime {
    pub job_name: String,
    pub state: JobState,
    /// Wall-clock milliseconds on the sending node.
    pub time: u64,
    pub node_name: String,
}

impl JobStateAtTime {
    pub fn new(job_name: &str, state: JobState, node_name: &str) -> Self {
        Self {
            job_name: job_name.to_string(),
            state,
            time: crate::compute::types::now_ms(),
            node_name: node_name.to_string(),
        }
    }
}

/// Name under which each node runs its own copy of an all-node job.
pub fn node_job_name(job_name: &str) -> String {
    format!("{}{}", job_name, NODE_JOB_SUFFIX)
}
