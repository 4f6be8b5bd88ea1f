use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a task on one node, or of the whole task cluster-wide.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running)
    }

    /// True once the task reached COMPLETED or FAILED.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TaskState::Completed)
    }

    pub fn has_ran(&self) -> bool {
        self.is_terminal()
    }

    /// Aggregation rank: COMPLETED > FAILED > not yet terminal.
    pub fn rank(&self) -> u8 {
        match self {
            TaskState::Completed => 2,
            TaskState::Failed => 1,
            TaskState::Pending | TaskState::Running => 0,
        }
    }
}

/// Whether a task runs on the coordinator only or on every member.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    SingleNode,
    AllNodes,
}

/// Immutable outcome record. A transition replaces it with a new value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatus {
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl TaskStatus {
    pub fn new(state: TaskState) -> Self {
        Self {
            state,
            result: None,
            error: None,
        }
    }

    pub fn pending() -> Self {
        Self::new(TaskState::Pending)
    }

    pub fn running() -> Self {
        Self::new(TaskState::Running)
    }

    pub fn completed(result: Option<Value>) -> Self {
        Self {
            state: TaskState::Completed,
            result,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: TaskState::Failed,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// A task status plus the wall-clock time (ms) of its last heartbeat.
///
/// `last_heartbeat` is `None` when the reporting node knows nothing about the
/// task yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskProgress {
    pub status: TaskStatus,
    pub last_heartbeat: Option<u64>,
}

impl TaskProgress {
    /// Progress stamped with the current time.
    pub fn now(status: TaskStatus) -> Self {
        Self {
            status,
            last_heartbeat: Some(now_ms()),
        }
    }

    pub fn unknown() -> Self {
        Self {
            status: TaskStatus::pending(),
            last_heartbeat: None,
        }
    }

    pub fn state(&self) -> TaskState {
        self.status.state
    }

    /// Stale when no heartbeat arrived within `expiry_ms` of `since`
    /// (task start) or of the last heartbeat, whichever is later.
    pub fn is_stale(&self, since: u64, now: u64, expiry_ms: u64) -> bool {
        let reference = self.last_heartbeat.unwrap_or(0).max(since);
        now.saturating_sub(reference) > expiry_ms
    }

    /// "Most recent wins" ordering used when a newer broadcast may race an older one.
    pub fn supersedes(&self, other: &TaskProgress) -> bool {
        match (self.last_heartbeat, other.last_heartbeat) {
            (Some(mine), Some(theirs)) if mine != theirs => mine > theirs,
            (None, Some(_)) => false,
            _ => self.state().is_terminal() || !other.state().is_terminal(),
        }
    }
}

/// Current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
