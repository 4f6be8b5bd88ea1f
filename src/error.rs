use thiserror::Error;

/// Errors surfaced by the coordination layer.
///
/// Task and job bodies never produce these directly: their failures are
/// captured as FAILED state. These cover invalid input, shutdown and
/// collaborator (transport, storage) failures.
#[derive(Debug, Error)]
pub enum GridError {
    #[error("invalid pipeline '{0}': {1}")]
    InvalidPipeline(String, String),

    #[error("wait for '{0}' interrupted by grid shutdown")]
    Interrupted(String),

    #[error("coordinator heartbeat for task '{0}' expired")]
    CoordinatorExpired(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type GridResult<T> = Result<T, GridError>;
