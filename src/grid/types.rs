use crate::job::types::JobStateAtTime;
use crate::membership::types::NodeId;
use serde::{Deserialize, Serialize};

/// Payloads carried by `Grid::send` / `Grid::send_to`.
///
/// Every registered listener sees every payload, so listeners match on the
/// variant and on the job name or topic they care about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GridMessage {
    /// Job executor snapshot (start, heartbeat, terminal).
    JobState(JobStateAtTime),
    /// Free-form client payload. The body is JSON text so the message stays
    /// encodable by non-self-describing codecs.
    Payload { topic: String, body: String },
}

impl GridMessage {
    pub fn payload<T: Serialize>(topic: &str, body: &T) -> serde_json::Result<Self> {
        Ok(Self::Payload {
            topic: topic.to_string(),
            body: serde_json::to_string(body)?,
        })
    }
}

/// Receives every payload delivered to the grid, synchronously.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, from: &NodeId, message: &GridMessage);
}

impl<F> MessageListener for F
where
    F: Fn(&NodeId, &GridMessage) + Send + Sync,
{
    fn on_message(&self, from: &NodeId, message: &GridMessage) {
        self(from, message)
    }
}

pub type ListenerId = u64;
