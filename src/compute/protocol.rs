//! Worker RPC Definitions
//!
//! Every remote operation a coordinator can invoke on a worker is a variant of
//! [`WorkerRequest`]; the worker answers with a [`WorkerResponse`].

use super::types::{ExecutionMode, TaskProgress};
use crate::pipeline::types::PipelineResult;
use serde::{Deserialize, Serialize};

/// What a worker needs to start a task it has registered locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSpec {
    pub id: String,
    pub mode: ExecutionMode,
    pub once: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WorkerRequest {
    StartNodeTask(TaskSpec),
    StopNodeTask { task_id: String },
    GetNodeTaskProgress { task_id: String },
    SetGridTaskProgress { task_id: String, progress: TaskProgress },
    ClearTaskStatus { task_id: String },
    SetPipelineDone { pipeline_id: String, result: PipelineResult },
    StopPipeline { pipeline_id: String },
}

impl WorkerRequest {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerRequest::StartNodeTask(_) => "startNodeTask",
            WorkerRequest::StopNodeTask { .. } => "stopNodeTask",
            WorkerRequest::GetNodeTaskProgress { .. } => "getNodeTaskProgress",
            WorkerRequest::SetGridTaskProgress { .. } => "setGridTaskProgress",
            WorkerRequest::ClearTaskStatus { .. } => "clearTaskStatus",
            WorkerRequest::SetPipelineDone { .. } => "setPipelineDone",
            WorkerRequest::StopPipeline { .. } => "stopPipeline",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WorkerResponse {
    Ack,
    Progress(TaskProgress),
}
