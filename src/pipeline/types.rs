use crate::compute::task::GridTask;
use crate::compute::types::{TaskState, TaskStatus};
use crate::grid::context::GridContext;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type StagePredicate = Arc<dyn Fn(&GridContext) -> bool + Send + Sync>;

/// One task plus its execution modifiers.
#[derive(Clone)]
pub struct Stage {
    task: Arc<dyn GridTask>,
    always: bool,
    only_if: Option<StagePredicate>,
}

impl Stage {
    pub fn new(task: Arc<dyn GridTask>) -> Self {
        Self {
            task,
            always: false,
            only_if: None,
        }
    }

    /// Run this stage even after a failure, a stop, or when resuming past it.
    pub fn always(mut self) -> Self {
        self.always = true;
        self
    }

    pub fn only_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&GridContext) -> bool + Send + Sync + 'static,
    {
        self.only_if = Some(Arc::new(predicate));
        self
    }

    pub fn task(&self) -> &Arc<dyn GridTask> {
        &self.task
    }

    pub fn is_always(&self) -> bool {
        self.always
    }

    /// Evaluates the `only_if` condition. A stage without one always qualifies.
    pub fn should_run(&self, context: &GridContext) -> bool {
        self.only_if
            .as_ref()
            .is_none_or(|predicate| predicate(context))
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("task", &self.task.id())
            .field("always", &self.always)
            .field("only_if", &self.only_if.is_some())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct Pipeline {
    id: String,
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(id: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            id: id.into(),
            stages,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }
}

/// Outcome of one `execute_pipeline` run, identical on every node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineResult {
    pub pipeline_id: String,
    /// COMPLETED unless a stage failed.
    pub state: TaskState,
    /// Index of the first stage that failed in this run.
    pub failed_stage: Option<usize>,
    pub stopped: bool,
    pub last_stage_status: Option<TaskStatus>,
}

impl PipelineResult {
    /// What a waiting node reports when it stops waiting on its own.
    pub fn stopped_waiting(pipeline_id: &str) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            state: TaskState::Completed,
            failed_stage: None,
            stopped: true,
            last_stage_status: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state.is_completed() && !self.stopped
    }
}
