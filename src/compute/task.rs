//! Task Abstraction
//!
//! A task is anything with an id and an `execute(context) -> result` body.
//! Closures are the common case ([`FnTask`]); implement [`GridTask`] directly
//! for tasks that need their own stop handling or aggregation.

use super::protocol::TaskSpec;
use super::types::{ExecutionMode, TaskState, TaskStatus};
use crate::grid::context::GridContext;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

#[async_trait]
pub trait GridTask: Send + Sync {
    fn id(&self) -> &str;

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::SingleNode
    }

    /// A run-once task is never re-executed after it reached a terminal state.
    fn is_once(&self) -> bool {
        false
    }

    async fn execute(&self, context: GridContext) -> Result<Option<Value>>;

    /// Cooperative stop request. Execution is not preempted; the body has to notice.
    fn stop(&self) {}

    /// Combines per-node outcomes into the cluster-wide one.
    fn aggregate(&self, statuses: &[TaskStatus]) -> TaskStatus {
        first_completed_or_failed(statuses)
    }

    fn spec(&self) -> TaskSpec {
        TaskSpec {
            id: self.id().to_string(),
            mode: self.execution_mode(),
            once: self.is_once(),
        }
    }
}

/// Default aggregation: the first COMPLETED status wins, otherwise FAILED.
pub fn first_completed_or_failed(statuses: &[TaskStatus]) -> TaskStatus {
    if let Some(completed) = statuses
        .iter()
        .find(|status| status.state == TaskState::Completed)
    {
        return completed.clone();
    }

    let errors: Vec<&str> = statuses
        .iter()
        .filter_map(|status| status.error.as_deref())
        .collect();

    if errors.is_empty() {
        TaskStatus::failed("No node completed the task")
    } else {
        TaskStatus::failed(errors.join("; "))
    }
}

pub type TaskBodyFn = Arc<
    dyn Fn(GridContext) -> Pin<Box<dyn Future<Output = Result<Option<Value>>> + Send>>
        + Send
        + Sync,
>;

pub type StopFn = Arc<dyn Fn() + Send + Sync>;

/// Closure-backed task.
pub struct FnTask {
    id: String,
    mode: ExecutionMode,
    once: bool,
    body: TaskBodyFn,
    on_stop: Option<StopFn>,
}

impl FnTask {
    pub fn new<F, Fut>(id: impl Into<String>, body: F) -> Self
    where
        F: Fn(GridContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        let body: TaskBodyFn = Arc::new(move |context: GridContext| {
            Box::pin(body(context)) as Pin<Box<dyn Future<Output = Result<Option<Value>>> + Send>>
        });

        Self {
            id: id.into(),
            mode: ExecutionMode::SingleNode,
            once: false,
            body,
            on_stop: None,
        }
    }

    pub fn all_nodes(mut self) -> Self {
        self.mode = ExecutionMode::AllNodes;
        self
    }

    pub fn single_node(mut self) -> Self {
        self.mode = ExecutionMode::SingleNode;
        self
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn on_stop<F>(mut self, on_stop: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_stop = Some(Arc::new(on_stop));
        self
    }

    pub fn into_task(self) -> Arc<dyn GridTask> {
        Arc::new(self)
    }
}

#[async_trait]
impl GridTask for FnTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    fn is_once(&self) -> bool {
        self.once
    }

    async fn execute(&self, context: GridContext) -> Result<Option<Value>> {
        (self.body)(context).await
    }

    fn stop(&self) {
        if let Some(on_stop) = &self.on_stop {
            on_stop();
        }
    }
}
