//! Local Task Registry
//!
//! Task bodies are closures and cannot travel over the wire. Each node keeps
//! the task objects it was handed, keyed by task id, and `startNodeTask`
//! carries only the id.

use super::task::GridTask;

use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, Arc<dyn GridTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the task under its id.
    pub fn register(&self, task: Arc<dyn GridTask>) {
        let id = task.id().to_string();
        if self.tasks.insert(id.clone(), task).is_none() {
            tracing::debug!("Registered task: {}", id);
        }
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<dyn GridTask>> {
        self.tasks.get(task_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, task_id: &str) -> Option<Arc<dyn GridTask>> {
        self.tasks.remove(task_id).map(|(_, task)| task)
    }

    pub fn list_tasks(&self) -> Vec<String> {
        self.tasks.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn has_task(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}
