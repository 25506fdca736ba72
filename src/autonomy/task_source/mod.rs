use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{debug, warn};

/// The explicit task that justifies running background cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TaskContext {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            priority: 0,
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// External queue of pending tasks consulted by the controller every tick.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// The task that should drive the current tick, if any. Must not remove
    /// it from the queue; completion is reported separately.
    async fn next_task(&self) -> Result<Option<TaskContext>>;
}

/// In-memory [`TaskSource`]: highest priority first, FIFO within a priority.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<TaskContext>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: TaskContext) {
        let Ok(mut tasks) = self.tasks.lock() else {
            warn!("task queue mutex poisoned, dropping task '{}'", task.id);
            return;
        };
        let pos = tasks
            .iter()
            .position(|t| t.priority < task.priority)
            .unwrap_or(tasks.len());
        debug!("Queued task '{}' at position {}", task.id, pos);
        tasks.insert(pos, task);
    }

    /// Remove a finished task. Returns `false` if it was not queued.
    pub fn complete(&self, id: &str) -> bool {
        let Ok(mut tasks) = self.tasks.lock() else {
            return false;
        };
        let before = tasks.len();
        tasks.retain(|t| t.id != id);
        tasks.len() != before
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskSource for TaskQueue {
    async fn next_task(&self) -> Result<Option<TaskContext>> {
        let tasks = self
            .tasks
            .lock()
            .map_err(|_| anyhow::anyhow!("task queue mutex poisoned"))?;
        Ok(tasks.front().cloned())
    }
}

#[cfg(test)]
mod tests;
