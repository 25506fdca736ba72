/// Task tracker for managing background tasks
///
/// Provides centralized tracking, targeted abort, and cleanup of background
/// tasks spawned with `tokio::spawn`. The scheduler keys executions by
/// scheduled-task id so a single execution can be cancelled.
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct TaskTracker {
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Track an already-spawned task
    pub async fn spawn(&self, name: String, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().await;
        // If a task with this name already exists, abort it first
        if let Some(old_handle) = tasks.remove(&name) {
            warn!("Aborting existing task '{}' before tracking new one", name);
            old_handle.abort();
        }
        tasks.insert(name, handle);
    }

    /// Spawn a tracked background task that removes itself on completion
    pub async fn spawn_auto_cleanup<F>(&self, name: String, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let tasks = self.tasks.clone();
        let name_clone = name.clone();

        // Hold the lock while spawning and inserting: the spawned task removes
        // itself on completion, so the handle must be in the map before it can
        // finish.
        let mut tasks_guard = self.tasks.lock().await;
        let handle = tokio::spawn(async move {
            future.await;
            tasks.lock().await.remove(&name_clone);
            debug!("Task '{}' completed and removed from tracker", name_clone);
        });
        if let Some(old_handle) = tasks_guard.insert(name.clone(), handle) {
            warn!("Task '{}' was already tracked; aborting the previous run", name);
            old_handle.abort();
        }
    }

    /// Abort a single tracked task. Returns `true` if it was tracked.
    pub async fn abort(&self, name: &str) -> bool {
        let handle = self.tasks.lock().await.remove(name);
        match handle {
            Some(handle) => {
                handle.abort();
                debug!("Aborted task '{}'", name);
                true
            }
            None => false,
        }
    }

    /// Whether a task with this name is currently tracked
    pub async fn contains(&self, name: &str) -> bool {
        self.tasks.lock().await.contains_key(name)
    }

    /// Number of tracked tasks
    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Cancel all tracked tasks, returning the names that were aborted
    pub async fn cancel_all(&self) -> Vec<String> {
        let tasks: HashMap<String, JoinHandle<()>> = {
            let mut guard = self.tasks.lock().await;
            guard.drain().collect()
        };
        let mut names = Vec::with_capacity(tasks.len());
        for (name, handle) in tasks {
            handle.abort();
            debug!("Cancelled task '{}'", name);
            names.push(name);
        }
        if !names.is_empty() {
            info!("Cancelled {} tracked tasks", names.len());
        }
        names
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}
