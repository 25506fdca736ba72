use crate::scheduler::task::{TaskArgs, TaskHandler};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Name → handler lookup used to rebuild persisted tasks.
///
/// Cloning shares the underlying map, so a registry handed to the
/// [`ScheduleStore`](crate::scheduler::ScheduleStore) sees handlers registered
/// later by the host process.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in `log` and `noop` handlers.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_builtins();
        registry
    }

    pub fn register(&self, handler: TaskHandler) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if handlers
            .insert(handler.name().to_string(), handler)
            .is_some()
        {
            warn!("Replaced previously registered task handler");
        }
    }

    pub fn get(&self, name: &str) -> Option<TaskHandler> {
        self.handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Look up a handler, degrading to a warning no-op when it is unknown.
    pub fn resolve(&self, name: &str) -> TaskHandler {
        self.get(name).unwrap_or_else(|| {
            warn!(
                "No handler registered for '{}'; loading as a no-op placeholder",
                name
            );
            TaskHandler::unresolved(name)
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn register_builtins(&self) {
        self.register(TaskHandler::new_async("log", |args: TaskArgs| async move {
            let message = args
                .kwarg("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Array(args.args.clone()).to_string());
            info!("[scheduled] {}", message);
            Ok(Value::String(message))
        }));
        self.register(TaskHandler::new_async("noop", |_| async { Ok(Value::Null) }));
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
