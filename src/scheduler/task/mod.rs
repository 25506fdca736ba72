//! Single-attempt unit of work.
//!
//! A [`Task`] binds a named handler to its arguments and a timeout. Running a
//! task never fails: handler errors, panics and timeouts are all folded into
//! the returned [`TaskResult`]. Retry policy fields are carried for the
//! scheduler to interpret; the task itself runs exactly once per call.

use crate::errors::{CadenceError, CadenceResult};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default per-execution timeout (5 minutes).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Arguments bound to a task and handed to its handler on every run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;
type AsyncHandlerFn = Arc<dyn Fn(TaskArgs) -> HandlerFuture + Send + Sync>;
type BlockingHandlerFn = Arc<dyn Fn(TaskArgs) -> Result<Value> + Send + Sync>;

#[derive(Clone)]
enum HandlerKind {
    Async(AsyncHandlerFn),
    Blocking(BlockingHandlerFn),
}

/// A named, cloneable reference to the code a task runs.
///
/// The name is what gets persisted; the store resolves it back to a handler
/// through a [`HandlerRegistry`](crate::scheduler::HandlerRegistry).
#[derive(Clone)]
pub struct TaskHandler {
    name: String,
    kind: HandlerKind,
}

impl TaskHandler {
    /// Handler backed by an async function, awaited on the scheduler runtime.
    pub fn new_async<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            kind: HandlerKind::Async(Arc::new(move |args| Box::pin(f(args)))),
        }
    }

    /// Handler backed by a blocking function, run on tokio's blocking pool so
    /// it cannot stall the scheduling loop.
    pub fn blocking<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskArgs) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: HandlerKind::Blocking(Arc::new(f)),
        }
    }

    /// Stand-in for a persisted handler name that nothing registered.
    /// Running it logs a warning and does nothing.
    pub fn unresolved(name: impl Into<String>) -> Self {
        let name = name.into();
        let label = name.clone();
        Self::new_async(name, move |_| {
            let label = label.clone();
            async move {
                warn!("Handler '{}' is not registered; skipping execution", label);
                Ok(Value::Null)
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, args: TaskArgs) -> Result<Value> {
        match &self.kind {
            HandlerKind::Async(f) => f(args).await,
            HandlerKind::Blocking(f) => {
                let f = f.clone();
                tokio::task::spawn_blocking(move || f(args))
                    .await
                    .map_err(|e| {
                        if e.is_panic() {
                            anyhow!("handler panicked: {}", panic_message(&e.into_panic()))
                        } else {
                            anyhow!("handler was cancelled")
                        }
                    })?
            }
        }
    }
}

impl std::fmt::Debug for TaskHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            HandlerKind::Async(_) => "async",
            HandlerKind::Blocking(_) => "blocking",
        };
        f.debug_struct("TaskHandler")
            .field("name", &self.name)
            .field("kind", &kind)
            .finish()
    }
}

pub type CallbackFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Per-task completion hook, invoked with the finished [`TaskResult`].
#[derive(Clone)]
pub enum TaskCallback {
    Sync(Arc<dyn Fn(&TaskResult) -> Result<()> + Send + Sync>),
    Async(Arc<dyn Fn(TaskResult) -> CallbackFuture + Send + Sync>),
}

impl TaskCallback {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&TaskResult) -> Result<()> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn new_async<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskResult) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::Async(Arc::new(move |result| Box::pin(f(result))))
    }

    async fn invoke(&self, result: &TaskResult) -> Result<()> {
        match self {
            Self::Sync(f) => std::panic::catch_unwind(AssertUnwindSafe(|| f(result)))
                .unwrap_or_else(|panic| {
                    Err(anyhow!("callback panicked: {}", panic_message(&panic)))
                }),
            Self::Async(f) => AssertUnwindSafe(f(result.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(anyhow!("callback panicked: {}", panic_message(&panic)))
                }),
        }
    }
}

impl std::fmt::Debug for TaskCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync(_) => write!(f, "TaskCallback::Sync"),
            Self::Async(_) => write!(f, "TaskCallback::Async"),
        }
    }
}

/// Outcome of one execution of a [`Task`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskResult {
    pub fn succeeded(value: Value, started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> Self {
        Self {
            success: true,
            result: Some(value),
            error: None,
            started_at: Some(started_at),
            completed_at: Some(completed_at),
        }
    }

    pub fn failed(
        error: impl Into<String>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            started_at: Some(started_at),
            completed_at: Some(completed_at),
        }
    }

    /// Wall time of the execution, if both timestamps are known.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Serializable form of a [`Task`]; the handler is stored by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub name: String,
    pub handler: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_delay_secs: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

fn default_timeout_secs() -> f64 {
    DEFAULT_TIMEOUT.as_secs_f64()
}

#[derive(Clone)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub handler: TaskHandler,
    pub args: TaskArgs,
    pub timeout: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub tags: BTreeSet<String>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub on_success: Option<TaskCallback>,
    pub on_failure: Option<TaskCallback>,
}

impl Task {
    pub fn new(name: impl Into<String>, handler: TaskHandler) -> CadenceResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CadenceError::Validation(
                "task name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            id: short_id(),
            name,
            handler,
            args: TaskArgs::default(),
            timeout: DEFAULT_TIMEOUT,
            retry_count: 0,
            retry_delay: Duration::ZERO,
            tags: BTreeSet::new(),
            metadata: Map::new(),
            created_at: Utc::now(),
            on_success: None,
            on_failure: None,
        })
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args.args = args;
        self
    }

    #[must_use]
    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.kwargs.insert(key.into(), value);
        self
    }

    /// A zero timeout means "use the default", as it does for persisted tasks.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry_count: u32, retry_delay: Duration) -> Self {
        self.retry_count = retry_count;
        self.retry_delay = retry_delay;
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn on_success(mut self, callback: TaskCallback) -> Self {
        self.on_success = Some(callback);
        self
    }

    #[must_use]
    pub fn on_failure(mut self, callback: TaskCallback) -> Self {
        self.on_failure = Some(callback);
        self
    }

    /// Execute the handler once under the task's timeout.
    ///
    /// Never fails: errors, panics and timeouts become a failed [`TaskResult`].
    /// Callback errors are logged and do not alter the result.
    pub async fn run(&self) -> TaskResult {
        let started_at = Utc::now();
        debug!("Running task '{}' ({})", self.name, self.id);

        let invocation = AssertUnwindSafe(self.handler.invoke(self.args.clone())).catch_unwind();
        let result = match tokio::time::timeout(self.timeout, invocation).await {
            Ok(Ok(Ok(value))) => TaskResult::succeeded(value, started_at, Utc::now()),
            Ok(Ok(Err(e))) => TaskResult::failed(format!("{:#}", e), started_at, Utc::now()),
            Ok(Err(panic)) => TaskResult::failed(
                format!("handler panicked: {}", panic_message(&panic)),
                started_at,
                Utc::now(),
            ),
            Err(_) => TaskResult::failed(
                format!(
                    "Task '{}' timed out after {}s",
                    self.name,
                    self.timeout.as_secs_f64()
                ),
                started_at,
                Utc::now(),
            ),
        };

        let callback = if result.success {
            self.on_success.as_ref()
        } else {
            self.on_failure.as_ref()
        };
        if let Some(callback) = callback
            && let Err(e) = callback.invoke(&result).await
        {
            warn!("Callback for task '{}' failed: {:#}", self.name, e);
        }

        result
    }

    pub fn to_record(&self) -> TaskRecord {
        TaskRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            handler: self.handler.name().to_string(),
            args: self.args.args.clone(),
            kwargs: self.args.kwargs.clone(),
            timeout_secs: self.timeout.as_secs_f64(),
            retry_count: self.retry_count,
            retry_delay_secs: self.retry_delay.as_secs_f64(),
            tags: self.tags.iter().cloned().collect(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
        }
    }

    /// Rebuild a task from its record with an already-resolved handler.
    pub fn from_record(record: TaskRecord, handler: TaskHandler) -> Self {
        let timeout = Duration::try_from_secs_f64(record.timeout_secs)
            .ok()
            .filter(|t| !t.is_zero())
            .unwrap_or(DEFAULT_TIMEOUT);
        let retry_delay =
            Duration::try_from_secs_f64(record.retry_delay_secs).unwrap_or(Duration::ZERO);
        Self {
            id: record.id,
            name: record.name,
            handler,
            args: TaskArgs {
                args: record.args,
                kwargs: record.kwargs,
            },
            timeout,
            retry_count: record.retry_count,
            retry_delay,
            tags: record.tags.into_iter().collect(),
            metadata: record.metadata,
            created_at: record.created_at,
            on_success: None,
            on_failure: None,
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("handler", &self.handler.name())
            .field("timeout", &self.timeout)
            .field("retry_count", &self.retry_count)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// Short random identifier (first 8 hex chars of a v4 UUID).
pub(crate) fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests;
