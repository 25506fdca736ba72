// Shared test helpers; not every test binary uses every item.
#![allow(unused)]

use cadence::autonomy::{CycleHandler, cycle_fn};
use cadence::scheduler::{HandlerRegistry, ScheduleStore, Scheduler, TaskArgs, TaskHandler};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Poll `check` every 10ms, failing the test after 5s.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Handler that counts its invocations.
pub fn counting_handler(name: &str, counter: Arc<AtomicUsize>) -> TaskHandler {
    TaskHandler::new_async(name, move |_: TaskArgs| {
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!(n))
        }
    })
}

/// Tracks how many executions overlap and the highest overlap seen.
#[derive(Default)]
pub struct Gauge {
    current: AtomicUsize,
    pub peak: AtomicUsize,
    pub finished: AtomicUsize,
}

impl Gauge {
    pub fn handler(self: &Arc<Self>, hold: Duration) -> TaskHandler {
        let gauge = self.clone();
        TaskHandler::new_async("gauge", move |_: TaskArgs| {
            let gauge = gauge.clone();
            async move {
                let now = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
                gauge.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(hold).await;
                gauge.current.fetch_sub(1, Ordering::SeqCst);
                gauge.finished.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
    }
}

pub fn fast_scheduler(max_concurrent: usize) -> Scheduler {
    Scheduler::new(max_concurrent, Duration::from_millis(20))
}

/// Store in a fresh temp dir with the built-in handlers plus `extra`.
pub fn temp_store(extra: Vec<TaskHandler>) -> (ScheduleStore, TempDir) {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let registry = HandlerRegistry::with_builtins();
    for handler in extra {
        registry.register(handler);
    }
    let store = ScheduleStore::with_registry(tmp.path().join("schedules.json"), registry);
    (store, tmp)
}

/// Cycle handler that counts runs and reports success.
pub fn counting_cycle(counter: Arc<AtomicUsize>) -> Arc<dyn CycleHandler> {
    cycle_fn(move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"status": "ok"}))
        }
    })
}
