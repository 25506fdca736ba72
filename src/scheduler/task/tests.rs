use super::*;
use serde_json::json;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

fn echo_handler() -> TaskHandler {
    TaskHandler::new_async("echo", |args: TaskArgs| async move {
        Ok(json!({"args": args.args, "kwargs": args.kwargs}))
    })
}

#[test]
fn test_new_rejects_blank_name() {
    let err = Task::new("   ", echo_handler()).unwrap_err();
    assert!(err.is_validation());
}

#[test]
fn test_new_generates_short_distinct_ids() {
    let a = Task::new("a", echo_handler()).unwrap();
    let b = Task::new("b", echo_handler()).unwrap();
    assert_eq!(a.id.len(), 8);
    assert_ne!(a.id, b.id);
    assert_eq!(a.timeout, DEFAULT_TIMEOUT);
}

#[tokio::test]
async fn test_run_async_handler_passes_args() {
    let task = Task::new("echo", echo_handler())
        .unwrap()
        .with_args(vec![json!(1), json!("two")])
        .with_kwarg("key", json!(true));
    let result = task.run().await;
    assert!(result.success);
    assert_eq!(
        result.result,
        Some(json!({"args": [1, "two"], "kwargs": {"key": true}}))
    );
    assert!(result.error.is_none());
    assert!(result.duration_ms().unwrap() >= 0);
}

#[tokio::test]
async fn test_run_blocking_handler() {
    let handler = TaskHandler::blocking("sum", |args: TaskArgs| {
        let total: i64 = args.args.iter().filter_map(|v| v.as_i64()).sum();
        Ok(json!(total))
    });
    let task = Task::new("sum", handler)
        .unwrap()
        .with_args(vec![json!(2), json!(3)]);
    let result = task.run().await;
    assert!(result.success);
    assert_eq!(result.result, Some(json!(5)));
}

#[tokio::test]
async fn test_run_handler_error_becomes_failure() {
    let handler = TaskHandler::new_async("boom", |_| async { anyhow::bail!("disk full") });
    let task = Task::new("boom", handler).unwrap();
    let result = task.run().await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("disk full"));
    assert!(result.result.is_none());
}

#[tokio::test]
async fn test_run_async_panic_becomes_failure() {
    let handler = TaskHandler::new_async("panics", |_| async {
        if true {
            panic!("kaboom");
        }
        Ok(Value::Null)
    });
    let result = Task::new("panics", handler).unwrap().run().await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("kaboom"));
}

#[tokio::test]
async fn test_run_blocking_panic_becomes_failure() {
    let handler = TaskHandler::blocking("panics", |_| panic!("blocking kaboom"));
    let result = Task::new("panics", handler).unwrap().run().await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("blocking kaboom"));
}

#[tokio::test]
async fn test_run_times_out() {
    let handler = TaskHandler::new_async("slow", |_| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Value::Null)
    });
    let task = Task::new("slow", handler)
        .unwrap()
        .with_timeout(Duration::from_millis(50));
    let result = task.run().await;
    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(error.contains("timed out after 0.05s"), "{error}");
}

#[tokio::test]
async fn test_blocking_timeout_does_not_wait_for_handler() {
    let handler = TaskHandler::blocking("sleepy", |_| {
        std::thread::sleep(Duration::from_millis(500));
        Ok(Value::Null)
    });
    let task = Task::new("sleepy", handler)
        .unwrap()
        .with_timeout(Duration::from_millis(20));
    let started = std::time::Instant::now();
    let result = task.run().await;
    assert!(!result.success);
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[tokio::test]
async fn test_success_callback_invoked_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let task = Task::new("echo", echo_handler())
        .unwrap()
        .on_success(TaskCallback::sync(move |result| {
            assert!(result.success);
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .on_failure(TaskCallback::sync(|_| panic!("must not run")));
    task.run().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_async_failure_callback_receives_error() {
    let seen = Arc::new(Mutex::new(None));
    let s = seen.clone();
    let handler = TaskHandler::new_async("boom", |_| async { anyhow::bail!("nope") });
    let task = Task::new("boom", handler)
        .unwrap()
        .on_failure(TaskCallback::new_async(move |result| {
            let s = s.clone();
            async move {
                *s.lock().unwrap() = result.error;
                Ok(())
            }
        }));
    task.run().await;
    assert_eq!(seen.lock().unwrap().as_deref(), Some("nope"));
}

#[tokio::test]
async fn test_callback_errors_do_not_alter_result() {
    let task = Task::new("echo", echo_handler())
        .unwrap()
        .on_success(TaskCallback::sync(|_| anyhow::bail!("callback broke")));
    let result = task.run().await;
    assert!(result.success);
    assert!(result.error.is_none());

    let task = Task::new("echo", echo_handler())
        .unwrap()
        .on_success(TaskCallback::sync(|_| panic!("callback panicked")));
    assert!(task.run().await.success);
}

#[tokio::test]
async fn test_unresolved_handler_is_noop() {
    let task = Task::new("ghost", TaskHandler::unresolved("missing.handler")).unwrap();
    let result = task.run().await;
    assert!(result.success);
    assert_eq!(result.result, Some(Value::Null));
}

#[test]
fn test_record_references_handler_by_name() {
    let task = Task::new("echo", echo_handler())
        .unwrap()
        .with_args(vec![json!(1)])
        .with_tags(["b", "a"])
        .with_retry(2, Duration::from_secs(3))
        .with_metadata("owner", json!("ops"));
    let record = task.to_record();
    assert_eq!(record.handler, "echo");
    assert_eq!(record.tags, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(record.retry_delay_secs, 3.0);

    let value = serde_json::to_value(&record).unwrap();
    assert_eq!(value["handler"], json!("echo"));
    assert!(value["created_at"].is_string());

    let rebuilt = Task::from_record(record, echo_handler());
    assert_eq!(rebuilt.id, task.id);
    assert_eq!(rebuilt.tags, task.tags);
    assert_eq!(rebuilt.retry_count, 2);
    assert_eq!(rebuilt.timeout, DEFAULT_TIMEOUT);
    assert_eq!(rebuilt.created_at, task.created_at);
}

#[test]
fn test_from_record_rejects_zero_timeout() {
    let mut record = Task::new("echo", echo_handler()).unwrap().to_record();
    record.timeout_secs = 0.0;
    let task = Task::from_record(record, echo_handler());
    assert_eq!(task.timeout, DEFAULT_TIMEOUT);
}

#[test]
fn test_zero_timeout_uses_default_before_and_after_persistence() {
    let task = Task::new("echo", echo_handler())
        .unwrap()
        .with_timeout(Duration::ZERO);
    assert_eq!(task.timeout, DEFAULT_TIMEOUT);

    let record = task.to_record();
    assert_eq!(record.timeout_secs, DEFAULT_TIMEOUT.as_secs_f64());
    let rebuilt = Task::from_record(record, echo_handler());
    assert_eq!(rebuilt.timeout, task.timeout);
}

#[tokio::test]
async fn test_zero_timeout_does_not_fail_immediately() {
    let task = Task::new("echo", echo_handler())
        .unwrap()
        .with_timeout(Duration::ZERO);
    let result = task.run().await;
    assert!(result.success, "{:?}", result.error);
}

#[test]
fn test_duration_ms_requires_both_timestamps() {
    let now = Utc::now();
    let mut result = TaskResult::succeeded(Value::Null, now, now + chrono::Duration::milliseconds(250));
    assert_eq!(result.duration_ms(), Some(250));
    result.completed_at = None;
    assert_eq!(result.duration_ms(), None);
}
