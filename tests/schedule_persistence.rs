mod common;

use cadence::CadenceError;
use cadence::scheduler::{ScheduleStore, Task, TaskHandler, TaskStatus};
use chrono::Utc;
use common::{counting_handler, fast_scheduler, temp_store, wait_until};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::test]
async fn test_schedules_survive_restart_and_run() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (store, _tmp) = temp_store(vec![counting_handler("report", calls.clone())]);

    let first = fast_scheduler(2).with_store(store.clone());
    let once = first
        .schedule_once(
            Task::new("report", counting_handler("report", calls.clone()))
                .unwrap()
                .with_tags(["nightly"]),
            Utc::now() + chrono::Duration::milliseconds(300),
        )
        .await
        .unwrap();
    let hourly = first
        .schedule_recurring(
            Task::new("hourly", counting_handler("report", calls.clone())).unwrap(),
            3600.0,
            false,
        )
        .await
        .unwrap();
    drop(first);

    // a fresh store instance at the same path, resolving handlers by name
    let reopened = ScheduleStore::with_registry(store.path(), store.registry().clone());
    let second = fast_scheduler(2).with_store(reopened.clone());
    second.start().await.unwrap();
    assert_eq!(second.list_scheduled(&[]).await.len(), 2);
    assert_eq!(second.list_scheduled(&["nightly".to_string()]).await.len(), 1);

    wait_until(|| async {
        second.get_scheduled_task(&once).await.map(|t| t.status) == Some(TaskStatus::Completed)
    })
    .await;
    second.stop().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let records = reopened.load_records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, hourly);
    assert_eq!(records[0].interval_seconds, Some(3600.0));
}

#[tokio::test]
async fn test_unregistered_handler_is_skipped_not_fatal() {
    let (store, tmp) = temp_store(vec![TaskHandler::new_async("ephemeral", |_| async {
        Ok(Value::Null)
    })]);
    let id = fast_scheduler(1)
        .with_store(store)
        .schedule_once(
            Task::new("orphan", TaskHandler::new_async("ephemeral", |_| async { Ok(Value::Null) }))
                .unwrap(),
            Utc::now() + chrono::Duration::milliseconds(300),
        )
        .await
        .unwrap();

    // the restarted process never registers "ephemeral"
    let bare = ScheduleStore::new(tmp.path().join("schedules.json"));
    let s = fast_scheduler(1).with_store(bare.clone());
    s.start().await.unwrap();
    let restored = s.get_scheduled_task(&id).await.unwrap();
    assert_eq!(restored.task.handler.name(), "ephemeral");

    wait_until(|| async {
        s.get_scheduled_task(&id).await.map(|t| t.status) == Some(TaskStatus::Completed)
    })
    .await;
    s.stop().await;
    assert!(bare.load_records().await.is_empty());
}

#[tokio::test]
async fn test_store_file_layout() {
    let (store, _tmp) = temp_store(Vec::new());
    let s = fast_scheduler(1).with_store(store.clone());
    let log = store.registry().get("log").unwrap();
    let id = s
        .schedule_cron(
            Task::new("digest", log)
                .unwrap()
                .with_kwarg("message", Value::String("daily digest".into())),
            "0 9 * * *",
        )
        .await
        .unwrap();

    let raw: Value =
        serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
    assert_eq!(raw["version"], 1);
    assert!(raw["saved_at"].is_string());
    let entry = &raw["schedules"][0];
    assert_eq!(entry["id"], Value::String(id));
    assert_eq!(entry["cron_expression"], "0 9 * * *");
    assert_eq!(entry["status"], "pending");
    assert_eq!(entry["task"]["handler"], "log");
    assert_eq!(entry["task"]["kwargs"]["message"], "daily digest");
    assert!(entry["run_at"].is_string());
}

#[tokio::test]
async fn test_corrupt_store_recovers_on_next_write() {
    let (store, _tmp) = temp_store(Vec::new());
    std::fs::write(store.path(), "{ definitely not json").unwrap();
    assert!(store.load_records().await.is_empty());

    let s = fast_scheduler(1).with_store(store.clone());
    s.schedule_recurring(
        Task::new("beat", store.registry().get("noop").unwrap()).unwrap(),
        60.0,
        false,
    )
    .await
    .unwrap();
    assert_eq!(store.load_records().await.len(), 1);
}

#[tokio::test]
async fn test_unwritable_store_surfaces_persistence_error() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("schedules.json");
    std::fs::create_dir_all(&path).unwrap();
    let s = fast_scheduler(1).with_store(ScheduleStore::new(&path));

    let err = s
        .schedule_recurring(
            Task::new("x", TaskHandler::new_async("x", |_| async { Ok(Value::Null) })).unwrap(),
            5.0,
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CadenceError::Persistence(_)));
    assert!(!err.is_validation());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(s.list_scheduled(&[]).await.is_empty());
}
