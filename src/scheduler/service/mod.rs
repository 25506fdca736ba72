use crate::config::SchedulerConfig;
use crate::errors::{CadenceError, CadenceResult};
use crate::scheduler::store::ScheduleStore;
use crate::scheduler::task::{Task, TaskResult};
use crate::scheduler::timing::{next_cron_run, next_interval_run, validate_cron_expr};
use crate::scheduler::types::{ScheduledTask, TaskStatus};
use crate::utils::task_tracker::TaskTracker;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// `schedule_once` tolerates a `run_at` this far in the past.
const PAST_TOLERANCE_MS: i64 = 1000;

pub type TaskStartedHook = Arc<dyn Fn(&ScheduledTask) + Send + Sync>;
pub type TaskFinishedHook = Arc<dyn Fn(&ScheduledTask, &TaskResult) + Send + Sync>;

#[derive(Clone, Default)]
struct Hooks {
    on_started: Option<TaskStartedHook>,
    on_completed: Option<TaskFinishedHook>,
    on_failed: Option<TaskFinishedHook>,
}

#[derive(Default)]
struct SchedulerState {
    /// Live schedules (pending, running, paused).
    active: HashMap<String, ScheduledTask>,
    /// Terminal schedules retained for inspection until purged.
    finished: HashMap<String, ScheduledTask>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub scheduled: usize,
    pub executing: usize,
    pub paused: usize,
    pub finished: usize,
}

enum Disposition {
    Rescheduled,
    Finished,
}

/// Polling scheduler for one-shot, interval and cron tasks.
///
/// Cloning yields another handle to the same scheduler. The state mutex also
/// orders persistence, so a cancelled schedule can never be written back by a
/// racing completion.
#[derive(Clone)]
pub struct Scheduler {
    max_concurrent_jobs: usize,
    check_interval: Duration,
    store: Option<ScheduleStore>,
    state: Arc<Mutex<SchedulerState>>,
    hooks: Arc<std::sync::RwLock<Hooks>>,
    running: Arc<Mutex<bool>>,
    loop_tracker: Arc<TaskTracker>,
    executions: Arc<TaskTracker>,
    slots: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(max_concurrent_jobs: usize, check_interval: Duration) -> Self {
        let max_concurrent_jobs = max_concurrent_jobs.max(1);
        Self {
            max_concurrent_jobs,
            check_interval: check_interval.max(Duration::from_millis(1)),
            store: None,
            state: Arc::new(Mutex::new(SchedulerState::default())),
            hooks: Arc::new(std::sync::RwLock::new(Hooks::default())),
            running: Arc::new(Mutex::new(false)),
            loop_tracker: Arc::new(TaskTracker::new()),
            executions: Arc::new(TaskTracker::new()),
            slots: Arc::new(Semaphore::new(max_concurrent_jobs)),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.max_concurrent_jobs, config.check_interval())
    }

    #[must_use]
    pub fn with_store(mut self, store: ScheduleStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn store(&self) -> Option<&ScheduleStore> {
        self.store.as_ref()
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs
    }

    pub fn set_on_task_started<F>(&self, hook: F)
    where
        F: Fn(&ScheduledTask) + Send + Sync + 'static,
    {
        self.hooks_mut().on_started = Some(Arc::new(hook));
    }

    pub fn set_on_task_completed<F>(&self, hook: F)
    where
        F: Fn(&ScheduledTask, &TaskResult) + Send + Sync + 'static,
    {
        self.hooks_mut().on_completed = Some(Arc::new(hook));
    }

    pub fn set_on_task_failed<F>(&self, hook: F)
    where
        F: Fn(&ScheduledTask, &TaskResult) + Send + Sync + 'static,
    {
        self.hooks_mut().on_failed = Some(Arc::new(hook));
    }

    fn hooks_mut(&self) -> std::sync::RwLockWriteGuard<'_, Hooks> {
        self.hooks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn hooks(&self) -> Hooks {
        self.hooks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Run `task` once at `run_at`.
    pub async fn schedule_once(&self, task: Task, run_at: DateTime<Utc>) -> CadenceResult<String> {
        let now = Utc::now();
        if run_at < now - chrono::Duration::milliseconds(PAST_TOLERANCE_MS) {
            return Err(CadenceError::Validation(format!(
                "run_at {} is in the past",
                run_at.to_rfc3339()
            )));
        }
        self.insert(ScheduledTask::once(task, run_at)).await
    }

    /// Run `task` every `interval_seconds`, first at now (when
    /// `start_immediately`) or one interval from now.
    pub async fn schedule_recurring(
        &self,
        task: Task,
        interval_seconds: f64,
        start_immediately: bool,
    ) -> CadenceResult<String> {
        let scheduled = build_interval(task, interval_seconds, start_immediately)?;
        self.insert(scheduled).await
    }

    /// Like [`schedule_recurring`](Self::schedule_recurring), stopping after
    /// `max_runs` executions.
    pub async fn schedule_recurring_with_max_runs(
        &self,
        task: Task,
        interval_seconds: f64,
        start_immediately: bool,
        max_runs: u32,
    ) -> CadenceResult<String> {
        if max_runs == 0 {
            return Err(CadenceError::Validation(
                "max_runs must be positive".to_string(),
            ));
        }
        let mut scheduled = build_interval(task, interval_seconds, start_immediately)?;
        scheduled.max_runs = Some(max_runs);
        self.insert(scheduled).await
    }

    /// Run `task` on a cron expression (5 or 6 fields, evaluated in UTC).
    pub async fn schedule_cron(&self, task: Task, cron_expression: &str) -> CadenceResult<String> {
        validate_cron_expr(cron_expression)?;
        let first = next_cron_run(cron_expression, Utc::now()).ok_or_else(|| {
            CadenceError::Validation(format!(
                "Cron expression '{}' has no upcoming fire time",
                cron_expression
            ))
        })?;
        self.insert(ScheduledTask::cron(task, cron_expression.trim(), first))
            .await
    }

    async fn insert(&self, scheduled: ScheduledTask) -> CadenceResult<String> {
        let mut state = self.state.lock().await;
        if let Some(store) = &self.store {
            store.save_schedule(&scheduled).await?;
        }
        let id = scheduled.id.clone();
        info!(
            "Scheduled task '{}' ({}) next at {}",
            scheduled.task.name,
            id,
            scheduled
                .run_at
                .map_or_else(|| "-".to_string(), |at| at.to_rfc3339())
        );
        state.active.insert(id.clone(), scheduled);
        Ok(id)
    }

    /// Cancel a live schedule, aborting its execution if one is in flight.
    ///
    /// Returns `false` for unknown ids and for schedules that already reached
    /// a terminal status.
    pub async fn cancel(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(mut scheduled) = state.active.remove(id) else {
            return false;
        };
        let was_running = scheduled.status == TaskStatus::Running;
        scheduled.finish(TaskStatus::Cancelled);
        if let Some(store) = &self.store
            && let Err(e) = store.delete_schedule(id).await
        {
            warn!("Failed to remove cancelled schedule '{}' from store: {}", id, e);
        }
        state.finished.insert(id.to_string(), scheduled);
        drop(state);

        if was_running && self.executions.abort(id).await {
            info!("Cancelled in-flight execution of '{}'", id);
        } else {
            info!("Cancelled schedule '{}'", id);
        }
        true
    }

    /// Live schedules sorted by `run_at`, optionally filtered to those
    /// carrying any of `tags`.
    pub async fn list_scheduled(&self, tags: &[String]) -> Vec<ScheduledTask> {
        let state = self.state.lock().await;
        let mut tasks: Vec<ScheduledTask> = state
            .active
            .values()
            .filter(|t| t.matches_tags(tags))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.run_at.is_none(), t.run_at));
        tasks
    }

    /// Look up a live or retained terminal schedule.
    pub async fn get_scheduled_task(&self, id: &str) -> Option<ScheduledTask> {
        let state = self.state.lock().await;
        state
            .active
            .get(id)
            .or_else(|| state.finished.get(id))
            .cloned()
    }

    /// Disable a live schedule without removing it.
    pub async fn pause(&self, id: &str) -> CadenceResult<bool> {
        self.update_live(id, |scheduled| {
            scheduled.enabled = false;
            if scheduled.status == TaskStatus::Pending {
                scheduled.status = TaskStatus::Paused;
            }
        })
        .await
    }

    /// Re-enable a paused schedule. Cron schedules recompute their next fire
    /// time from now.
    pub async fn resume(&self, id: &str) -> CadenceResult<bool> {
        self.update_live(id, |scheduled| {
            scheduled.enabled = true;
            if scheduled.status == TaskStatus::Paused {
                scheduled.status = TaskStatus::Pending;
            }
            if let Some(expr) = &scheduled.cron_expression {
                scheduled.run_at = next_cron_run(expr, Utc::now());
            }
        })
        .await
    }

    /// Change (or clear) the execution cap of a live schedule.
    pub async fn set_max_runs(&self, id: &str, max_runs: Option<u32>) -> CadenceResult<bool> {
        if max_runs == Some(0) {
            return Err(CadenceError::Validation(
                "max_runs must be positive".to_string(),
            ));
        }
        self.update_live(id, |scheduled| scheduled.max_runs = max_runs)
            .await
    }

    async fn update_live(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut ScheduledTask),
    ) -> CadenceResult<bool> {
        let mut state = self.state.lock().await;
        let Some(scheduled) = state.active.get_mut(id) else {
            return Ok(false);
        };
        mutate(scheduled);
        if let Some(store) = &self.store {
            store.update_schedule(scheduled).await?;
        }
        Ok(true)
    }

    /// Drop retained terminal schedules; returns how many were removed.
    pub async fn purge_finished(&self) -> usize {
        let mut state = self.state.lock().await;
        let count = state.finished.len();
        state.finished.clear();
        count
    }

    pub async fn stats(&self) -> SchedulerStats {
        let running = self.is_running().await;
        let state = self.state.lock().await;
        let count = |status: TaskStatus| {
            state
                .active
                .values()
                .filter(|t| t.status == status)
                .count()
        };
        SchedulerStats {
            running,
            scheduled: state.active.len(),
            executing: count(TaskStatus::Running),
            paused: count(TaskStatus::Paused),
            finished: state.finished.len(),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub async fn is_running(&self) -> bool {
        *self.running.lock().await
    }

    /// Load persisted schedules and start the polling loop. No-op when
    /// already running.
    pub async fn start(&self) -> CadenceResult<()> {
        {
            let mut running = self.running.lock().await;
            if *running {
                debug!("Scheduler already running");
                return Ok(());
            }
            *running = true;
        }

        if let Some(store) = &self.store {
            let loaded = store.load_schedules().await;
            let mut state = self.state.lock().await;
            let mut restored = 0;
            for mut scheduled in loaded {
                if state.active.contains_key(&scheduled.id) {
                    continue;
                }
                // a persisted Running status means the previous process died mid-run
                if scheduled.status == TaskStatus::Running {
                    scheduled.status = TaskStatus::Pending;
                }
                state.active.insert(scheduled.id.clone(), scheduled);
                restored += 1;
            }
            if restored > 0 {
                info!("Restored {} persisted schedule(s)", restored);
            }
        }

        let scheduler = self.clone();
        let check_interval = self.check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !*scheduler.running.lock().await {
                    break;
                }
                scheduler.tick().await;
            }
            debug!("Scheduler loop exited");
        });
        self.loop_tracker
            .spawn("scheduler_loop".to_string(), handle)
            .await;

        info!(
            "Scheduler started (max {} concurrent, checking every {:?})",
            self.max_concurrent_jobs, self.check_interval
        );
        Ok(())
    }

    /// Stop the loop and abort in-flight executions. Aborted executions go
    /// back to pending so the next `start()` runs them again.
    pub async fn stop(&self) {
        {
            let mut running = self.running.lock().await;
            if !*running {
                return;
            }
            *running = false;
        }
        self.loop_tracker.cancel_all().await;
        let aborted = self.executions.cancel_all().await;

        let mut state = self.state.lock().await;
        for id in &aborted {
            if let Some(scheduled) = state.active.get_mut(id)
                && scheduled.status == TaskStatus::Running
            {
                scheduled.status = if scheduled.enabled {
                    TaskStatus::Pending
                } else {
                    TaskStatus::Paused
                };
            }
        }
        info!(
            "Scheduler stopped ({} in-flight execution(s) aborted)",
            aborted.len()
        );
    }

    /// One admission pass: start due tasks, earliest first, while
    /// concurrency slots are free. Tasks that do not fit wait for a later tick.
    pub(crate) async fn tick(&self) {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let mut due: Vec<(DateTime<Utc>, String)> = state
            .active
            .values()
            .filter(|t| t.is_due(now))
            .map(|t| (t.run_at.unwrap_or(now), t.id.clone()))
            .collect();
        if due.is_empty() {
            return;
        }
        due.sort();

        let total = due.len();
        for (started, (_, id)) in due.into_iter().enumerate() {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                debug!(
                    "Concurrency limit {} reached; {} due task(s) deferred",
                    self.max_concurrent_jobs,
                    total - started
                );
                break;
            };
            let Some(scheduled) = state.active.get_mut(&id) else {
                continue;
            };
            scheduled.status = TaskStatus::Running;
            let snapshot = scheduled.clone();

            // spawned under the state lock so cancel() always finds it tracked
            let scheduler = self.clone();
            self.executions
                .spawn_auto_cleanup(id, async move {
                    scheduler.execute(snapshot, permit).await;
                })
                .await;
        }
    }

    async fn execute(self, scheduled: ScheduledTask, permit: OwnedSemaphorePermit) {
        let hooks = self.hooks();
        if let Some(hook) = &hooks.on_started {
            call_hook("on_task_started", || hook(&scheduled));
        }
        debug!(
            "Executing '{}' ({}), run {}",
            scheduled.task.name,
            scheduled.id,
            scheduled.run_count + 1
        );

        let result = scheduled.task.run().await;
        self.finish_execution(&scheduled.id, result).await;
        drop(permit);
    }

    async fn finish_execution(&self, id: &str, result: TaskResult) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(scheduled) = state.active.get_mut(id) else {
            debug!("Discarding result for '{}': no longer scheduled", id);
            return;
        };

        scheduled.run_count += 1;
        scheduled.last_run = Some(result.started_at.unwrap_or(now));
        if result.success {
            scheduled.last_error = None;
            scheduled.retry_attempts = 0;
        } else {
            warn!(
                "Task '{}' ({}) failed: {}",
                scheduled.task.name,
                id,
                result.error.as_deref().unwrap_or("unknown error")
            );
            scheduled.last_error = result.error.clone();
        }

        let disposition = reschedule(scheduled, &result, now);
        let snapshot = scheduled.clone();
        match disposition {
            Disposition::Rescheduled => {
                if let Some(store) = &self.store
                    && let Err(e) = store.update_schedule(&snapshot).await
                {
                    warn!("Failed to persist schedule '{}': {}", id, e);
                }
            }
            Disposition::Finished => {
                if let Some(finished) = state.active.remove(id) {
                    state.finished.insert(id.to_string(), finished);
                }
                if let Some(store) = &self.store
                    && let Err(e) = store.delete_schedule(id).await
                {
                    warn!("Failed to remove finished schedule '{}': {}", id, e);
                }
                info!(
                    "Task '{}' ({}) finished as {} after {} run(s)",
                    snapshot.task.name, id, snapshot.status, snapshot.run_count
                );
            }
        }
        drop(state);

        let hooks = self.hooks();
        let hook = if result.success {
            hooks.on_completed.as_ref().map(|h| ("on_task_completed", h))
        } else {
            hooks.on_failed.as_ref().map(|h| ("on_task_failed", h))
        };
        if let Some((name, hook)) = hook {
            call_hook(name, || hook(&snapshot, &result));
        }
    }
}

fn build_interval(
    task: Task,
    interval_seconds: f64,
    start_immediately: bool,
) -> CadenceResult<ScheduledTask> {
    if !interval_seconds.is_finite() || interval_seconds <= 0.0 {
        return Err(CadenceError::Validation(format!(
            "interval_seconds must be positive, got {}",
            interval_seconds
        )));
    }
    let now = Utc::now();
    let Some(next) = next_interval_run(now, interval_seconds, now) else {
        return Err(CadenceError::Validation(format!(
            "interval_seconds {} puts the next run out of range",
            interval_seconds
        )));
    };
    let first = if start_immediately { now } else { next };
    Ok(ScheduledTask::every(task, interval_seconds, first))
}

/// Decide what happens to a schedule after one execution.
fn reschedule(scheduled: &mut ScheduledTask, result: &TaskResult, now: DateTime<Utc>) -> Disposition {
    let idle_status = if scheduled.enabled {
        TaskStatus::Pending
    } else {
        TaskStatus::Paused
    };

    let retry = !result.success
        && !scheduled.recurring
        && scheduled.retry_attempts < scheduled.task.retry_count
        && !scheduled.max_runs_reached();
    let retry_at = if retry {
        scheduled.retry_attempts += 1;
        let delay = chrono::Duration::from_std(scheduled.task.retry_delay)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let at = now.checked_add_signed(delay);
        if at.is_none() {
            warn!(
                "Retry delay {:?} for '{}' is out of range; not retrying",
                scheduled.task.retry_delay, scheduled.id
            );
        }
        at
    } else {
        None
    };
    if let Some(retry_at) = retry_at {
        scheduled.run_at = Some(retry_at);
        scheduled.status = idle_status;
        info!(
            "Retrying '{}' ({}) in {:?} (attempt {}/{})",
            scheduled.task.name,
            scheduled.id,
            scheduled.task.retry_delay,
            scheduled.retry_attempts,
            scheduled.task.retry_count
        );
        return Disposition::Rescheduled;
    }

    if scheduled.recurring && !scheduled.max_runs_reached() {
        let next = if let Some(expr) = &scheduled.cron_expression {
            next_cron_run(expr, now)
        } else {
            scheduled
                .interval_seconds
                .and_then(|secs| next_interval_run(scheduled.run_at.unwrap_or(now), secs, now))
        };
        if let Some(next) = next {
            scheduled.run_at = Some(next);
            scheduled.status = idle_status;
            return Disposition::Rescheduled;
        }
        warn!(
            "Schedule '{}' has no further fire time; finishing it",
            scheduled.id
        );
    }

    scheduled.finish(if result.success {
        TaskStatus::Completed
    } else {
        TaskStatus::Failed
    });
    Disposition::Finished
}

fn call_hook(name: &str, f: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("Scheduler hook {} panicked", name);
    }
}
