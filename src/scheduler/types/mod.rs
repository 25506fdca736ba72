use crate::scheduler::task::{Task, TaskHandler, TaskRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Current on-disk format of the schedule store.
pub const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl TaskStatus {
    /// Completed, failed and cancelled tasks never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A [`Task`] plus its timing, recurrence and execution bookkeeping.
///
/// `recurring == false` implies both `interval_seconds` and `cron_expression`
/// are `None`. Recurrence comes from exactly one of the two when set.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub id: String,
    pub task: Task,
    pub run_at: Option<DateTime<Utc>>,
    pub recurring: bool,
    pub interval_seconds: Option<f64>,
    pub cron_expression: Option<String>,
    pub enabled: bool,
    pub status: TaskStatus,
    pub run_count: u32,
    pub max_runs: Option<u32>,
    pub last_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Failed attempts of the current one-shot run that have been retried.
    pub retry_attempts: u32,
    pub last_error: Option<String>,
}

impl ScheduledTask {
    fn base(task: Task, run_at: DateTime<Utc>) -> Self {
        Self {
            id: crate::scheduler::task::short_id(),
            task,
            run_at: Some(run_at),
            recurring: false,
            interval_seconds: None,
            cron_expression: None,
            enabled: true,
            status: TaskStatus::Pending,
            run_count: 0,
            max_runs: None,
            last_run: None,
            created_at: Utc::now(),
            retry_attempts: 0,
            last_error: None,
        }
    }

    pub fn once(task: Task, run_at: DateTime<Utc>) -> Self {
        Self::base(task, run_at)
    }

    pub fn every(task: Task, interval_seconds: f64, first_run: DateTime<Utc>) -> Self {
        Self {
            recurring: true,
            interval_seconds: Some(interval_seconds),
            ..Self::base(task, first_run)
        }
    }

    pub fn cron(task: Task, expression: impl Into<String>, first_run: DateTime<Utc>) -> Self {
        Self {
            recurring: true,
            cron_expression: Some(expression.into()),
            ..Self::base(task, first_run)
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval_seconds
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Enabled, non-terminal, not already running, and `run_at <= now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.status == TaskStatus::Pending
            && self.run_at.is_some_and(|at| at <= now)
    }

    /// True when no tag filter is given or the task carries any of the tags.
    pub fn matches_tags(&self, tags: &[String]) -> bool {
        tags.is_empty() || tags.iter().any(|t| self.task.tags.contains(t))
    }

    pub fn max_runs_reached(&self) -> bool {
        self.max_runs.is_some_and(|cap| self.run_count >= cap)
    }

    /// Move to a terminal status and drop any recurrence source.
    pub fn finish(&mut self, status: TaskStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.recurring = false;
        self.interval_seconds = None;
        self.cron_expression = None;
        self.enabled = false;
    }

    pub fn to_record(&self) -> ScheduledTaskRecord {
        ScheduledTaskRecord {
            id: self.id.clone(),
            task: self.task.to_record(),
            run_at: self.run_at,
            recurring: self.recurring,
            interval_seconds: self.interval_seconds,
            cron_expression: self.cron_expression.clone(),
            enabled: self.enabled,
            status: self.status,
            run_count: self.run_count,
            max_runs: self.max_runs,
            last_run: self.last_run,
            created_at: self.created_at,
            retry_attempts: self.retry_attempts,
            last_error: self.last_error.clone(),
        }
    }

    pub fn from_record(record: ScheduledTaskRecord, handler: TaskHandler) -> Self {
        Self {
            id: record.id,
            task: Task::from_record(record.task, handler),
            run_at: record.run_at,
            recurring: record.recurring,
            interval_seconds: record.interval_seconds,
            cron_expression: record.cron_expression,
            enabled: record.enabled,
            status: record.status,
            run_count: record.run_count,
            max_runs: record.max_runs,
            last_run: record.last_run,
            created_at: record.created_at,
            retry_attempts: record.retry_attempts,
            last_error: record.last_error,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTaskRecord {
    pub id: String,
    pub task: TaskRecord,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recurring: bool,
    #[serde(default)]
    pub interval_seconds: Option<f64>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub run_count: u32,
    #[serde(default)]
    pub max_runs: Option<u32>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Whole-file layout of the schedule store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreFile {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub schedules: Vec<ScheduledTaskRecord>,
}

fn default_version() -> u32 {
    STORE_VERSION
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            saved_at: None,
            schedules: Vec::new(),
        }
    }
}
