//! Generic task scheduler: one-shot, fixed-interval and cron schedules with
//! file-backed persistence and a concurrency-bounded execution loop.

pub mod registry;
pub mod service;
pub mod store;
pub mod task;
pub mod timing;
pub mod types;

pub use registry::HandlerRegistry;
pub use service::{Scheduler, SchedulerStats};
pub use store::ScheduleStore;
pub use task::{Task, TaskArgs, TaskCallback, TaskHandler, TaskRecord, TaskResult};
pub use types::{ScheduledTask, ScheduledTaskRecord, TaskStatus};
