use super::{ScheduleCommands, build_scheduler, parse_arg, store_path};
use crate::config::{Config, load_config, save_config};
use crate::scheduler::{ScheduleStore, Scheduler, Task, TaskStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::info;

pub(super) async fn schedule_command(config: &Config, cmd: ScheduleCommands) -> Result<()> {
    let scheduler = build_scheduler(config)?;
    let Some(store) = scheduler.store() else {
        anyhow::bail!("Scheduler has no schedule store");
    };

    match cmd {
        ScheduleCommands::List { tags } => {
            let mut schedules = store.load_schedules().await;
            schedules.retain(|s| s.matches_tags(&tags));
            schedules.sort_by_key(|s| s.run_at);
            if schedules.is_empty() {
                println!("No schedules found.");
            } else {
                println!("Schedules:");
                for line in schedules.iter().map(describe) {
                    println!("  {}", line);
                }
            }
        }
        ScheduleCommands::Add {
            name,
            handler,
            at,
            every,
            cron,
            tags,
            max_runs,
            args,
            message,
        } => {
            let id = add_schedule(
                &scheduler,
                AddRequest {
                    name,
                    handler,
                    at,
                    every,
                    cron,
                    tags,
                    max_runs,
                    args,
                    message,
                },
            )
            .await?;
            println!("\u{2713} Added schedule {}", id);
        }
        ScheduleCommands::Remove { id } => {
            if store.delete_schedule(&id).await? {
                println!("\u{2713} Removed schedule {}", id);
            } else {
                println!("Schedule {} not found", id);
            }
        }
        ScheduleCommands::Clear => {
            store.clear_all().await?;
            println!("\u{2713} Cleared all schedules");
        }
    }
    Ok(())
}

pub(super) struct AddRequest {
    pub name: String,
    pub handler: String,
    pub at: Option<String>,
    pub every: Option<f64>,
    pub cron: Option<String>,
    pub tags: Vec<String>,
    pub max_runs: Option<u32>,
    pub args: Vec<String>,
    pub message: Option<String>,
}

/// Validate a schedule through the scheduler, which persists it to the store.
pub(super) async fn add_schedule(scheduler: &Scheduler, req: AddRequest) -> Result<String> {
    let Some(store) = scheduler.store() else {
        anyhow::bail!("Scheduler has no schedule store");
    };
    let Some(handler) = store.registry().get(&req.handler) else {
        anyhow::bail!(
            "Unknown handler '{}' (available: {})",
            req.handler,
            store.registry().names().join(", ")
        );
    };

    let mut task = Task::new(req.name, handler)?
        .with_args(req.args.iter().map(|a| parse_arg(a)).collect())
        .with_tags(req.tags);
    if let Some(message) = req.message {
        task = task.with_kwarg("message", serde_json::Value::String(message));
    }

    let id = match (req.at, req.every, req.cron) {
        (Some(at), None, None) => {
            let run_at = DateTime::parse_from_rfc3339(&at)
                .with_context(|| format!("Invalid --at timestamp '{}'", at))?
                .with_timezone(&Utc);
            scheduler.schedule_once(task, run_at).await?
        }
        (None, Some(every), None) => match req.max_runs {
            Some(max_runs) => {
                scheduler
                    .schedule_recurring_with_max_runs(task, every, false, max_runs)
                    .await?
            }
            None => scheduler.schedule_recurring(task, every, false).await?,
        },
        (None, None, Some(expr)) => {
            let id = scheduler.schedule_cron(task, &expr).await?;
            if req.max_runs.is_some() {
                scheduler.set_max_runs(&id, req.max_runs).await?;
            }
            id
        }
        _ => anyhow::bail!("Exactly one of --at, --every or --cron is required"),
    };
    info!("Added schedule {}", id);
    Ok(id)
}

fn describe(scheduled: &crate::scheduler::ScheduledTask) -> String {
    let kind = match (&scheduled.cron_expression, scheduled.interval_seconds) {
        (Some(expr), _) => format!("cron '{}'", expr),
        (None, Some(secs)) => format!("every {}s", secs),
        (None, None) => "once".to_string(),
    };
    let next = scheduled.run_at.map_or_else(
        || "never".to_string(),
        |dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    );
    let runs = match scheduled.max_runs {
        Some(max) => format!("{}/{}", scheduled.run_count, max),
        None => scheduled.run_count.to_string(),
    };
    format!(
        "[{}] {} ({}) {} - {} (next: {}, runs: {})",
        scheduled.id,
        scheduled.task.name,
        scheduled.task.handler.name(),
        kind,
        scheduled.status,
        next,
        runs
    )
}

pub(super) async fn run_command(config: &Config) -> Result<()> {
    let scheduler = build_scheduler(config)?;
    scheduler.set_on_task_failed(|scheduled, result| {
        tracing::warn!(
            "Schedule {} ({}) failed: {}",
            scheduled.id,
            scheduled.task.name,
            result.error.as_deref().unwrap_or("unknown error")
        );
    });
    scheduler.start().await?;
    println!(
        "Scheduler running ({} schedule(s)). Press Ctrl-C to stop.",
        scheduler.list_scheduled(&[]).await.len()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    println!("\nShutting down...");
    scheduler.stop().await;
    Ok(())
}

pub(super) async fn status_command(config_path: Option<&Path>) -> Result<()> {
    let default_path = crate::config::get_config_path()?;
    let path = config_path.unwrap_or(default_path.as_path());
    let config = load_config(Some(path))?;
    let store_path = store_path(&config)?;

    println!("\u{23f1} cadence Status\n");
    println!(
        "Config: {} {}",
        path.display(),
        if path.exists() { "\u{2713}" } else { "\u{2717}" }
    );
    println!(
        "Store: {} {}",
        store_path.display(),
        if store_path.exists() {
            "\u{2713}"
        } else {
            "\u{2717}"
        }
    );

    let records = ScheduleStore::new(&store_path).load_records().await;
    let count = |status: TaskStatus| records.iter().filter(|r| r.status == status).count();
    println!("Schedules: {}", records.len());
    println!("  pending: {}", count(TaskStatus::Pending));
    println!("  paused: {}", count(TaskStatus::Paused));
    println!("  running: {}", count(TaskStatus::Running));
    println!(
        "Limits: {} concurrent, check every {}ms",
        config.scheduler.max_concurrent_jobs, config.scheduler.check_interval_ms
    );
    println!("Configured cycles: {}", config.controller.cycles.len());
    Ok(())
}

pub(super) fn config_check(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    println!(
        "\u{2713} Configuration valid ({} cycle(s), {} governor override(s))",
        config.controller.cycles.len(),
        config.governor.cycles.len()
    );
    Ok(())
}

pub(super) fn config_init(config_path: Option<&Path>, force: bool) -> Result<()> {
    let default_path = crate::config::get_config_path()?;
    let path = config_path.unwrap_or(default_path.as_path());
    if path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    save_config(&Config::default(), Some(path))?;
    println!("\u{2713} Wrote default config to {}", path.display());
    Ok(())
}
