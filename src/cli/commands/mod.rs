mod subcommands;


use crate::config::{Config, load_config};
use crate::scheduler::{HandlerRegistry, ScheduleStore, Scheduler};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Autonomous cycle scheduler and persistent task scheduler")]
pub struct Cli {
    /// Use this config file instead of $CADENCE_HOME/config.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage persisted schedules
    Schedule {
        #[command(subcommand)]
        cmd: ScheduleCommands,
    },
    /// Run the scheduler with the persisted schedules until Ctrl-C
    Run,
    /// Show config location, store path and schedule counts
    Status,
    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        cmd: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// List persisted schedules
    List {
        /// Only show schedules carrying one of these tags
        #[arg(long = "tag", short = 't')]
        tags: Vec<String>,
    },
    /// Add a schedule
    Add {
        #[arg(long, short = 'n')]
        name: String,
        /// Registered handler name (built-ins: log, noop)
        #[arg(long)]
        handler: String,
        /// Run once at this RFC 3339 timestamp
        #[arg(long, conflicts_with_all = ["every", "cron"])]
        at: Option<String>,
        /// Run every N seconds
        #[arg(long, short = 'e', conflicts_with = "cron")]
        every: Option<f64>,
        /// Run on a cron expression (5 or 6 fields, UTC)
        #[arg(long, short = 'c')]
        cron: Option<String>,
        #[arg(long = "tag", short = 't')]
        tags: Vec<String>,
        #[arg(long)]
        max_runs: Option<u32>,
        /// Positional handler argument; parsed as JSON, falling back to a string
        #[arg(long = "arg")]
        args: Vec<String>,
        /// Message passed to the `log` handler
        #[arg(long, short = 'm')]
        message: Option<String>,
    },
    /// Remove a schedule
    Remove {
        #[arg(long)]
        id: String,
    },
    /// Remove every schedule
    Clear,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Load and validate the config file
    Check,
    /// Write a config file with every default filled in
    Init {
        /// Overwrite an existing file
        #[arg(long, short = 'f')]
        force: bool,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Schedule { cmd } => {
            let config = load_config(config_path)?;
            subcommands::schedule_command(&config, cmd).await?;
        }
        Commands::Run => {
            let config = load_config(config_path)?;
            subcommands::run_command(&config).await?;
        }
        Commands::Status => {
            subcommands::status_command(config_path).await?;
        }
        Commands::Config { cmd } => match cmd {
            ConfigCommands::Check => subcommands::config_check(config_path)?,
            ConfigCommands::Init { force } => subcommands::config_init(config_path, force)?,
        },
    }

    Ok(())
}

fn store_path(config: &Config) -> Result<PathBuf> {
    match &config.scheduler.store_path {
        Some(path) => Ok(crate::utils::expand_home(&path.to_string_lossy())),
        None => crate::config::loader::default_store_path(),
    }
}

/// Scheduler backed by the configured store, with the built-in handlers.
fn build_scheduler(config: &Config) -> Result<Scheduler> {
    let store = ScheduleStore::with_registry(store_path(config)?, HandlerRegistry::with_builtins());
    Ok(Scheduler::from_config(&config.scheduler).with_store(store))
}

fn parse_arg(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}
