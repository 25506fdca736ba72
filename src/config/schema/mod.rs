use crate::errors::CadenceError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

fn default_max_concurrent_jobs() -> usize {
    10
}

fn default_check_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent_jobs", rename = "maxConcurrentJobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_check_interval_ms", rename = "checkIntervalMs")]
    pub check_interval_ms: u64,
    /// Schedule store file. Defaults to `$CADENCE_HOME/schedules.json`.
    #[serde(default, rename = "storePath", skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            check_interval_ms: default_check_interval_ms(),
            store_path: None,
        }
    }
}

impl SchedulerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Governor
// ---------------------------------------------------------------------------

/// Cooldown and hourly cap for one cycle type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleLimitsConfig {
    #[serde(rename = "cooldownSecs")]
    pub cooldown_secs: u64,
    #[serde(rename = "maxPerHour")]
    pub max_per_hour: u32,
}

/// Durations of the corrective blocks applied after a detected loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPolicyConfig {
    #[serde(default = "default_research_improvement_block", rename = "researchImprovementSecs")]
    pub research_improvement_secs: u64,
    #[serde(default = "default_self_evaluation_block", rename = "selfEvaluationSecs")]
    pub self_evaluation_secs: u64,
    #[serde(default = "default_restart_block", rename = "restartSecs")]
    pub restart_secs: u64,
    #[serde(default = "default_error_recovery_block", rename = "errorRecoverySecs")]
    pub error_recovery_secs: u64,
}

fn default_research_improvement_block() -> u64 {
    600
}

fn default_self_evaluation_block() -> u64 {
    3600
}

fn default_restart_block() -> u64 {
    1800
}

fn default_error_recovery_block() -> u64 {
    900
}

impl Default for BlockPolicyConfig {
    fn default() -> Self {
        Self {
            research_improvement_secs: default_research_improvement_block(),
            self_evaluation_secs: default_self_evaluation_block(),
            restart_secs: default_restart_block(),
            error_recovery_secs: default_error_recovery_block(),
        }
    }
}

fn default_cooldown_secs() -> u64 {
    120
}

fn default_max_per_hour() -> u32 {
    12
}

fn default_cycle_limits() -> BTreeMap<String, CycleLimitsConfig> {
    [
        ("research", 300, 6),
        ("improvement", 300, 6),
        ("self_evaluation", 600, 3),
        ("iterative_improvement", 600, 3),
        ("restart", 1800, 2),
    ]
    .into_iter()
    .map(|(name, cooldown_secs, max_per_hour)| {
        (
            name.to_string(),
            CycleLimitsConfig {
                cooldown_secs,
                max_per_hour,
            },
        )
    })
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorConfig {
    #[serde(default = "default_cooldown_secs", rename = "defaultCooldownSecs")]
    pub default_cooldown_secs: u64,
    #[serde(default = "default_max_per_hour", rename = "defaultMaxPerHour")]
    pub default_max_per_hour: u32,
    /// Per-cycle overrides; cycle types not listed use the defaults above.
    #[serde(default = "default_cycle_limits")]
    pub cycles: BTreeMap<String, CycleLimitsConfig>,
    #[serde(default)]
    pub blocks: BlockPolicyConfig,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            default_cooldown_secs: default_cooldown_secs(),
            default_max_per_hour: default_max_per_hour(),
            cycles: default_cycle_limits(),
            blocks: BlockPolicyConfig::default(),
        }
    }
}

impl GovernorConfig {
    /// Effective limits for a cycle type, falling back to the defaults.
    pub fn limits_for(&self, cycle_type: &str) -> CycleLimitsConfig {
        self.cycles
            .get(cycle_type)
            .copied()
            .unwrap_or(CycleLimitsConfig {
                cooldown_secs: self.default_cooldown_secs,
                max_per_hour: self.default_max_per_hour,
            })
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CyclePeriodConfig {
    pub name: String,
    #[serde(rename = "periodMinutes")]
    pub period_minutes: u64,
    /// Whether the handler receives the current task context.
    #[serde(default, rename = "taskAware")]
    pub task_aware: bool,
}

impl CyclePeriodConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_minutes * 60)
    }
}

fn default_cycle_periods() -> Vec<CyclePeriodConfig> {
    [
        ("research", 2, true),
        ("distillation", 4, false),
        ("improvement", 3, false),
        ("ability_acquisition", 3, false),
        ("learning_validation", 6, false),
        ("iterative_improvement", 8, false),
        ("self_evaluation", 5, false),
        ("crypto_trading", 4, false),
        ("google_cli", 15, false),
        ("browser_automation", 7, true),
        ("autonomous_research", 20, false),
        ("autonomous_agent", 15, false),
    ]
    .into_iter()
    .map(|(name, period_minutes, task_aware)| CyclePeriodConfig {
        name: name.to_string(),
        period_minutes,
        task_aware,
    })
    .collect()
}

fn default_tick_interval_secs() -> u64 {
    10
}

fn default_circular_pause_secs() -> u64 {
    60
}

fn default_idle_pause_secs() -> u64 {
    30
}

fn default_error_pause_secs() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_tick_interval_secs", rename = "tickIntervalSecs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_circular_pause_secs", rename = "circularPauseSecs")]
    pub circular_pause_secs: u64,
    #[serde(default = "default_idle_pause_secs", rename = "idlePauseSecs")]
    pub idle_pause_secs: u64,
    #[serde(default = "default_error_pause_secs", rename = "errorPauseSecs")]
    pub error_pause_secs: u64,
    /// Last-run state file. Defaults to `$CADENCE_HOME/cycle_state.json`.
    #[serde(default, rename = "statePath", skip_serializing_if = "Option::is_none")]
    pub state_path: Option<PathBuf>,
    #[serde(default = "default_cycle_periods")]
    pub cycles: Vec<CyclePeriodConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            circular_pause_secs: default_circular_pause_secs(),
            idle_pause_secs: default_idle_pause_secs(),
            error_pause_secs: default_error_pause_secs(),
            state_path: None,
            cycles: default_cycle_periods(),
        }
    }
}

impl ControllerConfig {
    pub fn cycle(&self, name: &str) -> Option<&CyclePeriodConfig> {
        self.cycles.iter().find(|c| c.name == name)
    }
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), CadenceError> {
        self.validate_scheduler()?;
        self.validate_governor()?;
        self.validate_controller()?;
        Ok(())
    }

    fn validate_scheduler(&self) -> Result<(), CadenceError> {
        let s = &self.scheduler;
        if s.max_concurrent_jobs == 0 {
            return Err(CadenceError::Config(
                "scheduler.maxConcurrentJobs must be > 0".into(),
            ));
        }
        if s.check_interval_ms == 0 {
            return Err(CadenceError::Config(
                "scheduler.checkIntervalMs must be > 0".into(),
            ));
        }
        Ok(())
    }

    fn validate_governor(&self) -> Result<(), CadenceError> {
        let g = &self.governor;
        if g.default_max_per_hour == 0 {
            return Err(CadenceError::Config(
                "governor.defaultMaxPerHour must be > 0".into(),
            ));
        }
        for (name, limits) in &g.cycles {
            if name.trim().is_empty() {
                return Err(CadenceError::Config(
                    "governor.cycles contains a blank cycle name".into(),
                ));
            }
            if limits.max_per_hour == 0 {
                return Err(CadenceError::Config(format!(
                    "governor.cycles.{name}.maxPerHour must be > 0"
                )));
            }
        }
        Ok(())
    }

    fn validate_controller(&self) -> Result<(), CadenceError> {
        let c = &self.controller;
        for (field, value) in [
            ("tickIntervalSecs", c.tick_interval_secs),
            ("circularPauseSecs", c.circular_pause_secs),
            ("idlePauseSecs", c.idle_pause_secs),
            ("errorPauseSecs", c.error_pause_secs),
        ] {
            if value == 0 {
                return Err(CadenceError::Config(format!(
                    "controller.{field} must be > 0"
                )));
            }
        }

        let mut seen = HashSet::new();
        for cycle in &c.cycles {
            if cycle.name.trim().is_empty() {
                return Err(CadenceError::Config(
                    "controller.cycles contains a blank cycle name".into(),
                ));
            }
            if !seen.insert(cycle.name.as_str()) {
                return Err(CadenceError::Config(format!(
                    "controller.cycles has duplicate cycle '{}'",
                    cycle.name
                )));
            }
            if cycle.period_minutes == 0 {
                return Err(CadenceError::Config(format!(
                    "controller.cycles.{}.periodMinutes must be > 0",
                    cycle.name
                )));
            }
        }
        Ok(())
    }
}
