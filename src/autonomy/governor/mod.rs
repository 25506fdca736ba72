use crate::autonomy::detector::{CircularIssue, LoopKind};
use crate::config::{BlockPolicyConfig, CycleLimitsConfig, GovernorConfig};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const HOUR: Duration = Duration::from_secs(3600);
/// Cap for blocks whose deadline would overflow the clock (about 30 years).
const FAR_FUTURE_SECS: u64 = 86_400 * 365 * 30;

#[derive(Default)]
struct CycleWindow {
    last_cycle: Option<Instant>,
    blocked_until: Option<Instant>,
    runs: VecDeque<Instant>,
}

impl CycleWindow {
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.runs.front() {
            if now.saturating_duration_since(*oldest) >= HOUR {
                self.runs.pop_front();
            } else {
                break;
            }
        }
    }

    fn remaining_cooldown(&self, now: Instant, cooldown: Duration) -> Duration {
        let from_cooldown = self
            .last_cycle
            .map(|last| cooldown.saturating_sub(now.saturating_duration_since(last)))
            .unwrap_or_default();
        let from_block = self
            .blocked_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default();
        from_cooldown.max(from_block)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleGovernorStats {
    pub runs_last_hour: usize,
    pub max_per_hour: u32,
    pub cooldown_secs: u64,
    pub cooldown_remaining_secs: u64,
    pub blocked: bool,
}

/// Per-cycle-type rate limiter: a cooldown between runs, a cap on runs in
/// the trailing hour, and corrective blocks imposed after detected loops.
///
/// Uses `tokio::time::Instant` so tests can drive it with a paused clock.
pub struct CycleGovernor {
    config: GovernorConfig,
    windows: Mutex<HashMap<String, CycleWindow>>,
}

impl CycleGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Override the limits of one cycle type.
    #[must_use]
    pub fn with_limits(mut self, cycle_type: &str, cooldown: Duration, max_per_hour: u32) -> Self {
        self.config.cycles.insert(
            cycle_type.to_string(),
            CycleLimitsConfig {
                cooldown_secs: cooldown.as_secs(),
                max_per_hour,
            },
        );
        self
    }

    pub fn limits_for(&self, cycle_type: &str) -> CycleLimitsConfig {
        self.config.limits_for(cycle_type)
    }

    pub fn block_policy(&self) -> &BlockPolicyConfig {
        &self.config.blocks
    }

    /// Admission check. Returns `Err(reason)` when the cycle must not run.
    pub fn can_run_cycle(&self, cycle_type: &str) -> Result<(), String> {
        let limits = self.limits_for(cycle_type);
        let now = Instant::now();
        let Ok(mut windows) = self.windows.lock() else {
            return Err("governor state unavailable".to_string());
        };
        let Some(window) = windows.get_mut(cycle_type) else {
            return Ok(());
        };

        let remaining = window.remaining_cooldown(now, Duration::from_secs(limits.cooldown_secs));
        if !remaining.is_zero() {
            return Err(format!(
                "Cooldown active: {}s remaining",
                remaining.as_secs_f64().ceil() as u64
            ));
        }

        window.prune(now);
        let runs = window.runs.len();
        if runs >= limits.max_per_hour as usize {
            return Err(format!(
                "Hourly limit reached: {}/{}",
                runs, limits.max_per_hour
            ));
        }
        Ok(())
    }

    /// Note that a cycle ran now.
    pub fn record_cycle(&self, cycle_type: &str) {
        let now = Instant::now();
        let Ok(mut windows) = self.windows.lock() else {
            warn!("governor mutex poisoned, cycle '{}' not recorded", cycle_type);
            return;
        };
        let window = windows.entry(cycle_type.to_string()).or_default();
        window.prune(now);
        window.runs.push_back(now);
        window.last_cycle = Some(now);
        debug!(
            "Recorded '{}' cycle ({} in the last hour)",
            cycle_type,
            window.runs.len()
        );
    }

    /// Deny `cycle_type` for `duration` regardless of its cooldown. A shorter
    /// block never shortens an active longer one.
    pub fn block_cycle(&self, cycle_type: &str, duration: Duration) {
        let now = Instant::now();
        let until = now
            .checked_add(duration)
            .unwrap_or_else(|| now + Duration::from_secs(FAR_FUTURE_SECS));
        let Ok(mut windows) = self.windows.lock() else {
            return;
        };
        let window = windows.entry(cycle_type.to_string()).or_default();
        if window.blocked_until.is_none_or(|current| current < until) {
            window.blocked_until = Some(until);
        }
        info!("Blocked '{}' cycles for {}s", cycle_type, duration.as_secs());
    }

    /// Apply the corrective block for a detected loop. Returns the cycle
    /// types that were blocked.
    pub fn enforce_circular_logic_block(&self, issue: &CircularIssue) -> Vec<&'static str> {
        let blocks = &self.config.blocks;
        let (cycles, secs): (&[&'static str], u64) = match issue.kind {
            LoopKind::ResearchImprovementLoop => {
                (&["research", "improvement"][..], blocks.research_improvement_secs)
            }
            LoopKind::SelfEvaluationLoop => (&["self_evaluation"][..], blocks.self_evaluation_secs),
            LoopKind::RestartLoop => (&["restart"][..], blocks.restart_secs),
            LoopKind::ErrorRecoveryLoop => (&["improvement"][..], blocks.error_recovery_secs),
        };
        for cycle in cycles {
            self.block_cycle(cycle, Duration::from_secs(secs));
        }
        warn!(
            "Enforced {} block on {:?} for {}s",
            issue.kind, cycles, secs
        );
        cycles.to_vec()
    }

    /// Per-cycle snapshot for every cycle type seen so far.
    pub fn get_governor_stats(&self) -> BTreeMap<String, CycleGovernorStats> {
        let now = Instant::now();
        let Ok(mut windows) = self.windows.lock() else {
            return BTreeMap::new();
        };
        windows
            .iter_mut()
            .map(|(name, window)| {
                window.prune(now);
                let limits = self.config.limits_for(name);
                let remaining =
                    window.remaining_cooldown(now, Duration::from_secs(limits.cooldown_secs));
                let stats = CycleGovernorStats {
                    runs_last_hour: window.runs.len(),
                    max_per_hour: limits.max_per_hour,
                    cooldown_secs: limits.cooldown_secs,
                    cooldown_remaining_secs: remaining.as_secs_f64().ceil() as u64,
                    blocked: window.blocked_until.is_some_and(|until| until > now),
                };
                (name.clone(), stats)
            })
            .collect()
    }
}

impl Default for CycleGovernor {
    fn default() -> Self {
        Self::new(GovernorConfig::default())
    }
}

#[cfg(test)]
mod tests;
