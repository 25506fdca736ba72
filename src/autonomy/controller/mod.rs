use crate::autonomy::detector::{CircularIssue, CircularLogicDetector, CycleStats};
use crate::autonomy::governor::{CycleGovernor, CycleGovernorStats};
use crate::autonomy::task_source::{TaskContext, TaskSource};
use crate::config::ControllerConfig;
use crate::errors::{CadenceError, CadenceResult};
use crate::utils::{atomic_write, expand_home};
use crate::utils::task_tracker::TaskTracker;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Work performed by one cycle type.
#[async_trait]
pub trait CycleHandler: Send + Sync {
    /// `task` is only provided to task-aware cycles. Non-object results are
    /// wrapped as `{"result": value}` before the detector sees them.
    async fn run(&self, task: Option<&TaskContext>) -> Result<Value>;
}

struct FnCycleHandler<F>(F);

#[async_trait]
impl<F, Fut> CycleHandler for FnCycleHandler<F>
where
    F: Fn(Option<TaskContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn run(&self, task: Option<&TaskContext>) -> Result<Value> {
        (self.0)(task.cloned()).await
    }
}

/// Adapt an async closure into a [`CycleHandler`].
pub fn cycle_fn<F, Fut>(f: F) -> Arc<dyn CycleHandler>
where
    F: Fn(Option<TaskContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnCycleHandler(f))
}

#[derive(Clone)]
pub struct CycleDefinition {
    pub name: String,
    pub period: Duration,
    /// Key under which the last successful run is persisted.
    pub last_run_key: String,
    pub task_aware: bool,
    pub handler: Arc<dyn CycleHandler>,
}

impl CycleDefinition {
    pub fn new(name: impl Into<String>, period: Duration, handler: Arc<dyn CycleHandler>) -> Self {
        let name = name.into();
        Self {
            last_run_key: format!("last_{name}"),
            name,
            period,
            task_aware: false,
            handler,
        }
    }

    #[must_use]
    pub fn task_aware(mut self, task_aware: bool) -> Self {
        self.task_aware = task_aware;
        self
    }
}

impl std::fmt::Debug for CycleDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleDefinition")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("last_run_key", &self.last_run_key)
            .field("task_aware", &self.task_aware)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleRun {
    pub cycle: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub task_id: String,
    pub executed: Vec<CycleRun>,
    /// Due cycles the governor refused, with its reason.
    pub denied: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// A loop was detected and corrective blocks applied; nothing ran.
    CircularLogic {
        issue: CircularIssue,
        blocked: Vec<&'static str>,
    },
    /// No explicit task is pending; nothing ran.
    NoTask,
    Ran(TickReport),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_runs: BTreeMap<String, DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleStatus {
    pub name: String,
    pub period_secs: u64,
    pub task_aware: bool,
    pub last_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub running: bool,
    pub cycles: Vec<CycleStatus>,
    pub detector: CycleStats,
    pub governor: BTreeMap<String, CycleGovernorStats>,
}

/// Orchestrates cycle execution: loop detection, task gating, governor
/// admission, execution, bookkeeping. One background loop per instance;
/// clones share all state.
#[derive(Clone)]
pub struct AutonomousController {
    config: Arc<ControllerConfig>,
    cycles: Arc<RwLock<Vec<CycleDefinition>>>,
    detector: Arc<CircularLogicDetector>,
    governor: Arc<CycleGovernor>,
    task_source: Arc<dyn TaskSource>,
    last_runs: Arc<Mutex<BTreeMap<String, DateTime<Utc>>>>,
    state_path: Option<PathBuf>,
    running: Arc<Mutex<bool>>,
    task_tracker: Arc<TaskTracker>,
}

impl AutonomousController {
    pub fn new(
        config: ControllerConfig,
        governor: CycleGovernor,
        task_source: Arc<dyn TaskSource>,
    ) -> Self {
        Self {
            state_path: config
                .state_path
                .as_ref()
                .map(|p| expand_home(&p.to_string_lossy())),
            config: Arc::new(config),
            cycles: Arc::new(RwLock::new(Vec::new())),
            detector: Arc::new(CircularLogicDetector::new()),
            governor: Arc::new(governor),
            task_source,
            last_runs: Arc::new(Mutex::new(BTreeMap::new())),
            running: Arc::new(Mutex::new(false)),
            task_tracker: Arc::new(TaskTracker::new()),
        }
    }

    #[must_use]
    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    pub fn detector(&self) -> &Arc<CircularLogicDetector> {
        &self.detector
    }

    pub fn governor(&self) -> &Arc<CycleGovernor> {
        &self.governor
    }

    /// Add (or replace by name) a cycle.
    pub fn register_cycle(&self, cycle: CycleDefinition) {
        let Ok(mut cycles) = self.cycles.write() else {
            warn!("cycle table lock poisoned, '{}' not registered", cycle.name);
            return;
        };
        debug!(
            "Registered cycle '{}' every {}s",
            cycle.name,
            cycle.period.as_secs()
        );
        match cycles.iter_mut().find(|c| c.name == cycle.name) {
            Some(existing) => *existing = cycle,
            None => cycles.push(cycle),
        }
    }

    /// Register a handler for a cycle configured under `controller.cycles`,
    /// taking its period and task-awareness from the config.
    pub fn register_handler(&self, name: &str, handler: Arc<dyn CycleHandler>) -> CadenceResult<()> {
        let cycle = self.config.cycle(name).ok_or_else(|| {
            CadenceError::Config(format!("cycle '{name}' is not configured in controller.cycles"))
        })?;
        self.register_cycle(
            CycleDefinition::new(name, cycle.period(), handler).task_aware(cycle.task_aware),
        );
        Ok(())
    }

    /// Change a cycle's period at runtime. Returns `false` for unknown cycles.
    pub fn set_cycle_period(&self, name: &str, period: Duration) -> bool {
        let Ok(mut cycles) = self.cycles.write() else {
            return false;
        };
        let Some(cycle) = cycles.iter_mut().find(|c| c.name == name) else {
            return false;
        };
        info!(
            "Cycle '{}' period changed {}s -> {}s",
            name,
            cycle.period.as_secs(),
            period.as_secs()
        );
        cycle.period = period;
        true
    }

    fn cycles_snapshot(&self) -> Vec<CycleDefinition> {
        self.cycles
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// One pass of the control algorithm. Errors come from the task source
    /// or state persistence; cycle failures are recorded, not returned.
    pub async fn tick(&self) -> Result<TickOutcome> {
        if let Some(issue) = self.detector.detect_circular_logic() {
            let blocked = self.governor.enforce_circular_logic_block(&issue);
            // the blocks now carry the correction; later ticks judge new cycles only
            self.detector.acknowledge();
            return Ok(TickOutcome::CircularLogic { issue, blocked });
        }

        let Some(task) = self
            .task_source
            .next_task()
            .await
            .context("Failed to fetch next task")?
        else {
            debug!("No explicit task pending; cycles paused");
            return Ok(TickOutcome::NoTask);
        };
        info!("Processing task '{}' ({})", task.title, task.id);

        let now = Utc::now();
        let mut report = TickReport {
            task_id: task.id.clone(),
            executed: Vec::new(),
            denied: Vec::new(),
        };

        for cycle in self.cycles_snapshot() {
            let last_run = self.last_runs.lock().await.get(&cycle.last_run_key).copied();
            let due = last_run.is_none_or(|last| {
                (now - last).to_std().unwrap_or_default() > cycle.period
            });
            if !due {
                continue;
            }

            if let Err(reason) = self.governor.can_run_cycle(&cycle.name) {
                info!("Cycle '{}' blocked: {}", cycle.name, reason);
                self.detector.record_action(format!("blocked:{}", cycle.name));
                report.denied.push((cycle.name.clone(), reason));
                continue;
            }

            report.executed.push(self.run_cycle(&cycle, &task, now).await);
        }

        self.save_state().await?;
        Ok(TickOutcome::Ran(report))
    }

    async fn run_cycle(&self, cycle: &CycleDefinition, task: &TaskContext, now: DateTime<Utc>) -> CycleRun {
        self.detector.record_cycle_start(&cycle.name, Some(task));
        self.detector.record_action(format!("run:{}", cycle.name));

        let context = cycle.task_aware.then_some(task);
        let outcome = AssertUnwindSafe(cycle.handler.run(context))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(Ok(value)) => Ok(if value.is_object() {
                value
            } else {
                json!({ "result": value })
            }),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => Err(format!("cycle '{}' panicked", cycle.name)),
        };

        let run = match &result {
            Ok(_) => {
                info!("Cycle '{}' completed", cycle.name);
                self.last_runs
                    .lock()
                    .await
                    .insert(cycle.last_run_key.clone(), now);
                CycleRun {
                    cycle: cycle.name.clone(),
                    success: true,
                    error: None,
                }
            }
            Err(e) => {
                warn!("Cycle '{}' failed: {}", cycle.name, e);
                CycleRun {
                    cycle: cycle.name.clone(),
                    success: false,
                    error: Some(e.clone()),
                }
            }
        };
        self.detector.record_cycle_end(&cycle.name, result);
        self.governor.record_cycle(&cycle.name);
        run
    }

    /// Load persisted last-run times. Missing or corrupt state starts empty.
    pub async fn load_state(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        if !path.exists() {
            return;
        }
        let parsed = std::fs::read_to_string(path)
            .map_err(anyhow::Error::from)
            .and_then(|content| serde_json::from_str::<StateFile>(&content).map_err(Into::into));
        match parsed {
            Ok(state) => {
                debug!("Loaded {} cycle last-run time(s)", state.last_runs.len());
                *self.last_runs.lock().await = state.last_runs;
            }
            Err(e) => warn!(
                "Controller state {} unreadable, starting fresh: {}",
                path.display(),
                e
            ),
        }
    }

    async fn save_state(&self) -> Result<()> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let state = StateFile {
            saved_at: Some(Utc::now()),
            last_runs: self.last_runs.lock().await.clone(),
        };
        let content = serde_json::to_string_pretty(&state)?;
        atomic_write(path, &content)
            .with_context(|| format!("Failed to save controller state to {}", path.display()))
    }

    pub async fn last_run(&self, cycle_name: &str) -> Option<DateTime<Utc>> {
        self.last_runs
            .lock()
            .await
            .get(&format!("last_{cycle_name}"))
            .copied()
    }

    pub async fn status(&self) -> ControllerStatus {
        let running = *self.running.lock().await;
        let last_runs = self.last_runs.lock().await.clone();
        let cycles = self
            .cycles_snapshot()
            .into_iter()
            .map(|c| CycleStatus {
                last_run: last_runs.get(&c.last_run_key).copied(),
                name: c.name,
                period_secs: c.period.as_secs(),
                task_aware: c.task_aware,
            })
            .collect();
        ControllerStatus {
            running,
            cycles,
            detector: self.detector.get_cycle_stats(),
            governor: self.governor.get_governor_stats(),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.lock().await
    }

    /// Start the control loop. No-op when already running.
    pub async fn start(&self) -> Result<()> {
        {
            let mut running = self.running.lock().await;
            if *running {
                return Ok(());
            }
            *running = true;
        }
        self.load_state().await;

        let controller = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                if !*controller.running.lock().await {
                    break;
                }
                let pause = controller.tick_guarded().await;
                tokio::time::sleep(pause).await;
            }
        });
        self.task_tracker
            .spawn("autonomous_controller".to_string(), handle)
            .await;

        info!(
            "Autonomous controller started ({} cycles)",
            self.cycles_snapshot().len()
        );
        Ok(())
    }

    pub async fn stop(&self) {
        {
            let mut running = self.running.lock().await;
            if !*running {
                return;
            }
            *running = false;
        }
        self.task_tracker.cancel_all().await;
        info!("Autonomous controller stopped");
    }

    /// Run one tick, never failing: returns how long to pause afterwards.
    async fn tick_guarded(&self) -> Duration {
        let secs = match AssertUnwindSafe(self.tick()).catch_unwind().await {
            Ok(Ok(TickOutcome::CircularLogic { issue, blocked })) => {
                warn!(
                    "Paused after {}: blocked {:?}. {}",
                    issue.kind, blocked, issue.suggestion
                );
                self.config.circular_pause_secs
            }
            Ok(Ok(TickOutcome::NoTask)) => self.config.idle_pause_secs,
            Ok(Ok(TickOutcome::Ran(report))) => {
                debug!(
                    "Tick ran {} cycle(s), {} denied",
                    report.executed.len(),
                    report.denied.len()
                );
                self.config.tick_interval_secs
            }
            Ok(Err(e)) => {
                error!("Controller tick failed: {:#}", e);
                self.config.error_pause_secs
            }
            Err(_) => {
                error!("Controller tick panicked");
                self.config.error_pause_secs
            }
        };
        Duration::from_secs(secs)
    }
}
