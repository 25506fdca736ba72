//! Sliding-window detection of feedback loops between cycle types.
//!
//! Rules run in a fixed priority order over the recent `end` records and at
//! most one issue is reported per call. The detector only proposes a fix;
//! applying it is the controller's job.

use crate::autonomy::task_source::TaskContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Maximum cycle records retained (oldest evicted first).
pub const HISTORY_LIMIT: usize = 100;
/// Maximum fine-grained actions retained.
pub const ACTION_LIMIT: usize = 200;

const RESEARCH_IMPROVEMENT_WINDOW: usize = 6;
const SELF_EVALUATION_WINDOW: usize = 4;
const RESTART_WINDOW: usize = 20;
const RESTART_MIN_GAP_SECS: i64 = 600;
const ERROR_WINDOW: usize = 10;
const ERROR_REPEAT_THRESHOLD: usize = 3;
const TOP_ACTIONS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePhase {
    Start,
    End,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    #[serde(rename = "type")]
    pub cycle_type: String,
    pub timestamp: DateTime<Utc>,
    pub phase: CyclePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CycleRecord {
    pub fn start(cycle_type: impl Into<String>, task: Option<TaskContext>) -> Self {
        Self {
            cycle_type: cycle_type.into(),
            timestamp: Utc::now(),
            phase: CyclePhase::Start,
            task,
            result: None,
            error: None,
        }
    }

    pub fn end(cycle_type: impl Into<String>, outcome: Result<Value, String>) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(e) => (None, Some(e)),
        };
        Self {
            cycle_type: cycle_type.into(),
            timestamp: Utc::now(),
            phase: CyclePhase::End,
            task: None,
            result,
            error,
        }
    }

    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Error text from either the error field or an `error` key in the result.
    fn error_text(&self) -> Option<&str> {
        self.error.as_deref().or_else(|| {
            self.result
                .as_ref()
                .and_then(|r| r.get("error"))
                .and_then(Value::as_str)
        })
    }

    fn signals_restart(&self) -> bool {
        let flagged = self.result.as_ref().is_some_and(|r| {
            ["restart_triggered", "restart_needed"]
                .iter()
                .any(|key| r.get(*key).is_some_and(truthy))
        });
        flagged
            || self
                .error_text()
                .is_some_and(|e| e.to_ascii_lowercase().contains("restart"))
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    ResearchImprovementLoop,
    SelfEvaluationLoop,
    RestartLoop,
    ErrorRecoveryLoop,
}

impl LoopKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResearchImprovementLoop => "research_improvement_loop",
            Self::SelfEvaluationLoop => "self_evaluation_loop",
            Self::RestartLoop => "restart_loop",
            Self::ErrorRecoveryLoop => "error_recovery_loop",
        }
    }
}

impl std::fmt::Display for LoopKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircularIssue {
    #[serde(rename = "type")]
    pub kind: LoopKind,
    pub severity: Severity,
    pub description: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleTypeStats {
    pub starts: usize,
    pub ends: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionCount {
    pub action: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    pub total_records: usize,
    pub by_type: BTreeMap<String, CycleTypeStats>,
    pub recorded_actions: usize,
    pub top_actions: Vec<ActionCount>,
}

#[derive(Default)]
struct DetectorState {
    history: VecDeque<CycleRecord>,
    actions: VecDeque<String>,
    /// Records ever appended, including evicted ones.
    appended: u64,
    /// `appended` at the last acknowledged detection; older records are
    /// not evaluated again.
    watermark: u64,
}

impl DetectorState {
    /// History records appended after the last acknowledgement.
    fn unacknowledged(&self) -> impl Iterator<Item = &CycleRecord> {
        let first_kept = self.appended - self.history.len() as u64;
        let skip = self.watermark.saturating_sub(first_kept) as usize;
        self.history.iter().skip(skip)
    }
}

/// Rolling history of cycle events plus the loop-detection rules over it.
///
/// Safe to share: status queries take the same short lock the controller
/// uses for recording.
#[derive(Default)]
pub struct CircularLogicDetector {
    state: Mutex<DetectorState>,
}

impl CircularLogicDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle_start(&self, cycle_type: &str, task: Option<&TaskContext>) {
        self.record(CycleRecord::start(cycle_type, task.cloned()));
    }

    pub fn record_cycle_end(&self, cycle_type: &str, outcome: Result<Value, String>) {
        self.record(CycleRecord::end(cycle_type, outcome));
    }

    /// Append a record, evicting the oldest beyond [`HISTORY_LIMIT`].
    pub fn record(&self, record: CycleRecord) {
        let Ok(mut state) = self.state.lock() else {
            warn!("detector mutex poisoned, dropping cycle record");
            return;
        };
        if state.history.len() == HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back(record);
        state.appended += 1;
    }

    /// Append a fine-grained action label, evicting beyond [`ACTION_LIMIT`].
    pub fn record_action(&self, action: impl Into<String>) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.actions.len() == ACTION_LIMIT {
            state.actions.pop_front();
        }
        state.actions.push_back(action.into());
    }

    pub fn history(&self) -> Vec<CycleRecord> {
        self.state
            .lock()
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_history(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.history.clear();
            state.actions.clear();
            debug!("Cleared cycle history");
        }
    }

    /// Mark every record so far as handled. Detection afterwards only
    /// considers cycles recorded after this call, so one loop is reported
    /// once. History and stats are unaffected.
    pub fn acknowledge(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.watermark = state.appended;
            debug!("Acknowledged {} cycle record(s)", state.appended);
        }
    }

    /// Check the rules in priority order over unacknowledged records;
    /// returns the first match.
    pub fn detect_circular_logic(&self) -> Option<CircularIssue> {
        let Ok(state) = self.state.lock() else {
            warn!("detector mutex poisoned, skipping detection");
            return None;
        };
        let ends: Vec<&CycleRecord> = state
            .unacknowledged()
            .filter(|r| r.phase == CyclePhase::End)
            .collect();

        let issue = detect_research_improvement(&ends)
            .or_else(|| detect_self_evaluation(&ends))
            .or_else(|| detect_restart(&ends))
            .or_else(|| detect_error_recovery(&ends));
        if let Some(issue) = &issue {
            warn!(
                "Circular logic detected: {} ({:?}): {}",
                issue.kind, issue.severity, issue.description
            );
        }
        issue
    }

    pub fn get_cycle_stats(&self) -> CycleStats {
        let Ok(state) = self.state.lock() else {
            return CycleStats::default();
        };
        let mut by_type: BTreeMap<String, CycleTypeStats> = BTreeMap::new();
        for record in &state.history {
            let entry = by_type.entry(record.cycle_type.clone()).or_default();
            match record.phase {
                CyclePhase::Start => entry.starts += 1,
                CyclePhase::End => {
                    entry.ends += 1;
                    if record.error_text().is_some() {
                        entry.errors += 1;
                    }
                }
            }
        }

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for action in &state.actions {
            *counts.entry(action.as_str()).or_default() += 1;
        }
        let mut top_actions: Vec<ActionCount> = counts
            .into_iter()
            .map(|(action, count)| ActionCount {
                action: action.to_string(),
                count,
            })
            .collect();
        top_actions.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.action.cmp(&b.action)));
        top_actions.truncate(TOP_ACTIONS);

        CycleStats {
            total_records: state.history.len(),
            by_type,
            recorded_actions: state.actions.len(),
            top_actions,
        }
    }
}

fn last<'a>(ends: &'a [&'a CycleRecord], n: usize) -> &'a [&'a CycleRecord] {
    &ends[ends.len().saturating_sub(n)..]
}

fn count_type(records: &[&CycleRecord], cycle_type: &str) -> usize {
    records.iter().filter(|r| r.cycle_type == cycle_type).count()
}

fn detect_research_improvement(ends: &[&CycleRecord]) -> Option<CircularIssue> {
    let window = last(ends, RESEARCH_IMPROVEMENT_WINDOW);
    let research = count_type(window, "research");
    let improvement = count_type(window, "improvement");
    (research >= 2 && improvement >= 2).then(|| CircularIssue {
        kind: LoopKind::ResearchImprovementLoop,
        severity: Severity::Medium,
        description: format!(
            "research and improvement alternating: {research} research and {improvement} improvement runs in the last {} cycles",
            window.len()
        ),
        suggestion: "Pause research and improvement until a new task arrives".to_string(),
    })
}

fn detect_self_evaluation(ends: &[&CycleRecord]) -> Option<CircularIssue> {
    let window = last(ends, SELF_EVALUATION_WINDOW);
    let evaluation = count_type(window, "self_evaluation");
    let iterative = count_type(window, "iterative_improvement");
    (evaluation >= 2 && iterative >= 2).then(|| CircularIssue {
        kind: LoopKind::SelfEvaluationLoop,
        severity: Severity::High,
        description: format!(
            "self-evaluation feeding iterative improvement: {evaluation} evaluations and {iterative} improvement passes in the last {} cycles",
            window.len()
        ),
        suggestion: "Suspend self-evaluation and require an external task before re-evaluating"
            .to_string(),
    })
}

fn detect_restart(ends: &[&CycleRecord]) -> Option<CircularIssue> {
    let restarts: Vec<&CycleRecord> = last(ends, RESTART_WINDOW)
        .iter()
        .copied()
        .filter(|r| r.signals_restart())
        .collect();
    let gap = restarts.windows(2).find_map(|pair| {
        let secs = (pair[1].timestamp - pair[0].timestamp).num_seconds();
        (secs < RESTART_MIN_GAP_SECS).then_some(secs)
    })?;
    Some(CircularIssue {
        kind: LoopKind::RestartLoop,
        severity: Severity::High,
        description: format!(
            "restarts requested {gap}s apart ({} restart signals in recent cycles)",
            restarts.len()
        ),
        suggestion: "Block restarts and investigate why cycles keep requesting one".to_string(),
    })
}

fn detect_error_recovery(ends: &[&CycleRecord]) -> Option<CircularIssue> {
    let mut buckets: HashMap<&str, usize> = HashMap::new();
    for record in last(ends, ERROR_WINDOW) {
        if let Some(error) = record.error_text() {
            let kind = error.split(':').next().unwrap_or(error).trim();
            *buckets.entry(kind).or_default() += 1;
        }
    }
    let (kind, count) = buckets
        .into_iter()
        .filter(|(_, count)| *count >= ERROR_REPEAT_THRESHOLD)
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))?;
    Some(CircularIssue {
        kind: LoopKind::ErrorRecoveryLoop,
        severity: Severity::Medium,
        description: format!("error '{kind}' repeated {count} times in recent cycles"),
        suggestion: "Stop automatic improvement attempts until the recurring error is fixed"
            .to_string(),
    })
}

#[cfg(test)]
mod tests;
