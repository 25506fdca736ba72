//! Autonomous cycle orchestration: loop detection, per-cycle governance and
//! the controller that ties them to an external task queue.

pub mod controller;
pub mod detector;
pub mod governor;
pub mod task_source;

pub use controller::{
    AutonomousController, ControllerStatus, CycleDefinition, CycleHandler, CycleRun, TickOutcome,
    TickReport, cycle_fn,
};
pub use detector::{
    CircularIssue, CircularLogicDetector, CyclePhase, CycleRecord, CycleStats, LoopKind, Severity,
};
pub use governor::{CycleGovernor, CycleGovernorStats};
pub use task_source::{TaskContext, TaskQueue, TaskSource};
