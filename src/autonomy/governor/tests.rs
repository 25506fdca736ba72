use super::*;
use crate::autonomy::detector::Severity;

fn issue(kind: LoopKind) -> CircularIssue {
    CircularIssue {
        kind,
        severity: Severity::Medium,
        description: String::new(),
        suggestion: String::new(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_unknown_cycle_is_allowed() {
    let governor = CycleGovernor::default();
    assert!(governor.can_run_cycle("anything").is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_blocks_then_expires() {
    let governor = CycleGovernor::default().with_limits("research", Duration::from_secs(300), 10);
    governor.record_cycle("research");

    let reason = governor.can_run_cycle("research").unwrap_err();
    assert_eq!(reason, "Cooldown active: 300s remaining");

    tokio::time::advance(Duration::from_secs(120)).await;
    let reason = governor.can_run_cycle("research").unwrap_err();
    assert_eq!(reason, "Cooldown active: 180s remaining");

    tokio::time::advance(Duration::from_secs(181)).await;
    assert!(governor.can_run_cycle("research").is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_hourly_limit() {
    let governor = CycleGovernor::default().with_limits("google_cli", Duration::from_secs(60), 3);
    for _ in 0..3 {
        assert!(governor.can_run_cycle("google_cli").is_ok());
        governor.record_cycle("google_cli");
        tokio::time::advance(Duration::from_secs(61)).await;
    }
    let reason = governor.can_run_cycle("google_cli").unwrap_err();
    assert_eq!(reason, "Hourly limit reached: 3/3");

    // the first run leaves the trailing hour after 3600s
    tokio::time::advance(Duration::from_secs(3600 - 3 * 61)).await;
    assert!(governor.can_run_cycle("google_cli").is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_block_overrides_short_cooldown() {
    let governor = CycleGovernor::default().with_limits("restart", Duration::ZERO, 100);
    assert!(governor.can_run_cycle("restart").is_ok());
    governor.block_cycle("restart", Duration::from_secs(90));
    assert_eq!(
        governor.can_run_cycle("restart").unwrap_err(),
        "Cooldown active: 90s remaining"
    );

    // a shorter block does not shorten the active one
    governor.block_cycle("restart", Duration::from_secs(10));
    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(governor.can_run_cycle("restart").is_err());

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(governor.can_run_cycle("restart").is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_block_is_capped() {
    let governor = CycleGovernor::default();
    governor.block_cycle("restart", Duration::MAX);
    let reason = governor.can_run_cycle("restart").unwrap_err();
    assert!(reason.starts_with("Cooldown active"), "{reason}");

    tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
    assert!(governor.can_run_cycle("restart").is_err());
}

#[tokio::test(start_paused = true)]
async fn test_enforce_research_improvement_block() {
    let governor = CycleGovernor::default();
    let blocked = governor.enforce_circular_logic_block(&issue(LoopKind::ResearchImprovementLoop));
    assert_eq!(blocked, vec!["research", "improvement"]);
    assert!(governor.can_run_cycle("research").is_err());
    assert!(governor.can_run_cycle("improvement").is_err());
    assert!(governor.can_run_cycle("distillation").is_ok());

    tokio::time::advance(Duration::from_secs(601)).await;
    assert!(governor.can_run_cycle("research").is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_enforce_block_durations_follow_policy() {
    let governor = CycleGovernor::default();
    governor.enforce_circular_logic_block(&issue(LoopKind::SelfEvaluationLoop));
    governor.enforce_circular_logic_block(&issue(LoopKind::RestartLoop));
    governor.enforce_circular_logic_block(&issue(LoopKind::ErrorRecoveryLoop));

    tokio::time::advance(Duration::from_secs(901)).await;
    assert!(governor.can_run_cycle("improvement").is_ok());
    assert!(governor.can_run_cycle("restart").is_err());

    tokio::time::advance(Duration::from_secs(900)).await;
    assert!(governor.can_run_cycle("restart").is_ok());
    assert!(governor.can_run_cycle("self_evaluation").is_err());

    tokio::time::advance(Duration::from_secs(1800)).await;
    assert!(governor.can_run_cycle("self_evaluation").is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_governor_stats() {
    let governor = CycleGovernor::default();
    governor.record_cycle("research");
    governor.block_cycle("restart", Duration::from_secs(30));

    let stats = governor.get_governor_stats();
    let research = &stats["research"];
    assert_eq!(research.runs_last_hour, 1);
    assert_eq!(research.cooldown_secs, 300);
    assert_eq!(research.cooldown_remaining_secs, 300);
    assert!(!research.blocked);
    assert!(stats["restart"].blocked);
    assert_eq!(stats["restart"].runs_last_hour, 0);

    tokio::time::advance(Duration::from_secs(3600)).await;
    let stats = governor.get_governor_stats();
    assert_eq!(stats["research"].runs_last_hour, 0);
    assert!(!stats["restart"].blocked);
}
