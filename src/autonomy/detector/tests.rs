use super::*;
use serde_json::json;

fn ok(detector: &CircularLogicDetector, cycle: &str) {
    detector.record_cycle_end(cycle, Ok(json!({"status": "ok"})));
}

#[test]
fn test_empty_history_has_no_issue() {
    assert!(CircularLogicDetector::new().detect_circular_logic().is_none());
}

#[test]
fn test_research_improvement_loop() {
    let detector = CircularLogicDetector::new();
    ok(&detector, "research");
    ok(&detector, "improvement");
    assert!(detector.detect_circular_logic().is_none());

    ok(&detector, "research");
    ok(&detector, "improvement");
    let issue = detector.detect_circular_logic().unwrap();
    assert_eq!(issue.kind, LoopKind::ResearchImprovementLoop);
    assert_eq!(issue.severity, Severity::Medium);
}

#[test]
fn test_research_improvement_outside_window_ignored() {
    let detector = CircularLogicDetector::new();
    ok(&detector, "research");
    ok(&detector, "improvement");
    for _ in 0..5 {
        ok(&detector, "distillation");
    }
    ok(&detector, "research");
    ok(&detector, "improvement");
    assert!(detector.detect_circular_logic().is_none());
}

#[test]
fn test_start_records_do_not_count() {
    let detector = CircularLogicDetector::new();
    for cycle in ["research", "improvement", "research", "improvement"] {
        detector.record_cycle_start(cycle, None);
    }
    assert!(detector.detect_circular_logic().is_none());
}

#[test]
fn test_self_evaluation_loop() {
    let detector = CircularLogicDetector::new();
    for cycle in [
        "self_evaluation",
        "iterative_improvement",
        "self_evaluation",
        "iterative_improvement",
    ] {
        ok(&detector, cycle);
    }
    let issue = detector.detect_circular_logic().unwrap();
    assert_eq!(issue.kind, LoopKind::SelfEvaluationLoop);
    assert_eq!(issue.severity, Severity::High);
}

#[test]
fn test_research_improvement_takes_priority() {
    let detector = CircularLogicDetector::new();
    for cycle in [
        "research",
        "improvement",
        "research",
        "improvement",
        "self_evaluation",
        "iterative_improvement",
    ] {
        ok(&detector, cycle);
    }
    // last 4 only hold one of each self-evaluation type
    let issue = detector.detect_circular_logic().unwrap();
    assert_eq!(issue.kind, LoopKind::ResearchImprovementLoop);
}

#[test]
fn test_restart_loop_requires_close_restarts() {
    let base = Utc::now() - chrono::Duration::hours(2);
    let detector = CircularLogicDetector::new();
    detector.record(
        CycleRecord::end("improvement", Ok(json!({"restart_triggered": true}))).at(base),
    );
    detector.record(
        CycleRecord::end("improvement", Ok(json!({"restart_needed": true})))
            .at(base + chrono::Duration::seconds(900)),
    );
    assert!(detector.detect_circular_logic().is_none());

    detector.record(
        CycleRecord::end("self_evaluation", Err("restart required after update".into()))
            .at(base + chrono::Duration::seconds(1200)),
    );
    let issue = detector.detect_circular_logic().unwrap();
    assert_eq!(issue.kind, LoopKind::RestartLoop);
    assert!(issue.description.contains("300s"));
}

#[test]
fn test_false_restart_flag_is_ignored() {
    let detector = CircularLogicDetector::new();
    for _ in 0..3 {
        detector.record_cycle_end("improvement", Ok(json!({"restart_triggered": false})));
    }
    assert!(detector.detect_circular_logic().is_none());
}

#[test]
fn test_error_recovery_loop_groups_by_prefix() {
    let detector = CircularLogicDetector::new();
    detector.record_cycle_end("crypto_trading", Err("ConnectionError: host a".into()));
    detector.record_cycle_end("google_cli", Err("ConnectionError: host b".into()));
    detector.record_cycle_end("distillation", Err("ValueError: bad".into()));
    assert!(detector.detect_circular_logic().is_none());

    detector.record_cycle_end(
        "browser_automation",
        Ok(json!({"error": "ConnectionError: host c"})),
    );
    let issue = detector.detect_circular_logic().unwrap();
    assert_eq!(issue.kind, LoopKind::ErrorRecoveryLoop);
    assert!(issue.description.contains("ConnectionError"));
}

#[test]
fn test_history_is_bounded_fifo() {
    let detector = CircularLogicDetector::new();
    for i in 0..(HISTORY_LIMIT + 5) {
        detector.record_cycle_start(&format!("c{i}"), None);
    }
    let history = detector.history();
    assert_eq!(history.len(), HISTORY_LIMIT);
    assert_eq!(history[0].cycle_type, "c5");
}

#[test]
fn test_cycle_stats_and_actions() {
    let detector = CircularLogicDetector::new();
    detector.record_cycle_start("research", None);
    detector.record_cycle_end("research", Err("Timeout: slow".into()));
    detector.record_cycle_start("distillation", None);
    for _ in 0..3 {
        detector.record_action("fetch_page");
    }
    detector.record_action("summarize");
    for i in 0..12 {
        detector.record_action(format!("misc_{i:02}"));
    }

    let stats = detector.get_cycle_stats();
    assert_eq!(stats.total_records, 3);
    assert_eq!(
        stats.by_type["research"],
        CycleTypeStats {
            starts: 1,
            ends: 1,
            errors: 1
        }
    );
    assert_eq!(stats.by_type["distillation"].starts, 1);
    assert_eq!(stats.recorded_actions, 16);
    assert_eq!(stats.top_actions.len(), 10);
    assert_eq!(
        stats.top_actions[0],
        ActionCount {
            action: "fetch_page".into(),
            count: 3
        }
    );
}

#[test]
fn test_actions_are_bounded() {
    let detector = CircularLogicDetector::new();
    for i in 0..(ACTION_LIMIT + 10) {
        detector.record_action(format!("a{i}"));
    }
    assert_eq!(detector.get_cycle_stats().recorded_actions, ACTION_LIMIT);
}

#[test]
fn test_clear_history() {
    let detector = CircularLogicDetector::new();
    ok(&detector, "research");
    detector.record_action("x");
    detector.clear_history();
    assert_eq!(detector.get_cycle_stats(), CycleStats::default());
}

#[test]
fn test_issue_serializes_type_tag() {
    let issue = CircularIssue {
        kind: LoopKind::RestartLoop,
        severity: Severity::High,
        description: "d".into(),
        suggestion: "s".into(),
    };
    let value = serde_json::to_value(&issue).unwrap();
    assert_eq!(value["type"], json!("restart_loop"));
    assert_eq!(value["severity"], json!("high"));
}

#[test]
fn test_acknowledged_loop_is_reported_once() {
    let detector = CircularLogicDetector::new();
    for cycle in ["research", "improvement", "research", "improvement"] {
        ok(&detector, cycle);
    }
    assert!(detector.detect_circular_logic().is_some());

    detector.acknowledge();
    assert!(detector.detect_circular_logic().is_none());
    assert_eq!(detector.history().len(), 4);
    assert_eq!(detector.get_cycle_stats().total_records, 4);

    // unrelated work after the acknowledgement stays clean
    ok(&detector, "distillation");
    ok(&detector, "research");
    assert!(detector.detect_circular_logic().is_none());

    // a fresh loop is detected again
    ok(&detector, "improvement");
    ok(&detector, "research");
    ok(&detector, "improvement");
    assert_eq!(
        detector.detect_circular_logic().unwrap().kind,
        LoopKind::ResearchImprovementLoop
    );
}

#[test]
fn test_acknowledge_survives_eviction() {
    let detector = CircularLogicDetector::new();
    for _ in 0..HISTORY_LIMIT / 2 {
        ok(&detector, "research");
        ok(&detector, "improvement");
    }
    detector.acknowledge();
    for _ in 0..HISTORY_LIMIT - 1 {
        ok(&detector, "distillation");
    }
    assert_eq!(detector.history().len(), HISTORY_LIMIT);
    assert!(detector.detect_circular_logic().is_none());

    for cycle in ["research", "improvement", "research", "improvement"] {
        ok(&detector, cycle);
    }
    assert!(detector.detect_circular_logic().is_some());
}
