//! Behavior tests for the incremental / monitor layer
//!
//! Verifies that repeated analyses of a growing trace only surface new
//! violations, and that pending-window analysis filters to errors touching
//! the pending suffix.

use serde_json::Value as Json;
use vigil_runtime::{AnalysisError, Monitor, Policy, PolicyParameters};
use vigil_test_utils::{assistant, user};

const ASSISTANT_POLICY: &str = r#"
raise PolicyViolation("assistant message:", msg) if:
    (msg: Message)
    msg.role == "assistant"
"#;

const CONTAINS_A_POLICY: &str = r#"
raise "found A" if:
    (m: Message)
    m.role == "assistant"
    "A" in m.content
"#;

fn keys(errors: &[vigil_runtime::ErrorInformation]) -> Vec<String> {
    errors.iter().filter_map(|e| e.key.clone()).collect()
}

// ============================================================================
// INCREMENTAL DEDUPLICATION
// ============================================================================

#[test]
fn repeated_analysis_reports_each_violation_once() {
    let mut policy = Policy::from_string(ASSISTANT_POLICY).unwrap().incremental();
    let params = PolicyParameters::new();

    let mut input: Vec<Json> = vec![user("Hello, world!")];
    let result = policy.analyze(&input, &params).unwrap();
    assert!(result.errors.is_empty());

    input.push(assistant("Hello, user 1"));
    let result = policy.analyze(&input, &params).unwrap();
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].to_string().contains("user 1"));

    input.push(assistant("Hello, user 2"));
    let result = policy.analyze(&input, &params).unwrap();
    assert_eq!(result.errors.len(), 1, "only the new violation is reported");
    assert!(result.errors[0].to_string().contains("user 2"));

    input.push(user("Hello, world!"));
    let result = policy.analyze(&input, &params).unwrap();
    assert!(result.errors.is_empty());
}

#[test]
fn incremental_results_equal_the_difference_of_full_runs() {
    let t1: Vec<Json> = vec![user("q"), assistant("a1")];
    let mut t2 = t1.clone();
    t2.push(assistant("a2"));
    t2.push(assistant("a3"));

    let full = Policy::from_string(ASSISTANT_POLICY).unwrap();
    let params = PolicyParameters::new();
    let keys_t1 = keys(&full.analyze(&t1, &params).unwrap().errors);
    let keys_t2 = keys(&full.analyze(&t2, &params).unwrap().errors);
    let expected: Vec<String> = keys_t2
        .iter()
        .filter(|k| !keys_t1.contains(k))
        .cloned()
        .collect();

    let mut incremental = Policy::from_string(ASSISTANT_POLICY).unwrap().incremental();
    incremental.analyze(&t1, &params).unwrap();
    let second = incremental.analyze(&t2, &params).unwrap();
    assert_eq!(keys(&second.errors), expected);
}

#[test]
fn reset_clears_the_seen_set() {
    let params = PolicyParameters::new();
    let trace: Vec<Json> = vec![assistant("a")];
    let mut policy = Policy::from_string(ASSISTANT_POLICY).unwrap().incremental();

    assert_eq!(policy.analyze(&trace, &params).unwrap().errors.len(), 1);
    assert_eq!(policy.analyze(&trace, &params).unwrap().errors.len(), 0);
    policy.reset();
    assert_eq!(policy.analyze(&trace, &params).unwrap().errors.len(), 1);
}

// ============================================================================
// PENDING-WINDOW ANALYSIS
// ============================================================================

#[test]
fn pending_analysis_reports_only_errors_touching_pending_events() {
    let policy = Policy::from_string(CONTAINS_A_POLICY).unwrap();
    let params = PolicyParameters::new();

    let past: Vec<Json> = vec![user("hi"), assistant("old A"), assistant("older A")];
    let pending: Vec<Json> = vec![
        assistant("Hello A!"),
        assistant("Hello BC!"),
        assistant("Bye A!"),
    ];

    let result = policy.analyze_pending(&past, &pending, &params).unwrap();
    assert_eq!(result.errors.len(), 2);
}

#[test]
fn pending_analysis_matches_the_filtered_full_analysis() {
    let policy = Policy::from_string(CONTAINS_A_POLICY).unwrap();
    let params = PolicyParameters::new();

    let past: Vec<Json> = vec![assistant("A old")];
    let pending: Vec<Json> = vec![assistant("A new")];
    let mut full_trace = past.clone();
    full_trace.extend(pending.clone());

    let full_keys = keys(&policy.analyze(&full_trace, &params).unwrap().errors);
    let pending_keys = keys(&policy.analyze_pending(&past, &pending, &params).unwrap().errors);

    assert_eq!(pending_keys.len(), 1);
    assert!(full_keys.contains(&pending_keys[0]));
    assert_eq!(full_keys.len(), 2);
}

// ============================================================================
// MONITOR
// ============================================================================

#[test]
fn monitor_check_walks_a_growing_trace() {
    let mut monitor = Monitor::from_string(CONTAINS_A_POLICY, PolicyParameters::new()).unwrap();

    let mut past: Vec<Json> = Vec::new();
    let pending = vec![user("hello")];
    assert!(monitor.check(&past, &pending).unwrap().is_empty());
    past.extend(pending);

    let pending = vec![assistant("contains A")];
    assert_eq!(monitor.check(&past, &pending).unwrap().len(), 1);
    past.extend(pending);

    // the old violation is not re-reported
    let pending = vec![assistant("harmless")];
    assert!(monitor.check(&past, &pending).unwrap().is_empty());
    past.extend(pending);

    let pending = vec![assistant("A again")];
    assert_eq!(monitor.check(&past, &pending).unwrap().len(), 1);
}

#[test]
fn monitor_raise_unhandled_converts_errors() {
    let mut monitor = Monitor::from_string(CONTAINS_A_POLICY, PolicyParameters::new())
        .unwrap()
        .raise_unhandled();

    let outcome = monitor.check(&[], &[assistant("A")]);
    match outcome {
        Err(AnalysisError::Unhandled(unhandled)) => {
            assert_eq!(unhandled.errors.len(), 1);
        }
        other => panic!("expected unhandled-error failure, got {:?}", other.map(|e| e.len())),
    }
}
