//! Property tests for engine-level guarantees
//!
//! - Address serialization round-trips
//! - Determinism of pure rules (identical key sets across runs)
//! - Monotonicity of results under trace extension

use proptest::prelude::*;
use serde_json::Value as Json;
use vigil_core::Range;
use vigil_runtime::{Policy, PolicyParameters};
use vigil_test_utils::{assistant, user};

// ============================================================================
// ADDRESS ROUND-TRIP
// ============================================================================

fn path_segment() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z_]{1,8}",
        (0usize..12).prop_map(|n| n.to_string()),
    ]
}

fn json_path() -> impl Strategy<Value = String> {
    prop::collection::vec(path_segment(), 1..5).prop_map(|segments| segments.join("."))
}

proptest! {
    #[test]
    fn object_level_addresses_round_trip(path in json_path()) {
        let range = Range {
            object_id: None,
            start: None,
            end: None,
            json_path: Some(path),
        };
        let back = Range::from_address(&range.to_address());
        prop_assert_eq!(back.json_path, range.json_path);
        prop_assert_eq!(back.start, None);
        prop_assert_eq!(back.end, None);
    }

    #[test]
    fn character_level_addresses_round_trip(
        path in json_path(),
        start in 0usize..500,
        len in 1usize..100,
    ) {
        let range = Range {
            object_id: None,
            start: Some(start),
            end: Some(start + len),
            json_path: Some(path),
        };
        let back = Range::from_address(&range.to_address());
        prop_assert_eq!(back.json_path, range.json_path);
        prop_assert_eq!(back.start, range.start);
        prop_assert_eq!(back.end, range.end);
    }
}

// ============================================================================
// DETERMINISM AND MONOTONICITY
// ============================================================================

const PURE_POLICY: &str = r#"
raise "assistant content" if:
    (m: Message)
    m.role == "assistant"
    "a" in m.content
"#;

fn message(role_is_assistant: bool, text: &str) -> Json {
    if role_is_assistant {
        assistant(text)
    } else {
        user(text)
    }
}

fn key_set(policy: &Policy, trace: &[Json]) -> Vec<String> {
    let mut keys: Vec<String> = policy
        .analyze(trace, &PolicyParameters::new())
        .unwrap()
        .errors
        .iter()
        .filter_map(|e| e.key.clone())
        .collect();
    keys.sort();
    keys
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn pure_rules_are_deterministic(
        spec in prop::collection::vec((any::<bool>(), "[a-z ]{0,12}"), 0..8)
    ) {
        let trace: Vec<Json> = spec
            .iter()
            .map(|(is_assistant, text)| message(*is_assistant, text))
            .collect();
        let policy = Policy::from_string(PURE_POLICY).unwrap();
        prop_assert_eq!(key_set(&policy, &trace), key_set(&policy, &trace));
    }

    #[test]
    fn results_are_monotone_under_extension(
        spec in prop::collection::vec((any::<bool>(), "[a-z ]{0,12}"), 0..6),
        extension in prop::collection::vec((any::<bool>(), "[a-z ]{0,12}"), 0..4),
    ) {
        let trace: Vec<Json> = spec
            .iter()
            .map(|(is_assistant, text)| message(*is_assistant, text))
            .collect();
        let mut extended = trace.clone();
        extended.extend(
            extension
                .iter()
                .map(|(is_assistant, text)| message(*is_assistant, text)),
        );

        let policy = Policy::from_string(PURE_POLICY).unwrap();
        let base_keys = key_set(&policy, &trace);
        let extended_keys = key_set(&policy, &extended);
        for key in &base_keys {
            prop_assert!(extended_keys.contains(key));
        }
    }
}
