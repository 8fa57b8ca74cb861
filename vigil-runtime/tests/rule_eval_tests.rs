//! Behavior tests for rule evaluation against traces
//!
//! Covers the core analysis scenarios: sequenced tool-call rules over the
//! flow relation, content matching with character ranges, predicates,
//! quantifier bounds, semantic patterns with value references, policy
//! parameters and the restricted attribute surface.

use serde_json::json;
use vigil_core::Value;
use vigil_runtime::{AnalysisError, AnalysisResult, Policy, PolicyParameters};
use vigil_test_utils::{
    assistant, assistant_call, assistant_calls, chunked_message, fetch_then_run_trace,
    inbox_then_send_trace, system, tool_call, tool_output, unlinked_tool_output, user,
};

fn analyze(policy: &str, events: &[serde_json::Value]) -> AnalysisResult {
    Policy::from_string(policy)
        .expect("policy should load")
        .analyze(events, &PolicyParameters::new())
        .expect("analysis should succeed")
}

fn addresses(result: &AnalysisResult) -> Vec<String> {
    result
        .errors
        .iter()
        .flat_map(|error| error.ranges.iter().map(|r| r.to_address()))
        .collect()
}

// ============================================================================
// SEQUENCED TOOL CALLS (FLOW)
// ============================================================================

#[test]
fn sequenced_tool_call_rule_fires_once() {
    let policy = r#"
raise "bad tool sequence" if:
    (c1: ToolCall) -> (c2: ToolCall)
    c1 is tool:something({x: 2})
    c2 is tool:something_else({x: 10})
"#;
    let trace = vec![
        system("be helpful"),
        user("do the thing"),
        assistant_call("1", "something", json!({"x": 2})),
        tool_output("1", "ok"),
        assistant_call("2", "something_else", json!({"x": 10})),
        tool_output("2", "ok"),
    ];

    let result = analyze(policy, &trace);
    assert_eq!(result.errors.len(), 1);
}

#[test]
fn flow_rule_respects_order() {
    let policy = r#"
raise "bad tool sequence" if:
    (c1: ToolCall) -> (c2: ToolCall)
    c1 is tool:something({x: 2})
    c2 is tool:something_else({x: 10})
"#;
    // the matching calls appear in the wrong order
    let trace = vec![
        assistant_call("1", "something_else", json!({"x": 10})),
        tool_output("1", "ok"),
        assistant_call("2", "something", json!({"x": 2})),
        tool_output("2", "ok"),
    ];

    let result = analyze(policy, &trace);
    assert!(result.errors.is_empty());
}

#[test]
fn unsafe_code_after_url_fetch() {
    let policy = r#"
uses_os(run: ToolCall) :=
    "import os" in run.function.arguments.code

raise "unsafe code executed after URL fetch" if:
    (fetch: ToolCall) -> (run: ToolCall)
    fetch is tool:get_url
    run is tool:run_python
    uses_os(run)
"#;
    let bad = fetch_then_run_trace("import os\nos.system('ls')");
    assert_eq!(analyze(policy, &bad).errors.len(), 1);

    let good = fetch_then_run_trace("import math\nprint(math.pi)");
    assert!(analyze(policy, &good).errors.is_empty());
}

// ============================================================================
// CONTENT MATCHING AND RANGES
// ============================================================================

#[test]
fn content_match_reports_character_range() {
    let policy = r#"
raise "hit" if:
    (m: Message)
    m.role == "assistant"
    "X" in m.content
"#;
    let result = analyze(policy, &[assistant("Hello, X")]);
    assert_eq!(result.errors.len(), 1);

    let addrs = addresses(&result);
    assert!(addrs.contains(&"messages.0.content:7-8".to_string()), "{:?}", addrs);
    assert!(addrs.contains(&"messages.0".to_string()));
    assert!(!addrs.contains(&"messages.0.content:0-8".to_string()));
}

#[test]
fn constants_participate_in_matching() {
    let policy = r#"
INVALID_PATTERN := "X"

raise "hit" if:
    (m: Message)
    m.role == "assistant"
    INVALID_PATTERN in m.content
"#;
    let result = analyze(policy, &[assistant("Hello, X")]);
    assert_eq!(result.errors.len(), 1);
    assert!(addresses(&result).contains(&"messages.0.content:7-8".to_string()));
}

#[test]
fn regex_find_marks_every_match() {
    let policy = r#"
raise "digits" if:
    (m: Message)
    m.role == "assistant"
    len(find("[0-9]+", m.content)) > 1
"#;
    let result = analyze(policy, &[assistant("codes 12 and 345")]);
    assert_eq!(result.errors.len(), 1);

    let addrs = addresses(&result);
    assert!(addrs.contains(&"messages.0.content:6-8".to_string()), "{:?}", addrs);
    assert!(addrs.contains(&"messages.0.content:13-16".to_string()));
}

#[test]
fn chunked_content_is_searched_per_chunk() {
    let policy = r#"
raise "hit" if:
    (m: Message)
    "secret" in m.content
"#;
    let trace = vec![chunked_message(
        "assistant",
        &[("text", "nothing here"), ("text", "the secret word")],
    )];
    let result = analyze(policy, &trace);
    assert_eq!(result.errors.len(), 1);
    assert!(addresses(&result).contains(&"messages.0.content.1.text:4-10".to_string()));
}

#[test]
fn containment_in_none_is_false_not_an_error() {
    let policy = r#"
raise "hit" if:
    (m: Message)
    "x" in m.content
"#;
    // content is null for the tool-call message
    let result = analyze(policy, &[assistant_call("1", "noop", json!({}))]);
    assert!(result.errors.is_empty());
}

// ============================================================================
// IMMEDIATE SUCCESSION
// ============================================================================

#[test]
fn successor_operator_only_pairs_adjacent_events() {
    let policy = r#"
raise "user then assistant" if:
    (m1: Message) ~> (m2: Message)
    m1.role == "user"
    m2.role == "assistant"
"#;
    let trace = vec![user("a"), assistant("b"), user("c"), assistant("d")];
    let result = analyze(policy, &trace);
    // pairs (0,1) and (2,3); never (0,3)
    assert_eq!(result.errors.len(), 2);
}

// ============================================================================
// QUANTIFIERS
// ============================================================================

const COUNT_POLICY: &str = r#"
raise "inbox polled an odd number of times" if:
    count(min=2, max=4):
        (t: ToolCall)
        t is tool:get_inbox
"#;

fn inbox_calls(n: usize) -> Vec<serde_json::Value> {
    (0..n)
        .map(|i| assistant_call(&format!("{}", i), "get_inbox", json!({})))
        .collect()
}

#[test]
fn count_quantifier_fires_within_bounds() {
    assert_eq!(analyze(COUNT_POLICY, &inbox_calls(2)).errors.len(), 1);
}

#[test]
fn count_quantifier_respects_lower_bound() {
    assert!(analyze(COUNT_POLICY, &inbox_calls(1)).errors.is_empty());
}

#[test]
fn count_quantifier_respects_upper_bound() {
    assert!(analyze(COUNT_POLICY, &inbox_calls(5)).errors.is_empty());
}

#[test]
fn forall_quantifier_requires_every_assignment() {
    let policy = r#"
raise "only users spoke" if:
    forall:
        (m: Message)
        m.role == "user"
"#;
    assert_eq!(analyze(policy, &[user("a"), user("b")]).errors.len(), 1);
    assert!(analyze(policy, &[user("a"), assistant("b")]).errors.is_empty());
}

// ============================================================================
// SEMANTIC PATTERNS
// ============================================================================

#[test]
fn bare_tool_references_match_by_name() {
    let policy = r#"
raise "inbox access" if:
    (c: ToolCall)
    c is tool:get_inbox
"#;
    let trace = vec![
        assistant_call("1", "get_inbox", json!({})),
        assistant_call("2", "send_mail", json!({"to": "x"})),
    ];
    assert_eq!(analyze(policy, &trace).errors.len(), 1);
}

#[test]
fn patterns_match_argument_values_and_wildcards() {
    let policy = r#"
raise "urgent send" if:
    (c: ToolCall)
    c is tool:send_mail({urgent: True, to: *})
"#;
    let trace = vec![
        assistant_call("1", "send_mail", json!({"urgent": true, "to": "a@example.com"})),
        assistant_call("2", "send_mail", json!({"urgent": false, "to": "b@example.com"})),
    ];
    assert_eq!(analyze(policy, &trace).errors.len(), 1);
}

#[test]
fn value_references_detect_email_addresses() {
    let policy = r#"
raise "mail to raw address" if:
    (c: ToolCall)
    c is tool:send_mail({to: <EMAIL_ADDRESS>})
"#;
    let trace = vec![
        assistant_call("1", "send_mail", json!({"to": "alice@example.com"})),
        assistant_call("2", "send_mail", json!({"to": "the boss"})),
    ];
    assert_eq!(analyze(policy, &trace).errors.len(), 1);
}

#[test]
fn tool_outputs_match_through_their_originating_call() {
    let policy = r#"
raise "inbox content leaked" if:
    (o: ToolOutput)
    o is tool:get_inbox
"#;
    let result = analyze(policy, &inbox_then_send_trace());
    assert_eq!(result.errors.len(), 1);
}

#[test]
fn outputs_without_ids_link_to_the_nearest_unmatched_call() {
    let policy = r#"
raise "inbox content leaked" if:
    (o: ToolOutput)
    o is tool:get_inbox
"#;
    let trace = vec![
        assistant_call("1", "get_inbox", json!({})),
        unlinked_tool_output("mail from alice"),
    ];
    assert_eq!(analyze(policy, &trace).errors.len(), 1);
}

// ============================================================================
// PREDICATES AND DERIVED VARIABLES
// ============================================================================

#[test]
fn predicates_evaluate_over_bound_arguments() {
    let policy = r#"
is_assistant(m: Message) :=
    m.role == "assistant"

raise "assistant spoke" if:
    (m: Message)
    is_assistant(m)
"#;
    let trace = vec![user("q"), assistant("a"), assistant("b")];
    assert_eq!(analyze(policy, &trace).errors.len(), 2);
}

#[test]
fn derived_variables_bind_with_walrus() {
    let policy = r#"
raise "long content" if:
    (m: Message)
    content_length := len(m.content)
    content_length > 5
"#;
    let trace = vec![user("hi"), user("a much longer message")];
    assert_eq!(analyze(policy, &trace).errors.len(), 1);
}

#[test]
fn bounded_domains_select_from_tool_calls_of_a_message() {
    let policy = r#"
raise "message carries inbox call" if:
    (m: Message)
    (c: ToolCall) in m.tool_calls
    c is tool:get_inbox
"#;
    let trace = vec![
        assistant_calls(vec![
            tool_call("1", "get_inbox", json!({})),
            tool_call("2", "send_mail", json!({"to": "x"})),
        ]),
        assistant("no calls here"),
    ];
    assert_eq!(analyze(policy, &trace).errors.len(), 1);
}

#[test]
fn list_comprehensions_project_tool_names() {
    let policy = r#"
raise "inbox accessed" if:
    (m: Message)
    "get_inbox" in [c.function.name for c in m.tool_calls]
"#;
    let trace = vec![
        assistant_calls(vec![
            tool_call("1", "get_inbox", json!({})),
            tool_call("2", "send_mail", json!({"to": "x"})),
        ]),
        assistant("quiet"),
    ];
    assert_eq!(analyze(policy, &trace).errors.len(), 1);
}

#[test]
fn ternary_selects_by_condition() {
    let policy = r#"
raise "user message" if:
    (m: Message)
    (1 if m.role == "user" else 2) == 1
"#;
    let trace = vec![user("a"), assistant("b")];
    assert_eq!(analyze(policy, &trace).errors.len(), 1);
}

// ============================================================================
// POLICY PARAMETERS
// ============================================================================

const THRESHOLD_POLICY: &str = r#"
raise "too long" if:
    (m: Message)
    len(m.content) > input.threshold
"#;

#[test]
fn policy_parameters_are_reachable_via_input() {
    let policy = Policy::from_string(THRESHOLD_POLICY).unwrap();
    let mut params = PolicyParameters::new();
    params.insert("threshold".to_string(), Value::Int(4));

    let result = policy.analyze(&[user("hi"), user("hello world")], &params).unwrap();
    assert_eq!(result.errors.len(), 1);
}

#[test]
fn missing_policy_parameters_abort_the_analysis() {
    let policy = Policy::from_string(THRESHOLD_POLICY).unwrap();
    let outcome = policy.analyze(&[user("hello world")], &PolicyParameters::new());
    match outcome {
        Err(AnalysisError::Eval(e)) => {
            assert!(e.to_string().contains("Missing Policy Parameter"))
        }
        other => panic!("expected a missing-parameter error, got {:?}", other.map(|r| r.errors)),
    }
}

#[test]
fn the_data_parameter_name_is_reserved() {
    let policy = Policy::from_string(THRESHOLD_POLICY).unwrap();
    let mut params = PolicyParameters::new();
    params.insert("data".to_string(), Value::Int(1));
    assert!(matches!(
        policy.analyze(&[user("x")], &params),
        Err(AnalysisError::ReservedParameter(_))
    ));
}

// ============================================================================
// RESTRICTED ATTRIBUTE SURFACE
// ============================================================================

#[test]
fn unavailable_entity_attributes_are_rejected() {
    let policy = r#"
raise "x" if:
    (m: Message)
    m.internal_state == 1
"#;
    let outcome = Policy::from_string(policy)
        .unwrap()
        .analyze(&[user("a")], &PolicyParameters::new());
    match outcome {
        Err(AnalysisError::Eval(e)) => {
            assert!(e.to_string().contains("internal_state"))
        }
        other => panic!("expected an attribute error, got {:?}", other.map(|r| r.errors)),
    }
}

#[test]
fn non_whitelisted_string_methods_are_excessive() {
    let policy = r#"
raise "x" if:
    (m: Message)
    m.content.replace("a", "b") == "b"
"#;
    let outcome = Policy::from_string(policy)
        .unwrap()
        .analyze(&[user("a")], &PolicyParameters::new());
    match outcome {
        Err(AnalysisError::Eval(e)) => {
            assert!(e.to_string().contains("Excessive Policy"))
        }
        other => panic!("expected an excessive-policy error, got {:?}", other.map(|r| r.errors)),
    }
}

#[test]
fn whitelisted_string_methods_work() {
    let policy = r#"
raise "shouting" if:
    (m: Message)
    m.content.upper() == m.content
    m.role == "user"
"#;
    let trace = vec![user("STOP NOW"), user("please continue")];
    assert_eq!(analyze(policy, &trace).errors.len(), 1);
}

// ============================================================================
// ERROR CONSTRUCTORS
// ============================================================================

#[test]
fn constructor_arguments_capture_bound_events() {
    let policy = r#"
raise PolicyViolation("assistant said:", m) if:
    (m: Message)
    m.role == "assistant"
"#;
    let result = analyze(policy, &[user("q"), assistant("the forbidden word")]);
    assert_eq!(result.errors.len(), 1);
    let rendered = result.errors[0].to_string();
    assert!(rendered.contains("assistant said:"));
    assert!(rendered.contains("the forbidden word"));
}

#[test]
fn is_not_none_guards_optional_content() {
    let policy = r#"
raise "has content" if:
    (m: Message)
    m.content is not None
    m.role == "assistant"
"#;
    let trace = vec![assistant("something"), assistant_call("1", "noop", json!({}))];
    assert_eq!(analyze(policy, &trace).errors.len(), 1);
}

#[test]
fn contains_only_requires_every_right_hand_element() {
    let policy = r#"
raise "inbox covered" if:
    (m: Message)
    [c.function.name for c in m.tool_calls] contains_only ["get_inbox"]
"#;
    let with_inbox = vec![assistant_calls(vec![
        tool_call("1", "get_inbox", json!({})),
        tool_call("2", "send_mail", json!({"to": "x"})),
    ])];
    assert_eq!(analyze(policy, &with_inbox).errors.len(), 1);

    let without = vec![assistant_calls(vec![tool_call(
        "1",
        "send_mail",
        json!({"to": "x"}),
    )])];
    assert!(analyze(policy, &without).errors.is_empty());
}

#[test]
fn negated_forall_fires_when_a_counterexample_exists() {
    let policy = r#"
raise "not everyone is a user" if:
    not forall:
        (m: Message)
        m.role == "user"
"#;
    assert_eq!(analyze(policy, &[user("a"), assistant("b")]).errors.len(), 1);
    assert!(analyze(policy, &[user("a"), user("b")]).errors.is_empty());
}

#[test]
fn cancelled_analyses_keep_partial_results() {
    let policy = Policy::from_string(
        r#"
raise "assistant" if:
    (m: Message)
    m.role == "assistant"
"#,
    )
    .unwrap();

    let token = vigil_runtime::CancelToken::new();
    token.cancel();
    let result = policy
        .analyze_with_token(&[assistant("a")], &PolicyParameters::new(), Some(&token))
        .unwrap();
    assert!(result.cancelled);
    assert!(result.errors.is_empty());

    // without a cancelled token the same call behaves like analyze()
    let live = vigil_runtime::CancelToken::new();
    let result = policy
        .analyze_with_token(&[assistant("a")], &PolicyParameters::new(), Some(&live))
        .unwrap();
    assert!(!result.cancelled);
    assert_eq!(result.errors.len(), 1);
}

#[test]
fn loading_errors_are_reported_eagerly() {
    let broken = r#"
raise "x" if:
    (m: Message)
    undefined_name.role == "user"
"#;
    let err = Policy::from_string(broken).unwrap_err();
    assert!(!err.errors.is_empty());
    assert!(err.msg.contains("undefined_name"));
}
