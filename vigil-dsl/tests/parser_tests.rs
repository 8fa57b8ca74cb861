//! Integration tests for the policy-language front end
//!
//! Tests verify:
//! - Statement parsing (raise rules, declarations, imports)
//! - Expression precedence and special forms
//! - The indent rewriter feeding the context-free grammar
//! - Scope resolution and validation diagnostics

use vigil_dsl::{
    parse, BinaryOp, DeclKind, ExprKind, ParsedPolicy, Stmt,
};

const VALUE_TYPES: &[&str] = &[
    "DUMMY",
    "EMAIL_ADDRESS",
    "LOCATION",
    "MODERATED",
    "PERSON",
    "PHONE_NUMBER",
    "SECRET",
];

fn parse_ok(source: &str) -> ParsedPolicy {
    let parsed = parse(source, None, VALUE_TYPES);
    assert!(
        parsed.issues.is_empty(),
        "expected a clean parse, got issues: {:?}",
        parsed.issues
    );
    parsed
}

fn issues_of(source: &str) -> Vec<String> {
    parse(source, None, VALUE_TYPES)
        .issues
        .into_iter()
        .map(|issue| issue.message)
        .collect()
}

// ============================================================================
// STATEMENTS
// ============================================================================

#[test]
fn parses_a_minimal_raise_rule() {
    let parsed = parse_ok(
        r#"
raise "assistant spoke" if:
    (m: Message)
    m.role == "assistant"
"#,
    );
    assert_eq!(parsed.ast.statements.len(), 1);
    let Stmt::Raise(rule) = &parsed.ast.statements[0] else {
        panic!("expected a raise rule");
    };
    assert!(matches!(rule.constructor.kind, ExprKind::Str { .. }));
    assert_eq!(rule.body.len(), 2);
}

#[test]
fn parses_constructor_calls() {
    let parsed = parse_ok(
        r#"
raise PolicyViolation("bad message:", m) if:
    (m: Message)
    m.role == "assistant"
"#,
    );
    let Stmt::Raise(rule) = &parsed.ast.statements[0] else {
        panic!("expected a raise rule");
    };
    let ExprKind::Call { args, .. } = &rule.constructor.kind else {
        panic!("expected a constructor call");
    };
    assert_eq!(args.len(), 2);
}

#[test]
fn parses_imports() {
    let parsed = parse_ok(
        r#"
from vigil.detectors import pii, moderated as flagged
import vigil

raise "x" if:
    (m: Message)
    m.role == "user"
"#,
    );
    let Stmt::Import(from_import) = &parsed.ast.statements[0] else {
        panic!("expected an import");
    };
    assert_eq!(from_import.module, "vigil.detectors");
    assert_eq!(from_import.names.len(), 2);
    assert_eq!(from_import.names[1].alias.as_deref(), Some("flagged"));
}

#[test]
fn parses_constant_and_predicate_declarations() {
    let parsed = parse_ok(
        r#"
PATTERN := "X"

is_admin(m: Message) :=
    m.role == "admin"

raise "admin spoke" if:
    (m: Message)
    is_admin(m)
    PATTERN in m.content
"#,
    );
    let Stmt::Declaration(constant) = &parsed.ast.statements[0] else {
        panic!("expected a constant");
    };
    assert!(constant.is_constant());

    let Stmt::Declaration(predicate) = &parsed.ast.statements[1] else {
        panic!("expected a predicate");
    };
    assert!(!predicate.is_constant());
    assert_eq!(predicate.name(), "is_admin");
}

// ============================================================================
// EXPRESSIONS
// ============================================================================

fn single_body_expr(source: &str) -> vigil_dsl::Expr {
    let parsed = parse_ok(source);
    for stmt in parsed.ast.statements {
        if let Stmt::Raise(rule) = stmt {
            return rule.body.into_iter().last().unwrap();
        }
    }
    panic!("no raise rule in source");
}

#[test]
fn multiplication_binds_tighter_than_addition() {
    let expr = single_body_expr(
        r#"
raise "x" if:
    1 + 2 * 3 == 7
"#,
    );
    let ExprKind::Binary { op: BinaryOp::Eq, left, .. } = expr.kind else {
        panic!("expected a comparison");
    };
    let ExprKind::Binary { op: BinaryOp::Add, right, .. } = left.kind else {
        panic!("expected addition on the left");
    };
    assert!(matches!(
        right.kind,
        ExprKind::Binary { op: BinaryOp::Mul, .. }
    ));
}

#[test]
fn comparison_binds_tighter_than_and() {
    let expr = single_body_expr(
        r#"
raise "x" if:
    (m: Message)
    m.role == "user" and m.content == "hi"
"#,
    );
    let ExprKind::Binary { op: BinaryOp::And, left, right } = expr.kind else {
        panic!("expected a conjunction");
    };
    assert!(matches!(left.kind, ExprKind::Binary { op: BinaryOp::Eq, .. }));
    assert!(matches!(right.kind, ExprKind::Binary { op: BinaryOp::Eq, .. }));
}

#[test]
fn tool_reference_calls_become_semantic_patterns() {
    let expr = single_body_expr(
        r#"
raise "x" if:
    (c: ToolCall)
    c is tool:send_mail({to: "alice", urgent: True}, *)
"#,
    );
    let ExprKind::Binary { op: BinaryOp::Is, right, .. } = expr.kind else {
        panic!("expected an is-match");
    };
    let ExprKind::SemanticPattern { tool, args } = right.kind else {
        panic!("expected a semantic pattern, got {:?}", right.kind);
    };
    assert_eq!(tool, "send_mail");
    assert_eq!(args.len(), 2);
    assert!(matches!(args[1].kind, ExprKind::Wildcard));
}

#[test]
fn parses_flow_operators_between_typed_identifiers() {
    let expr = single_body_expr(
        r#"
raise "x" if:
    (a: ToolCall) -> (b: ToolCall)
"#,
    );
    let ExprKind::Binary { op, left, right } = expr.kind else {
        panic!("expected a binary expression");
    };
    assert_eq!(op, BinaryOp::FlowsTo);
    assert!(matches!(left.kind, ExprKind::TypedIdent { .. }));
    assert!(matches!(right.kind, ExprKind::TypedIdent { .. }));
}

#[test]
fn parses_quantifier_blocks() {
    let expr = single_body_expr(
        r#"
raise "x" if:
    count(min=2, max=4):
        (t: ToolCall)
        t is tool:get_inbox
"#,
    );
    let ExprKind::Quantifier { call, negated, body } = expr.kind else {
        panic!("expected a quantifier");
    };
    assert!(!negated);
    assert_eq!(body.len(), 2);
    let ExprKind::Call { kwargs, .. } = call.kind else {
        panic!("expected count(...) call");
    };
    assert_eq!(kwargs.len(), 2);
}

#[test]
fn parses_negated_quantifiers() {
    let expr = single_body_expr(
        r#"
raise "x" if:
    not forall:
        (m: Message)
        m.role == "user"
"#,
    );
    let ExprKind::Quantifier { negated, .. } = expr.kind else {
        panic!("expected a quantifier");
    };
    assert!(negated);
}

#[test]
fn parses_list_comprehensions() {
    let expr = single_body_expr(
        r#"
raise "x" if:
    (m: Message)
    "inbox" in [c.function.name for c in m.tool_calls if c.type == "function"]
"#,
    );
    let ExprKind::Binary { op: BinaryOp::In, right, .. } = expr.kind else {
        panic!("expected containment");
    };
    let ExprKind::ListComprehension { var, condition, .. } = right.kind else {
        panic!("expected a comprehension");
    };
    assert_eq!(var, "c");
    assert!(condition.is_some());
}

#[test]
fn parses_ternary_expressions() {
    let expr = single_body_expr(
        r#"
raise "x" if:
    (m: Message)
    (1 if m.role == "user" else 2) == 1
"#,
    );
    let ExprKind::Binary { left, .. } = expr.kind else {
        panic!("expected comparison");
    };
    assert!(matches!(left.kind, ExprKind::Ternary { .. }));
}

#[test]
fn parses_string_prefixes_and_triple_quotes() {
    let parsed = parse_ok(
        "PATTERN := r\"[0-9]+\"\n\nTEXT := \"\"\"\nfirst\nsecond\n\"\"\"\n\nraise \"x\" if:\n    (m: Message)\n    PATTERN in m.content\n",
    );
    let Stmt::Declaration(pattern) = &parsed.ast.statements[0] else {
        panic!("expected constant");
    };
    let ExprKind::Str { value, modifier } = &pattern.body[0].kind else {
        panic!("expected string");
    };
    assert_eq!(value, "[0-9]+");
    assert_eq!(*modifier, Some('r'));

    let Stmt::Declaration(text) = &parsed.ast.statements[1] else {
        panic!("expected constant");
    };
    let ExprKind::Str { value, .. } = &text.body[0].kind else {
        panic!("expected string");
    };
    assert!(value.contains("first\nsecond"));
}

// ============================================================================
// SCOPING AND VALIDATION
// ============================================================================

#[test]
fn resolves_identifiers_to_declarations() {
    let parsed = parse_ok(
        r#"
raise "x" if:
    (m: Message)
    m.role == "user"
"#,
    );
    let Stmt::Raise(rule) = &parsed.ast.statements[0] else {
        panic!("expected raise");
    };
    let ExprKind::TypedIdent { decl: Some(typed_decl), .. } = &rule.body[0].kind else {
        panic!("typed identifier unresolved");
    };
    let ExprKind::Binary { left, .. } = &rule.body[1].kind else {
        panic!("expected comparison");
    };
    let ExprKind::Member { object, .. } = &left.kind else {
        panic!("expected member access");
    };
    let ExprKind::Ident { decl: Some(use_decl), .. } = &object.kind else {
        panic!("identifier unresolved");
    };
    assert_eq!(typed_decl, use_decl);
    assert!(matches!(
        parsed.scopes.info(*use_decl).kind,
        DeclKind::RuleLocal { .. }
    ));
}

#[test]
fn rejects_unresolved_identifiers() {
    let issues = issues_of(
        r#"
raise "x" if:
    (m: Message)
    q.role == "user"
"#,
    );
    assert!(issues.iter().any(|m| m.contains("Failed to resolve identifier q")));
}

#[test]
fn rejects_duplicate_declarations() {
    let issues = issues_of(
        r#"
raise "x" if:
    (m: Message)
    (m: ToolCall)
"#,
    );
    assert!(issues.iter().any(|m| m.contains("already declared")));
}

#[test]
fn rejects_wildcards_outside_semantic_patterns() {
    let issues = issues_of(
        r#"
raise "x" if:
    (m: Message)
    m.role == *
"#,
    );
    assert!(issues.iter().any(|m| m.contains("wildcards outside of semantic patterns")));
}

#[test]
fn rejects_value_references_outside_semantic_patterns() {
    let issues = issues_of(
        r#"
raise "x" if:
    (m: Message)
    m.content == <EMAIL_ADDRESS>
"#,
    );
    assert!(issues
        .iter()
        .any(|m| m.contains("value references outside of semantic patterns")));
}

#[test]
fn rejects_unknown_value_types() {
    let issues = issues_of(
        r#"
raise "x" if:
    (c: ToolCall)
    c is tool:send_mail({to: <NO_SUCH_TYPE>})
"#,
    );
    assert!(issues.iter().any(|m| m.contains("Unsupported value type: NO_SUCH_TYPE")));
}

#[test]
fn syntax_errors_carry_original_line_numbers() {
    let parsed = parse(
        "\nraise \"x\" if:\n    (m: Message)\n    m.role ==\n",
        Some("broken.vgl"),
        VALUE_TYPES,
    );
    assert_eq!(parsed.issues.len(), 1);
    // line 4 of the original source, despite blank-line removal in the
    // rewriter
    assert_eq!(parsed.issues[0].line, 4);
}

#[test]
fn predicate_parameters_shadow_policy_constants() {
    let parsed = parse_ok(
        r#"
m := "constant"

uses(m: Message) :=
    m.role == "user"

raise "x" if:
    (q: Message)
    uses(q)
"#,
    );
    let Stmt::Declaration(predicate) = &parsed.ast.statements[1] else {
        panic!("expected predicate");
    };
    let ExprKind::Binary { left, .. } = &predicate.body[0].kind else {
        panic!("expected comparison");
    };
    let ExprKind::Member { object, .. } = &left.kind else {
        panic!("expected member access");
    };
    let ExprKind::Ident { decl: Some(decl), .. } = &object.kind else {
        panic!("identifier unresolved");
    };
    assert!(matches!(
        parsed.scopes.info(*decl).kind,
        DeclKind::Parameter { .. }
    ));
}
