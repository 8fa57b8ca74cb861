//! Semantic-pattern matching.
//!
//! A pattern `tool:NAME({key: P, ...}, *)` compiles into a matcher tree
//! that is matched structurally against tool calls: the tool name is a
//! regex, object patterns match key-by-key, constants match by equality or
//! anchored regex against each text chunk, wildcards always match, and
//! value references (`<EMAIL_ADDRESS>`, ...) delegate to the detector
//! registry. A tool output matched against a tool pattern first
//! substitutes its originating tool call.

use crate::cache::FunctionCache;
use crate::link::CallScope;
use regex::Regex;
use vigil_core::{EvalError, Value};
use vigil_dsl::{Expr, ExprKind};

/// A compiled semantic-pattern matcher.
#[derive(Debug, Clone)]
pub enum Matcher {
    Tool { name: String, args: Vec<Matcher> },
    Dict(Vec<(String, Matcher)>),
    List(Vec<Matcher>),
    Constant(Value),
    Wildcard,
    ValueRef(String),
}

/// Matcher for a bare `tool:name` reference.
pub fn tool_matcher(name: &str) -> Matcher {
    Matcher::Tool {
        name: name.to_string(),
        args: Vec::new(),
    }
}

/// Compiles a semantic-pattern AST node into a matcher tree.
pub fn compile(tool: &str, args: &[Expr]) -> Result<Matcher, EvalError> {
    Ok(Matcher::Tool {
        name: tool.to_string(),
        args: args.iter().map(compile_expr).collect::<Result<_, _>>()?,
    })
}

fn compile_expr(expr: &Expr) -> Result<Matcher, EvalError> {
    match &expr.kind {
        ExprKind::ObjectLit { entries } => Ok(Matcher::Dict(
            entries
                .iter()
                .map(|(key, value)| Ok((key.clone(), compile_expr(value)?)))
                .collect::<Result<_, EvalError>>()?,
        )),
        ExprKind::ListLit { items } => Ok(Matcher::List(
            items.iter().map(compile_expr).collect::<Result<_, _>>()?,
        )),
        ExprKind::Str { value, .. } => Ok(Matcher::Constant(Value::str(value.clone()))),
        ExprKind::Int(n) => Ok(Matcher::Constant(Value::Int(*n))),
        ExprKind::Float(n) => Ok(Matcher::Constant(Value::Float(*n))),
        ExprKind::Bool(b) => Ok(Matcher::Constant(Value::Bool(*b))),
        ExprKind::NoneLit => Ok(Matcher::Constant(Value::None)),
        ExprKind::Wildcard => Ok(Matcher::Wildcard),
        ExprKind::ValueRef { value_type } => Ok(Matcher::ValueRef(value_type.clone())),
        other => Err(EvalError::Type(format!(
            "unsupported semantic pattern element: {:?}",
            other
        ))),
    }
}

/// Matches a value against a matcher tree.
pub fn match_value(
    matcher: &Matcher,
    value: &Value,
    cache: &FunctionCache,
    scope: &mut CallScope<'_>,
) -> Result<bool, EvalError> {
    match matcher {
        Matcher::Wildcard => Ok(true),
        Matcher::Tool { name, args } => match_tool(name, args, value, cache, scope),
        Matcher::Dict(entries) => {
            let object = match value {
                Value::Object(o) => o,
                _ => return Ok(false),
            };
            for (key, entry_matcher) in entries {
                match object.get(key) {
                    Some(entry) => {
                        if !match_value(entry_matcher, entry, cache, scope)? {
                            return Ok(false);
                        }
                    }
                    None => return Ok(false),
                }
            }
            Ok(true)
        }
        Matcher::List(elements) => {
            let items = match value {
                Value::List(l) => &l.items,
                _ => return Ok(false),
            };
            if items.len() != elements.len() {
                return Ok(false);
            }
            for (element, item) in elements.iter().zip(items) {
                if !match_value(element, item, cache, scope)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Matcher::Constant(constant) => Ok(match_constant(constant, value, scope)),
        Matcher::ValueRef(value_type) => {
            scope
                .detectors
                .clone_handle(value_type)
                .ok_or_else(|| {
                    EvalError::Type(format!("Unsupported value type: {}", value_type))
                })?
                .matches(value_type, value, cache, scope)
        }
    }
}

fn match_tool(
    name: &str,
    args: &[Matcher],
    value: &Value,
    cache: &FunctionCache,
    scope: &mut CallScope<'_>,
) -> Result<bool, EvalError> {
    // a tool output stands in for its originating call
    let value = match value {
        Value::ToolOutput(idx) => match scope.trace.output(*idx).and_then(|o| o.origin_call) {
            Some(site) => Value::ToolCall(site),
            None => return Ok(false),
        },
        other => other.clone(),
    };

    let site = match value {
        Value::ToolCall(site) => site,
        _ => return Ok(false),
    };
    let call = match scope.trace.call(site) {
        Some(call) => call,
        None => return Ok(false),
    };

    match anchored(name) {
        Some(re) => {
            if !re.is_match(&call.name.text) {
                return Ok(false);
            }
        }
        None => {
            if call.name.text != name {
                return Ok(false);
            }
        }
    }

    // only the single-object argument form is supported
    match args.len() {
        0 => Ok(true),
        1 => {
            let arguments = call.arguments.clone();
            match_value(&args[0], &arguments, cache, scope)
        }
        _ => Ok(false),
    }
}

fn match_constant(constant: &Value, value: &Value, scope: &mut CallScope<'_>) -> bool {
    match (constant, value) {
        (Value::Str(pattern), Value::Str(text)) => {
            if pattern.text == text.text {
                return true;
            }
            anchored(&pattern.text)
                .map(|re| re.is_match(&text.text))
                .unwrap_or(false)
        }
        (Value::Str(pattern), Value::Chunks(event)) => {
            let texts = scope.trace.chunk_texts(*event);
            let joined: String = texts.iter().map(|(_, t)| *t).collect();
            if pattern.text == joined {
                return true;
            }
            match anchored(&pattern.text) {
                Some(re) => texts.iter().any(|(_, t)| re.is_match(t)),
                None => false,
            }
        }
        _ => constant == value,
    }
}

/// Full-string regex in the dotall mode string patterns are written for.
/// Invalid patterns fall back to plain equality.
fn anchored(pattern: &str) -> Option<Regex> {
    Regex::new(&format!("(?s)^(?:{})$", pattern)).ok()
}
