//! Built-in function library.
//!
//! Names available to every policy without imports: the trace entity type
//! names, the error constructors, quantifiers, and a small set of
//! side-effect-free functions. `find` additionally records a character
//! range per regex match, which surfaces in the error report of the rule
//! that used it.

use crate::link::{Binding, CallScope, HostFn};
use crate::quantifiers::QuantifierKind;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use vigil_core::{Content, EvalError, Trace, Value};

/// Resolves a built-in name to its runtime binding.
pub fn builtin_binding(name: &str) -> Option<Binding> {
    match name {
        "Message" | "ToolCall" | "ToolOutput" | "Function" | "Input" | "TextChunk" | "Image" => {
            Some(Binding::TypeName(name.to_string()))
        }
        "input" => Some(Binding::Params),
        "Violation" | "PolicyViolation" => Some(Binding::ErrorConstructor),
        "forall" => Some(Binding::Quantifier(QuantifierKind::Forall)),
        "count" => Some(Binding::Quantifier(QuantifierKind::Count)),
        _ => FUNCTIONS.get(name).cloned().map(Binding::Host),
    }
}

static FUNCTIONS: Lazy<HashMap<&'static str, HostFn>> = Lazy::new(|| {
    let mut table = HashMap::new();

    table.insert(
        "any",
        HostFn::new("any", |_, args| match args.arg(0)? {
            Value::List(items) => Ok(Value::Bool(items.items.iter().any(Value::truthy))),
            other => Err(EvalError::Type(format!(
                "any expects a list, got {}",
                other.type_name()
            ))),
        }),
    );

    table.insert(
        "empty",
        HostFn::new("empty", |_, args| {
            let len = length(args.arg(0)?, None)?;
            Ok(Value::Bool(len == 0))
        }),
    );

    table.insert(
        "len",
        HostFn::new("len", |scope, args| {
            let len = length(args.arg(0)?, Some(scope.trace))?;
            Ok(Value::Int(len as i64))
        }),
    );

    table.insert(
        "match",
        HostFn::new("match", |_, args| {
            let pattern = expect_str(args.arg(0)?, "match pattern")?;
            let text = expect_str(args.arg(1)?, "match subject")?;
            // anchored at the start only
            let regex = Regex::new(&format!("^(?:{})", pattern))
                .map_err(|e| EvalError::Type(format!("invalid pattern {:?}: {}", pattern, e)))?;
            Ok(Value::Bool(regex.is_match(&text)))
        }),
    );

    table.insert(
        "find",
        HostFn::new("find", |scope, args| {
            let pattern = expect_str(args.arg(0)?, "find pattern")?;
            let subject = args.arg(1)?.clone();
            let text = expect_str(&subject, "find subject")?;
            let regex = Regex::new(&pattern)
                .map_err(|e| EvalError::Type(format!("invalid pattern {:?}: {}", pattern, e)))?;
            let mut found = Vec::new();
            for m in regex.find_iter(&text) {
                scope.mark(&subject, Some(m.start()), Some(m.end()));
                found.push(Value::str(m.as_str().to_string()));
            }
            Ok(Value::list(found))
        }),
    );

    table.insert("min", HostFn::new("min", |_, args| fold_extreme(args, true)));
    table.insert("max", HostFn::new("max", |_, args| fold_extreme(args, false)));

    table.insert(
        "sum",
        HostFn::new("sum", |_, args| {
            let values = spread(&args.args);
            let mut int_sum = 0i64;
            let mut float_sum = 0f64;
            let mut all_ints = true;
            for value in &values {
                match value {
                    Value::Int(n) => {
                        int_sum += n;
                        float_sum += *n as f64;
                    }
                    Value::Float(n) => {
                        all_ints = false;
                        float_sum += n;
                    }
                    other => {
                        return Err(EvalError::Type(format!(
                            "sum expects numbers, got {}",
                            other.type_name()
                        )))
                    }
                }
            }
            Ok(if all_ints {
                Value::Int(int_sum)
            } else {
                Value::Float(float_sum)
            })
        }),
    );

    table.insert(
        "print",
        HostFn::new("print", |_, args| {
            let line = args
                .args
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(" ");
            tracing::debug!(target: "vigil::policy", "{}", line);
            // no boolean contribution beyond `true`
            Ok(Value::Bool(true))
        }),
    );

    table.insert(
        "json_loads",
        HostFn::new("json_loads", |_, args| {
            let text = expect_str(args.arg(0)?, "json_loads input")?;
            let parsed: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| EvalError::Type(format!("invalid JSON: {}", e)))?;
            Ok(Value::from_json(&parsed))
        }),
    );

    table.insert(
        "text",
        HostFn::new("text", |scope, args| {
            let mut out = Vec::new();
            for arg in &args.args {
                out.extend(text_values(scope.trace, arg));
            }
            Ok(Value::list(out))
        }),
    );

    table.insert(
        "image",
        HostFn::new("image", |scope, args| {
            let mut out = Vec::new();
            for arg in &args.args {
                out.extend(image_values(scope.trace, arg));
            }
            Ok(Value::list(out))
        }),
    );

    table
});

// ============================================================================
// HELPERS
// ============================================================================

fn expect_str(value: &Value, what: &str) -> Result<String, EvalError> {
    value
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| EvalError::Type(format!("{} must be a string, got {}", what, value.type_name())))
}

fn length(value: &Value, trace: Option<&Trace>) -> Result<usize, EvalError> {
    match value {
        Value::Str(s) => Ok(s.text.chars().count()),
        Value::List(l) => Ok(l.items.len()),
        Value::Object(o) => Ok(o.entries.len()),
        Value::Chunks(idx) => match trace.and_then(|t| t.content_of(*idx)) {
            Some(Content::Chunks(chunks)) => Ok(chunks.len()),
            _ => Ok(0),
        },
        other => Err(EvalError::Type(format!(
            "value of type {} has no length",
            other.type_name()
        ))),
    }
}

/// `min(xs)` / `min(a, b, c)` argument spreading.
fn spread(args: &[Value]) -> Vec<Value> {
    match args {
        [Value::List(items)] => items.items.clone(),
        other => other.to_vec(),
    }
}

fn fold_extreme(args: &crate::link::CallArgs, minimum: bool) -> Result<Value, EvalError> {
    let values = spread(&args.args);
    if values.is_empty() {
        return Err(EvalError::Type(format!(
            "{} of an empty sequence",
            if minimum { "min" } else { "max" }
        )));
    }

    let mut best = values[0].clone();
    for value in &values[1..] {
        let replace = match (value.as_number(), best.as_number()) {
            (Some(candidate), Some(current)) => {
                if minimum {
                    candidate < current
                } else {
                    candidate > current
                }
            }
            _ => match (value.as_str(), best.as_str()) {
                (Some(candidate), Some(current)) => {
                    if minimum {
                        candidate < current
                    } else {
                        candidate > current
                    }
                }
                _ => {
                    return Err(EvalError::Type(
                        "min/max expects numbers or strings".to_string(),
                    ))
                }
            },
        };
        if replace {
            best = value.clone();
        }
    }
    Ok(best)
}

/// All text chunks reachable from a value: strings, chunked content,
/// message/tool-output contents, and nested lists thereof.
pub fn text_values(trace: &Trace, value: &Value) -> Vec<Value> {
    match value {
        Value::None => Vec::new(),
        Value::Str(_) => vec![value.clone()],
        Value::Chunks(idx) => trace
            .chunk_texts(*idx)
            .into_iter()
            .map(|(node, text)| {
                Value::Str(vigil_core::StrValue::traced(text.to_string(), node))
            })
            .collect(),
        Value::Message(_) => trace
            .member(value, "content")
            .map(|content| text_values(trace, &content))
            .unwrap_or_default(),
        Value::ToolOutput(_) => trace
            .member(value, "content")
            .map(|content| text_values(trace, &content))
            .unwrap_or_default(),
        Value::List(items) => items
            .items
            .iter()
            .flat_map(|item| text_values(trace, item))
            .collect(),
        _ => Vec::new(),
    }
}

/// Plain-string projection of `text_values`.
pub fn strings_of(trace: &Trace, value: &Value) -> Vec<String> {
    text_values(trace, value)
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect()
}

/// All image URLs reachable from a value.
pub fn image_values(trace: &Trace, value: &Value) -> Vec<Value> {
    match value {
        Value::None => Vec::new(),
        Value::Str(s)
            if s.text.starts_with("data:image/png;base64,")
                || s.text.starts_with("data:image/jpeg;base64,") =>
        {
            vec![value.clone()]
        }
        Value::Chunks(idx) => trace
            .chunk_images(*idx)
            .into_iter()
            .map(|(node, url)| Value::Str(vigil_core::StrValue::traced(url.to_string(), node)))
            .collect(),
        Value::Message(idx) => trace
            .member(&Value::Message(*idx), "content")
            .map(|content| image_values(trace, &content))
            .unwrap_or_default(),
        Value::ToolOutput(idx) => trace
            .member(&Value::ToolOutput(*idx), "content")
            .map(|content| image_values(trace, &content))
            .unwrap_or_default(),
        Value::List(items) => items
            .items
            .iter()
            .flat_map(|item| image_values(trace, item))
            .collect(),
        _ => Vec::new(),
    }
}
