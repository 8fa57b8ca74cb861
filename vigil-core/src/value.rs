//! Runtime values with trace-identity provenance.
//!
//! Every value that originates from the analyzed trace carries the `NodeId`
//! of the trace node it was read from. Ranges reference this identity, which
//! is distinct from the value itself: two equal strings in different
//! messages have different origins.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// IDENTITY
// ============================================================================

/// Identity of a node in the parsed trace.
///
/// Ids are assigned in document order at trace-parse time, which makes them
/// stable under trace extension: parsing `T ++ E` assigns the same ids to
/// the nodes of `T` as parsing `T` alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Location of a tool call within a trace: either a standalone event
/// (`slot` is `None`) or the n-th inline call of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallRef {
    pub event: usize,
    pub slot: Option<usize>,
}

impl CallRef {
    pub const fn standalone(event: usize) -> Self {
        Self { event, slot: None }
    }

    pub const fn inline(event: usize, slot: usize) -> Self {
        Self {
            event,
            slot: Some(slot),
        }
    }
}

// ============================================================================
// VALUES
// ============================================================================

/// A string value, optionally carrying the identity of the trace node it
/// was read from.
#[derive(Debug, Clone)]
pub struct StrValue {
    pub text: String,
    pub origin: Option<NodeId>,
}

impl StrValue {
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            origin: None,
        }
    }

    pub fn traced(text: impl Into<String>, origin: NodeId) -> Self {
        Self {
            text: text.into(),
            origin: Some(origin),
        }
    }
}

/// Equality on values ignores provenance throughout.
impl PartialEq for StrValue {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

/// A list value with optional trace provenance.
#[derive(Debug, Clone, Default)]
pub struct ListValue {
    pub items: Vec<Value>,
    pub origin: Option<NodeId>,
}

impl PartialEq for ListValue {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

/// An object (string-keyed map) value with optional trace provenance.
#[derive(Debug, Clone, Default)]
pub struct ObjValue {
    pub entries: BTreeMap<String, Value>,
    pub origin: Option<NodeId>,
}

impl ObjValue {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }
}

impl PartialEq for ObjValue {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

/// A runtime value as produced by expression evaluation.
///
/// `Message`, `ToolCall` and `ToolOutput` are references into the trace
/// under analysis (by event index / call location); `Chunks` references an
/// event's chunked content list and `FuncSpec` the function record of a
/// tool call. `Trace` is the whole-input value bound to `Input`-typed
/// variables, `Params` the policy-parameter accessor behind the reserved
/// `input` identifier.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(StrValue),
    List(ListValue),
    Object(ObjValue),
    Message(usize),
    ToolCall(CallRef),
    ToolOutput(usize),
    Chunks(usize),
    FuncSpec(CallRef),
    Trace,
    Params,
    /// A whitelisted method bound to its receiver, produced by member
    /// access and consumed by call evaluation.
    Method {
        target: Box<Value>,
        name: &'static str,
    },
}

impl Value {
    pub fn str(text: impl Into<String>) -> Self {
        Value::Str(StrValue::literal(text))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(ListValue {
            items,
            origin: None,
        })
    }

    pub fn object(entries: BTreeMap<String, Value>) -> Self {
        Value::Object(ObjValue {
            entries,
            origin: None,
        })
    }

    /// The name of this value's type, as used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Object(_) => "dict",
            Value::Message(_) => "Message",
            Value::ToolCall(_) => "ToolCall",
            Value::ToolOutput(_) => "ToolOutput",
            Value::Chunks(_) => "Contents",
            Value::FuncSpec(_) => "Function",
            Value::Trace => "Input",
            Value::Params => "PolicyParameters",
            Value::Method { .. } => "method",
        }
    }

    /// Trace identity of this value, if it originates from the trace.
    pub fn origin(&self) -> Option<NodeId> {
        match self {
            Value::Str(s) => s.origin,
            Value::List(l) => l.origin,
            Value::Object(o) => o.origin,
            _ => None,
        }
    }

    /// Boolean interpretation for `and`/`or`/`not` and ternary conditions.
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(n) => *n != 0.0,
            Value::Str(s) => !s.text.is_empty(),
            Value::List(l) => !l.items.is_empty(),
            Value::Object(o) => !o.entries.is_empty(),
            _ => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(&s.text),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric interpretation, promoting integers to floats.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// True for messages, tool calls and tool outputs.
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            Value::Message(_) | Value::ToolCall(_) | Value::ToolOutput(_)
        )
    }

    /// Converts a detached value into plain JSON. Trace references render
    /// as their display form; use `Trace::snapshot` first to detach them.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::None => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.text.clone()),
            Value::List(l) => serde_json::Value::Array(l.items.iter().map(Value::to_json).collect()),
            Value::Object(o) => serde_json::Value::Object(
                o.entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            other => serde_json::Value::String(other.to_string()),
        }
    }

    /// Builds a detached value from plain JSON (no trace provenance).
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::list(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// Equality ignores provenance and compares ints and floats numerically.
/// Trace references compare by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a.text == b.text,
            (Value::List(a), Value::List(b)) => a.items == b.items,
            (Value::Object(a), Value::Object(b)) => a.entries == b.entries,
            (Value::Message(a), Value::Message(b)) => a == b,
            (Value::ToolCall(a), Value::ToolCall(b)) => a == b,
            (Value::ToolOutput(a), Value::ToolOutput(b)) => a == b,
            (Value::Chunks(a), Value::Chunks(b)) => a == b,
            (Value::FuncSpec(a), Value::FuncSpec(b)) => a == b,
            (Value::Trace, Value::Trace) => true,
            (Value::Params, Value::Params) => true,
            (
                Value::Method { target: a, name: m },
                Value::Method { target: b, name: n },
            ) => m == n && a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s.text),
            Value::List(l) => {
                write!(f, "[")?;
                for (i, item) in l.items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Object(o) => {
                write!(f, "{{")?;
                for (i, (k, v)) in o.entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Message(idx) => write!(f, "<Message {}>", idx),
            Value::ToolCall(call) => match call.slot {
                Some(slot) => write!(f, "<ToolCall {}.{}>", call.event, slot),
                None => write!(f, "<ToolCall {}>", call.event),
            },
            Value::ToolOutput(idx) => write!(f, "<ToolOutput {}>", idx),
            Value::Chunks(idx) => write!(f, "<Contents of event {}>", idx),
            Value::FuncSpec(call) => write!(f, "<Function of call {}>", call.event),
            Value::Trace => write!(f, "<Input>"),
            Value::Params => write!(f, "<PolicyParameters>"),
            Value::Method { target, name } => {
                write!(f, "<method {}.{}>", target.type_name(), name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_equality_crosses_int_and_float() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::Int(2), Value::Float(2.5));
    }

    #[test]
    fn equality_ignores_provenance() {
        let a = Value::Str(StrValue::literal("x"));
        let b = Value::Str(StrValue::traced("x", NodeId(7)));
        assert_eq!(a, b);
    }

    #[test]
    fn truthiness() {
        assert!(!Value::None.truthy());
        assert!(!Value::str("").truthy());
        assert!(Value::str("a").truthy());
        assert!(!Value::Int(0).truthy());
        assert!(Value::Message(0).truthy());
    }

    #[test]
    fn json_round_trip_for_detached_values() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"a": [1, 2.5, "x", null], "b": true}"#).unwrap();
        let value = Value::from_json(&json);
        assert_eq!(value.to_json(), json);
    }
}
