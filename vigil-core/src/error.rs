//! Error types for trace construction and rule evaluation

use thiserror::Error;

/// Trace construction errors.
///
/// Raised while parsing raw event JSON into the trace model. These are
/// caller errors (malformed input), not policy errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TraceError {
    #[error("Event {index} could not be parsed as a message, tool call or tool output: {reason}")]
    UnrecognizedEvent { index: usize, reason: String },

    #[error("Tool call '{tool}' carries malformed arguments: {reason}")]
    MalformedArguments { tool: String, reason: String },

    #[error("Input is not a JSON array of events: {reason}")]
    InvalidInput { reason: String },
}

/// Runtime evaluation errors.
///
/// These abort the current analysis and surface to the caller of
/// `analyze(...)`. Rule-fired violations are *not* errors in this sense;
/// they are the intended output of an analysis.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    /// A policy attempted an operation outside the allowed surface, e.g.
    /// calling a method that is not whitelisted for the value type.
    #[error("Excessive Policy: {0}")]
    ExcessivePolicy(String),

    /// A rule referenced `input.<name>` but no such parameter was passed
    /// to the analysis call.
    #[error("Missing Policy Parameter: '{0}' is required for evaluation of a rule")]
    MissingPolicyParameter(String),

    /// Attribute access outside the fixed attribute set of a trace entity
    /// or detector result.
    #[error("Attribute {attribute} not found in {type_name}. Available attributes are: {available}")]
    UnavailableAttribute {
        type_name: &'static str,
        attribute: String,
        available: &'static str,
    },

    #[error("Type error: {0}")]
    Type(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("Index {index} out of bounds for sequence of length {len}")]
    IndexOutOfBounds { index: i64, len: usize },

    /// Flow operators (`->`, `~>`) require both operands to be events of
    /// the analyzed trace.
    #[error("The '{operator}' operator requires both operands to be events of the input trace")]
    NotInFlowGraph { operator: &'static str },

    #[error("Division by zero")]
    DivisionByZero,

    /// An external predicate failed (e.g. a detector backend error).
    #[error("Error during analysis: {0}")]
    PredicateFailed(String),
}

impl EvalError {
    /// Error for a non-whitelisted attribute on a restricted entity type.
    pub fn unavailable(type_name: &'static str, attribute: &str, available: &'static str) -> Self {
        EvalError::UnavailableAttribute {
            type_name,
            attribute: attribute.to_string(),
            available,
        }
    }
}
