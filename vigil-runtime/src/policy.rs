//! Policy loading and analysis.
//!
//! A `Policy` owns the linked rule set for one policy source. `analyze`
//! runs every rule against a trace and returns the fired errors;
//! `analyze_pending` additionally filters to errors that touch the pending
//! suffix of the trace. Loading problems (syntax, scoping, validation,
//! linking) surface eagerly as a single `PolicyLoadingError` carrying all
//! per-site issues.

use crate::detectors::DetectorRegistry;
use crate::link::{link, SymbolTable};
use crate::rule::{RuleMatch, RuleSet};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use vigil_core::{EvalError, Range, Trace, TraceError, Value};
use vigil_dsl::PolicyIssue;

/// Parameters passed to `analyze(...)`; rules reach them through the
/// reserved `input` identifier.
pub type PolicyParameters = BTreeMap<String, Value>;

// ============================================================================
// ERROR RECORDS
// ============================================================================

/// A rule-fired error: the intended output of a successful analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInformation {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    pub ranges: Vec<Range>,
    /// Stable identity of this error across invocations, derived from the
    /// underlying variable assignment.
    pub key: Option<String>,
}

impl ErrorInformation {
    /// Serializes the record with ranges in address form.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "key": self.key,
            "args": self.args.iter().map(Value::to_json).collect::<Vec<_>>(),
            "kwargs": self
                .kwargs
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect::<serde_json::Map<String, serde_json::Value>>(),
            "ranges": self.ranges.iter().map(Range::to_address).collect::<Vec<_>>(),
        })
    }
}

impl fmt::Display for ErrorInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Violation(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", arg)?;
        }
        for (name, value) in &self.kwargs {
            write!(f, ", {}={}", name, value)?;
        }
        if !self.ranges.is_empty() {
            write!(f, ", ranges=[<{} ranges>]", self.ranges.len())?;
        }
        write!(f, ")")
    }
}

/// Result of applying a policy to a trace. `cancelled` marks a run that
/// was stopped cooperatively; the errors found up to that point are kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisResult {
    pub errors: Vec<ErrorInformation>,
    pub cancelled: bool,
}

impl fmt::Display for AnalysisResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "AnalysisResult(errors=[])");
        }
        writeln!(f, "AnalysisResult(errors=[")?;
        for error in &self.errors {
            writeln!(f, "    {}", error)?;
        }
        write!(f, "])")
    }
}

// ============================================================================
// FAILURE MODES
// ============================================================================

/// Raised when a policy cannot be constructed from its source.
#[derive(Debug, Clone, Error)]
#[error("{msg}")]
pub struct PolicyLoadingError {
    pub msg: String,
    pub errors: Vec<PolicyIssue>,
}

/// Raised by `raise_unhandled` modes when an analysis produced errors.
#[derive(Debug, Clone)]
pub struct UnhandledError {
    pub errors: Vec<ErrorInformation>,
}

impl fmt::Display for UnhandledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let noun = if self.errors.len() > 1 { "errors" } else { "error" };
        writeln!(
            f,
            "A policy analysis resulted in {} unhandled {}:",
            self.errors.len(),
            noun
        )?;
        for error in &self.errors {
            writeln!(f, " - {}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for UnhandledError {}

/// Failures of one `analyze(...)` call.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error("cannot use '{0}' as policy parameter key, as it is reserved for the main input object")]
    ReservedParameter(String),

    #[error("{0}")]
    Unhandled(UnhandledError),
}

// ============================================================================
// POLICY
// ============================================================================

/// A set of rules applied to traces.
pub struct Policy {
    rule_set: RuleSet,
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy").finish_non_exhaustive()
    }
}

impl Policy {
    /// Loads a policy from source with the standard symbol table and
    /// detector registry.
    pub fn from_string(source: &str) -> Result<Self, PolicyLoadingError> {
        Self::load(source, None, &SymbolTable::standard(), DetectorRegistry::standard(), false)
    }

    pub fn from_file(path: &str) -> Result<Self, PolicyLoadingError> {
        let source = std::fs::read_to_string(path).map_err(|e| PolicyLoadingError {
            msg: format!("could not read policy file {}: {}", path, e),
            errors: Vec::new(),
        })?;
        Self::load(
            &source,
            Some(path),
            &SymbolTable::standard(),
            DetectorRegistry::standard(),
            false,
        )
    }

    /// Loads a policy with an explicit symbol table and detector registry.
    pub fn load(
        source: &str,
        path: Option<&str>,
        symbol_table: &SymbolTable,
        detectors: DetectorRegistry,
        cached: bool,
    ) -> Result<Self, PolicyLoadingError> {
        let value_types = detectors.value_types();
        let value_type_refs: Vec<&str> = value_types.iter().map(String::as_str).collect();
        let parsed = vigil_dsl::parse(source, path, &value_type_refs);
        let source_code = parsed.source.clone();

        let linked = link(parsed, symbol_table).map_err(|errors| {
            let mut msg = String::from(
                "Failed to create policy from policy source. The following errors were found:\n",
            );
            for issue in &errors {
                msg.push_str(&source_code.error_window(
                    &issue.message,
                    issue.line,
                    issue.column,
                    2,
                ));
                msg.push('\n');
            }
            PolicyLoadingError { msg, errors }
        })?;

        Ok(Self {
            rule_set: RuleSet::from_policy(Arc::new(linked), cached, detectors),
        })
    }

    pub(crate) fn set_cached(&mut self, cached: bool) {
        self.rule_set.set_cached(cached);
    }

    /// Full analysis of a trace.
    pub fn analyze(
        &self,
        events: &[serde_json::Value],
        params: &PolicyParameters,
    ) -> Result<AnalysisResult, AnalysisError> {
        self.analyze_with_token(events, params, None)
    }

    /// Full analysis with a cooperative cancellation token. A cancelled
    /// run returns the errors discovered so far with `cancelled` set.
    pub fn analyze_with_token(
        &self,
        events: &[serde_json::Value],
        params: &PolicyParameters,
        cancel: Option<&crate::interpreter::CancelToken>,
    ) -> Result<AnalysisResult, AnalysisError> {
        check_reserved(params)?;
        let trace = Trace::parse(events)?;
        let (matches, cancelled) = self.rule_set.apply(&trace, params, cancel)?;
        Ok(AnalysisResult {
            errors: matches.into_iter().map(|m| m.error).collect(),
            cancelled,
        })
    }

    /// Analysis of `past ++ pending`, filtered to errors that reference at
    /// least one event in the pending window (errors binding no events at
    /// all are kept).
    pub fn analyze_pending(
        &self,
        past_events: &[serde_json::Value],
        pending_events: &[serde_json::Value],
        params: &PolicyParameters,
    ) -> Result<AnalysisResult, AnalysisError> {
        check_reserved(params)?;
        let first_pending_idx = past_events.len();

        let mut all_events = past_events.to_vec();
        all_events.extend(pending_events.to_vec());
        let trace = Trace::parse(&all_events)?;

        let (matches, cancelled) = self.rule_set.apply(&trace, params, None)?;
        let errors = matches
            .into_iter()
            .filter(|m| touches_pending(&trace, m, first_pending_idx))
            .map(|m| m.error)
            .collect();
        Ok(AnalysisResult { errors, cancelled })
    }

    /// Wraps this policy for incremental use: repeated calls only report
    /// errors not seen in earlier invocations.
    pub fn incremental(self) -> crate::monitor::IncrementalPolicy {
        crate::monitor::IncrementalPolicy::new(self)
    }
}

fn check_reserved(params: &PolicyParameters) -> Result<(), AnalysisError> {
    if params.contains_key("data") {
        return Err(AnalysisError::ReservedParameter("data".to_string()));
    }
    Ok(())
}

fn touches_pending(trace: &Trace, m: &RuleMatch, first_pending_idx: usize) -> bool {
    let indices: Vec<usize> = m
        .model
        .assignment
        .values()
        .filter_map(|value| trace.trace_index_of(value))
        .collect();
    if indices.is_empty() {
        return true;
    }
    indices.iter().any(|idx| *idx >= first_pending_idx)
}

/// One-shot convenience wrapper.
pub fn analyze_trace(
    policy_source: &str,
    events: &[serde_json::Value],
) -> Result<AnalysisResult, Box<dyn std::error::Error>> {
    let policy = Policy::from_string(policy_source)?;
    Ok(policy.analyze(events, &PolicyParameters::new())?)
}
