//! Incremental analysis and monitoring.
//!
//! An `IncrementalPolicy` remembers the stable keys of every error it has
//! reported and filters them out of later invocations, so a growing trace
//! only ever surfaces new violations. A `Monitor` bundles an incremental
//! policy with fixed policy parameters for pending-window checking as an
//! agent run progresses.

use crate::policy::{
    AnalysisError, AnalysisResult, ErrorInformation, Policy, PolicyLoadingError, PolicyParameters,
    UnhandledError,
};
use std::collections::HashSet;

// ============================================================================
// INCREMENTAL POLICY
// ============================================================================

/// Reports only errors not seen in earlier invocations.
///
/// Errors are recognized by their stable result key; an error without a
/// key cannot be recognized across calls and is reported every time.
pub struct IncrementalPolicy {
    policy: Policy,
    previous_keys: HashSet<String>,
}

impl IncrementalPolicy {
    pub fn new(mut policy: Policy) -> Self {
        // keep the predicate cache warm across invocations
        policy.set_cached(true);
        Self {
            policy,
            previous_keys: HashSet::new(),
        }
    }

    pub fn analyze(
        &mut self,
        events: &[serde_json::Value],
        params: &PolicyParameters,
    ) -> Result<AnalysisResult, AnalysisError> {
        let result = self.policy.analyze(events, params)?;
        Ok(self.filter_result(result))
    }

    pub fn analyze_pending(
        &mut self,
        past_events: &[serde_json::Value],
        pending_events: &[serde_json::Value],
        params: &PolicyParameters,
    ) -> Result<AnalysisResult, AnalysisError> {
        let result = self
            .policy
            .analyze_pending(past_events, pending_events, params)?;
        Ok(self.filter_result(result))
    }

    /// Clears the incremental state; every error counts as new again.
    pub fn reset(&mut self) {
        self.previous_keys.clear();
    }

    fn filter_result(&mut self, result: AnalysisResult) -> AnalysisResult {
        let cancelled = result.cancelled;
        let new_errors: Vec<ErrorInformation> = result
            .errors
            .into_iter()
            .filter(|error| match &error.key {
                Some(key) => !self.previous_keys.contains(key),
                None => true,
            })
            .collect();

        let fresh = new_errors
            .iter()
            .filter_map(|error| error.key.clone())
            .collect::<Vec<_>>();
        tracing::trace!(
            new = new_errors.len(),
            seen = self.previous_keys.len(),
            "incremental filter applied"
        );
        self.previous_keys.extend(fresh);

        AnalysisResult {
            errors: new_errors,
            cancelled,
        }
    }
}

// ============================================================================
// MONITOR
// ============================================================================

/// A policy applied incrementally to a growing agent trace.
///
/// Across the lifetime of a monitor an error relating to a specific part
/// of the trace is reported only once, even if it persists; clients can
/// act on each violation exactly once without tracking duplicates.
pub struct Monitor {
    policy: IncrementalPolicy,
    policy_parameters: PolicyParameters,
    raise_unhandled: bool,
}

impl Monitor {
    pub fn new(policy: Policy, policy_parameters: PolicyParameters) -> Self {
        Self {
            policy: policy.incremental(),
            policy_parameters,
            raise_unhandled: false,
        }
    }

    pub fn from_string(
        source: &str,
        policy_parameters: PolicyParameters,
    ) -> Result<Self, PolicyLoadingError> {
        Ok(Self::new(Policy::from_string(source)?, policy_parameters))
    }

    /// In this mode `check` converts a non-empty error list into an
    /// `AnalysisError::Unhandled`.
    pub fn raise_unhandled(mut self) -> Self {
        self.raise_unhandled = true;
        self
    }

    /// Analyzes `past ++ pending`, reporting new errors that touch the
    /// pending events.
    pub fn check(
        &mut self,
        past_events: &[serde_json::Value],
        pending_events: &[serde_json::Value],
    ) -> Result<Vec<ErrorInformation>, AnalysisError> {
        let result =
            self.policy
                .analyze_pending(past_events, pending_events, &self.policy_parameters)?;
        if self.raise_unhandled && !result.errors.is_empty() {
            return Err(AnalysisError::Unhandled(UnhandledError {
                errors: result.errors,
            }));
        }
        Ok(result.errors)
    }

    /// Full (non-windowed) incremental analysis.
    pub fn analyze(
        &mut self,
        events: &[serde_json::Value],
    ) -> Result<AnalysisResult, AnalysisError> {
        self.policy.analyze(events, &self.policy_parameters)
    }

    /// Clears the incremental state.
    pub fn reset(&mut self) {
        self.policy.reset();
    }
}
