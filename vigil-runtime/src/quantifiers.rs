//! Trace-level quantifiers.
//!
//! Quantifiers wrap an indented rule-body block and decide it against all
//! assignments over the trace: `forall` requires every assignment to
//! satisfy the body, `count(min=…, max=…)` requires the number of
//! satisfying assignments to fall within the bounds. Evaluation
//! short-circuits as soon as the outcome is decided.

use crate::enumeration::enumerate_models;
use crate::interpreter::{AnalysisContext, VariableStore};
use crate::link::LinkedPolicy;
use std::ops::ControlFlow;
use vigil_core::{EvalError, Range};
use vigil_dsl::Expr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantifierKind {
    Forall,
    Count,
}

/// A quantifier instance as written in a rule body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantifierSpec {
    pub kind: QuantifierKind,
    pub min: Option<i64>,
    pub max: Option<i64>,
}

/// Evaluates a quantifier block. Bindings of the enclosing rule are fixed
/// for the nested enumeration. Ranges of satisfying assignments of a
/// `count` block are propagated to the caller.
pub fn eval_quantifier(
    policy: &LinkedPolicy,
    ctx: &AnalysisContext<'_>,
    spec: &QuantifierSpec,
    body: &[Expr],
    outer: &VariableStore,
    ranges: &mut Vec<Range>,
) -> Result<bool, EvalError> {
    match spec.kind {
        QuantifierKind::Forall => {
            let mut holds = true;
            enumerate_models(policy, ctx, body, outer, None, &mut |model| {
                if model.result {
                    ControlFlow::Continue(())
                } else {
                    holds = false;
                    ControlFlow::Break(())
                }
            })?;
            Ok(holds)
        }
        QuantifierKind::Count => {
            let (min, max) = (spec.min, spec.max);
            let mut matches = 0i64;
            let mut decided = None;
            enumerate_models(policy, ctx, body, outer, None, &mut |model| {
                if model.result {
                    matches += 1;
                    ranges.extend(model.ranges.clone());
                }
                // an exceeded upper bound is final
                if let Some(max) = max {
                    if matches > max {
                        decided = Some(false);
                        return ControlFlow::Break(());
                    }
                }
                // with only a lower bound, reaching it is final
                if let (Some(min), None) = (min, max) {
                    if matches >= min {
                        decided = Some(true);
                        return ControlFlow::Break(());
                    }
                }
                ControlFlow::Continue(())
            })?;

            if let Some(decided) = decided {
                return Ok(decided);
            }
            if let Some(min) = min {
                if matches < min {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }
}
