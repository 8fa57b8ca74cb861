//! Model enumeration: searching variable assignments that satisfy a rule
//! body.
//!
//! Starting from the empty assignment, the body is partially evaluated;
//! every evaluation reports the variable domains it discovered. Discovered
//! domains are materialized (bounded domains from `(v: T) in E`, otherwise
//! all events of the declared type), the cross-product of candidates is
//! taken, and each candidate assignment is evaluated in turn. Candidates
//! that stay `Unknown` but discover further domains are expanded
//! recursively through a worklist.
//!
//! The driver is a sequential worklist; consumers receive models through a
//! callback and can stop enumeration early (`count` quantifier bounds,
//! predicate existence checks).

use crate::interpreter::{
    eval_rule_body, AnalysisContext, VariableDomain, VariableStore,
};
use crate::link::LinkedPolicy;
use crate::trilean::Trilean;
use std::collections::{BTreeMap, VecDeque};
use std::ops::ControlFlow;
use vigil_core::{EvalError, Range, Trace, Value};
use vigil_dsl::{DeclId, Expr};

// ============================================================================
// RESULTS
// ============================================================================

/// One enumerated assignment together with its evaluation outcome and the
/// ranges recorded while evaluating it. `assignment` contains the
/// enumerated variables plus any `:=`-derived bindings; fixed outer
/// bindings (quantifier captures, predicate parameters) are excluded.
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub result: bool,
    pub assignment: BTreeMap<DeclId, Value>,
    pub ranges: Vec<Range>,
}

/// Object-level range for a value bound by a model, if the value has trace
/// identity.
pub(crate) fn object_range(trace: &Trace, value: &Value) -> Option<Range> {
    let node = match value {
        Value::Message(idx) | Value::ToolOutput(idx) => trace.events().get(*idx).map(|e| e.node()),
        Value::ToolCall(site) => trace.call(*site).map(|c| c.node),
        other => other.origin(),
    }?;
    Some(Range::object(node))
}

// ============================================================================
// ENUMERATION
// ============================================================================

/// Candidate values for a domain: the bounded values when given, otherwise
/// all events of the declared type.
fn select(ctx: &AnalysisContext<'_>, domain: &VariableDomain) -> Vec<Value> {
    match &domain.values {
        None => ctx.trace.select(&domain.type_ref),
        Some(values) => values
            .iter()
            .flat_map(|value| ctx.trace.select_within(value, &domain.type_ref))
            .collect(),
    }
}

/// Enumerates assignments of the rule body over the trace, invoking
/// `on_model` for every definitively satisfied or violated assignment.
/// `base_store` holds bindings fixed by the caller (predicate parameters,
/// quantifier captures); they are visible to the body but not enumerated.
///
/// `extra_check` may reject a satisfying partial assignment, forcing
/// further expansion (used to ensure the rule action itself is fully
/// evaluable before a model is emitted).
pub fn enumerate_models(
    policy: &LinkedPolicy,
    ctx: &AnalysisContext<'_>,
    body: &[Expr],
    base_store: &VariableStore,
    mut extra_check: Option<&mut dyn FnMut(&mut VariableStore) -> Result<bool, EvalError>>,
    on_model: &mut dyn FnMut(EvaluationResult) -> ControlFlow<()>,
) -> Result<(), EvalError> {
    let mut worklist: VecDeque<BTreeMap<DeclId, VariableDomain>> = VecDeque::new();
    worklist.push_back(BTreeMap::new());

    while let Some(domains) = worklist.pop_front() {
        let candidates: Vec<(DeclId, Vec<Value>)> = domains
            .iter()
            .map(|(decl, domain)| (*decl, select(ctx, domain)))
            .collect();

        for combo in CrossProduct::new(&candidates) {
            if ctx.is_cancelled() {
                return Ok(());
            }
            let mut store = base_store.clone();
            for (decl, value) in &combo {
                store.insert(*decl, value.clone());
            }

            let eval = eval_rule_body(policy, ctx, &mut store, body)?;

            // enumerated plus derived bindings, without the fixed base
            let assignment: BTreeMap<DeclId, Value> = store
                .iter()
                .filter(|(decl, _)| !base_store.contains_key(decl))
                .map(|(decl, value)| (*decl, value.clone()))
                .collect();

            match eval.result {
                Trilean::False => {
                    let mut ranges = eval.ranges;
                    ranges.extend(
                        assignment
                            .values()
                            .filter_map(|v| object_range(ctx.trace, v)),
                    );
                    let model = EvaluationResult {
                        result: false,
                        assignment,
                        ranges,
                    };
                    if on_model(model).is_break() {
                        return Ok(());
                    }
                }
                Trilean::True => {
                    let accepted = match extra_check.as_mut() {
                        Some(check) => check(&mut store)?,
                        None => true,
                    };
                    if accepted {
                        let mut ranges = eval.ranges;
                        ranges.extend(
                            assignment
                                .values()
                                .filter_map(|v| object_range(ctx.trace, v)),
                        );
                        let model = EvaluationResult {
                            result: true,
                            assignment,
                            ranges,
                        };
                        if on_model(model).is_break() {
                            return Ok(());
                        }
                    } else if !eval.domains.is_empty() {
                        worklist.push_back(expanded_domains(&domains, &combo, eval.domains));
                    }
                }
                Trilean::Unknown => {
                    if !eval.domains.is_empty() {
                        worklist.push_back(expanded_domains(&domains, &combo, eval.domains));
                    }
                }
            }
        }
    }

    Ok(())
}

/// Pins the current candidate assignment to single-value domains and adds
/// the newly discovered ones.
fn expanded_domains(
    current: &BTreeMap<DeclId, VariableDomain>,
    combo: &[(DeclId, Value)],
    discovered: BTreeMap<DeclId, VariableDomain>,
) -> BTreeMap<DeclId, VariableDomain> {
    let mut next = BTreeMap::new();
    for (decl, value) in combo {
        let type_ref = current
            .get(decl)
            .map(|d| d.type_ref.clone())
            .unwrap_or_default();
        next.insert(
            *decl,
            VariableDomain {
                type_ref,
                values: Some(vec![value.clone()]),
            },
        );
    }
    next.extend(discovered);
    next
}

/// Whether any assignment satisfies the given (predicate) body, together
/// with the ranges of the first satisfying model.
pub fn predicate_exists(
    policy: &LinkedPolicy,
    ctx: &AnalysisContext<'_>,
    body: &[Expr],
    bound: &VariableStore,
) -> Result<(bool, Vec<Range>), EvalError> {
    let mut found = false;
    let mut ranges = Vec::new();
    enumerate_models(policy, ctx, body, bound, None, &mut |model| {
        if model.result {
            found = true;
            ranges = model.ranges;
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })?;
    Ok((found, ranges))
}

// ============================================================================
// CROSS PRODUCT
// ============================================================================

/// Odometer-style cross product over candidate value lists. An empty set
/// of domains yields the single empty assignment; an empty candidate list
/// yields nothing.
struct CrossProduct<'a> {
    candidates: &'a [(DeclId, Vec<Value>)],
    indices: Vec<usize>,
    done: bool,
}

impl<'a> CrossProduct<'a> {
    fn new(candidates: &'a [(DeclId, Vec<Value>)]) -> Self {
        let done = candidates.iter().any(|(_, values)| values.is_empty());
        Self {
            candidates,
            indices: vec![0; candidates.len()],
            done,
        }
    }
}

impl Iterator for CrossProduct<'_> {
    type Item = Vec<(DeclId, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let combo = self
            .candidates
            .iter()
            .zip(&self.indices)
            .map(|((decl, values), idx)| (*decl, values[*idx].clone()))
            .collect();

        // advance the odometer
        let mut position = self.candidates.len();
        loop {
            if position == 0 {
                self.done = true;
                break;
            }
            position -= 1;
            self.indices[position] += 1;
            if self.indices[position] < self.candidates[position].1.len() {
                break;
            }
            self.indices[position] = 0;
        }

        Some(combo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(n: usize) -> Vec<Value> {
        (0..n).map(|i| Value::Int(i as i64)).collect()
    }

    #[test]
    fn cross_product_of_nothing_is_one_empty_assignment() {
        let candidates: Vec<(DeclId, Vec<Value>)> = Vec::new();
        let combos: Vec<_> = CrossProduct::new(&candidates).collect();
        assert_eq!(combos.len(), 1);
        assert!(combos[0].is_empty());
    }

    #[test]
    fn cross_product_counts_multiply() {
        let candidates = vec![(DeclId(0), values(2)), (DeclId(1), values(3))];
        assert_eq!(CrossProduct::new(&candidates).count(), 6);
    }

    #[test]
    fn empty_domain_kills_the_product() {
        let candidates = vec![(DeclId(0), values(2)), (DeclId(1), Vec::new())];
        assert_eq!(CrossProduct::new(&candidates).count(), 0);
    }
}
