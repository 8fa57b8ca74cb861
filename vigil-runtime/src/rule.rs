//! Rule construction and application.
//!
//! Every `raise` statement of a policy becomes a rule. Applying a rule
//! runs model enumeration over its body; each satisfying model is handed
//! to the raise action, which evaluates the error constructor under the
//! model's assignment. Ranges are localized into dotted JSON paths and
//! each error is tagged with a stable result key derived from the rule
//! index and the model's assignment, which is what makes incremental
//! deduplication work across invocations.

use crate::cache::FunctionCache;
use crate::detectors::DetectorRegistry;
use crate::enumeration::{enumerate_models, EvaluationResult};
use crate::interpreter::{eval_expression, AnalysisContext, Eval, VariableStore};
use crate::link::{Binding, LinkedPolicy};
use crate::policy::ErrorInformation;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use vigil_core::{EvalError, Trace, Value};
use vigil_dsl::{Expr, ExprKind, RaiseRule, ScopeTable, Stmt};

// ============================================================================
// RULES
// ============================================================================

/// A single raise-rule of a policy.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Index of the `raise` statement in the policy AST.
    pub stmt: usize,
    repr: String,
}

/// One fired rule: the satisfying model and the constructed error.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub model: EvaluationResult,
    pub error: ErrorInformation,
}

/// All rules of a policy, applied in declaration order.
pub struct RuleSet {
    policy: Arc<LinkedPolicy>,
    rules: Vec<Rule>,
    cached: bool,
    cache: FunctionCache,
    detectors: DetectorRegistry,
}

impl RuleSet {
    pub fn from_policy(
        policy: Arc<LinkedPolicy>,
        cached: bool,
        detectors: DetectorRegistry,
    ) -> Self {
        let rules = policy
            .ast
            .statements
            .iter()
            .enumerate()
            .filter_map(|(idx, stmt)| match stmt {
                Stmt::Raise(rule) => Some(Rule {
                    stmt: idx,
                    repr: format!("<Rule raise @ line {}>", rule.loc.line),
                }),
                _ => None,
            })
            .collect();

        Self {
            policy,
            rules,
            cached,
            cache: FunctionCache::new(),
            detectors,
        }
    }

    pub fn policy(&self) -> &LinkedPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn set_cached(&mut self, cached: bool) {
        self.cached = cached;
    }

    /// Applies all rules to the trace. Evaluation errors abort the
    /// analysis; rule-fired errors accumulate in the returned matches.
    /// Returns the matches found so far plus whether the run was
    /// cancelled.
    pub fn apply(
        &self,
        trace: &Trace,
        params: &BTreeMap<String, Value>,
        cancel: Option<&crate::interpreter::CancelToken>,
    ) -> Result<(Vec<RuleMatch>, bool), EvalError> {
        // without cross-invocation caching, every analysis starts cold
        if !self.cached {
            self.cache.clear();
        }

        let mut matches = Vec::new();

        for (rule_idx, rule) in self.rules.iter().enumerate() {
            if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
                return Ok((matches, true));
            }
            let ctx = AnalysisContext {
                trace,
                params,
                cache: &self.cache,
                detectors: &self.detectors,
                cancel,
            };
            let raise = match &self.policy.ast.statements[rule.stmt] {
                Stmt::Raise(raise) => raise,
                _ => continue,
            };

            let mut models: Vec<EvaluationResult> = Vec::new();
            {
                let policy = &self.policy;
                let mut action_can_eval = |store: &mut VariableStore| {
                    constructor_can_eval(policy, &ctx, &raise.constructor, store)
                };
                enumerate_models(
                    policy,
                    &ctx,
                    &raise.body,
                    &VariableStore::new(),
                    Some(&mut action_can_eval),
                    &mut |model| {
                        if model.result {
                            models.push(model);
                        }
                        ControlFlow::Continue(())
                    },
                )?;
            }

            tracing::debug!(
                rule = %rule.repr,
                models = models.len(),
                "rule application finished"
            );

            for mut model in models {
                // localize identity ranges into dotted JSON paths
                model.ranges = trace.locate(&model.ranges);

                let mut error = build_error(&self.policy, &ctx, raise, &model)?;
                error.ranges = model.ranges.clone();
                error.key = Some(result_key(
                    trace,
                    &self.policy.scopes,
                    rule_idx,
                    &model.assignment,
                ));
                matches.push(RuleMatch { model, error });
            }
        }

        let cancelled = cancel.map(|c| c.is_cancelled()).unwrap_or(false);
        Ok((matches, cancelled))
    }
}

// ============================================================================
// RAISE ACTION
// ============================================================================

fn is_error_constructor(policy: &LinkedPolicy, expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Call { callee, .. } => match &callee.kind {
            ExprKind::Ident { decl: Some(id), .. } => {
                matches!(policy.globals.get(*id), Some(Binding::ErrorConstructor))
            }
            _ => false,
        },
        _ => false,
    }
}

/// Whether the raise action can already be fully evaluated under the given
/// (possibly partial) assignment. Models are expanded further until this
/// holds.
fn constructor_can_eval(
    policy: &LinkedPolicy,
    ctx: &AnalysisContext<'_>,
    constructor: &Expr,
    store: &mut VariableStore,
) -> Result<bool, EvalError> {
    match &constructor.kind {
        ExprKind::Str { .. } => Ok(true),
        ExprKind::Call { args, kwargs, .. } if is_error_constructor(policy, constructor) => {
            for arg in args {
                if eval_expression(policy, ctx, store, arg, true)?.0.is_unknown() {
                    return Ok(false);
                }
            }
            for (_, value) in kwargs {
                if eval_expression(policy, ctx, store, value, true)?.0.is_unknown() {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        _ => Ok(!eval_expression(policy, ctx, store, constructor, true)?
            .0
            .is_unknown()),
    }
}

/// Evaluates the error constructor under the model's assignment. Bound
/// trace entities are snapshotted so the error stays meaningful after the
/// trace is gone.
fn build_error(
    policy: &LinkedPolicy,
    ctx: &AnalysisContext<'_>,
    raise: &RaiseRule,
    model: &EvaluationResult,
) -> Result<ErrorInformation, EvalError> {
    let mut store: VariableStore = model.assignment.clone();

    match &raise.constructor.kind {
        ExprKind::Str { value, .. } => Ok(ErrorInformation {
            args: vec![Value::str(value.clone())],
            kwargs: BTreeMap::new(),
            ranges: Vec::new(),
            key: None,
        }),
        ExprKind::Call { args, kwargs, .. }
            if is_error_constructor(policy, &raise.constructor) =>
        {
            let mut arg_values = Vec::with_capacity(args.len());
            for arg in args {
                let value = eval_to_value(policy, ctx, &mut store, arg)?;
                arg_values.push(ctx.trace.snapshot(&value));
            }
            let mut kwarg_values = BTreeMap::new();
            for (name, value) in kwargs {
                let value = eval_to_value(policy, ctx, &mut store, value)?;
                kwarg_values.insert(name.clone(), ctx.trace.snapshot(&value));
            }
            Ok(ErrorInformation {
                args: arg_values,
                kwargs: kwarg_values,
                ranges: Vec::new(),
                key: None,
            })
        }
        _ => {
            let value = eval_to_value(policy, ctx, &mut store, &raise.constructor)?;
            Ok(ErrorInformation {
                args: vec![ctx.trace.snapshot(&value)],
                kwargs: BTreeMap::new(),
                ranges: Vec::new(),
                key: None,
            })
        }
    }
}

fn eval_to_value(
    policy: &LinkedPolicy,
    ctx: &AnalysisContext<'_>,
    store: &mut VariableStore,
    expr: &Expr,
) -> Result<Value, EvalError> {
    match eval_expression(policy, ctx, store, expr, false)?.0 {
        Eval::Val(value) => Ok(value),
        _ => Err(EvalError::Type(
            "error constructor did not evaluate to a value".to_string(),
        )),
    }
}

// ============================================================================
// RESULT KEYS
// ============================================================================

/// Stable identity of a fired rule across invocations: a digest over the
/// rule index and the sorted `(variable, trace position)` pairs of the
/// model's assignment.
pub fn result_key(
    trace: &Trace,
    scopes: &ScopeTable,
    rule_idx: usize,
    assignment: &BTreeMap<vigil_dsl::DeclId, Value>,
) -> String {
    let mut pairs: Vec<(String, String)> = assignment
        .iter()
        .map(|(decl, value)| {
            (
                scopes.info(*decl).name.clone(),
                key_atom(trace, value),
            )
        })
        .collect();
    pairs.sort();

    let mut hasher = Sha256::new();
    hasher.update(rule_idx.to_string());
    for (name, atom) in &pairs {
        hasher.update("|");
        hasher.update(name);
        hasher.update("=");
        hasher.update(atom);
    }
    hex::encode(&hasher.finalize()[..16])
}

fn key_atom(trace: &Trace, value: &Value) -> String {
    match value {
        Value::Message(idx) | Value::ToolOutput(idx) => idx.to_string(),
        Value::ToolCall(site) => match (trace.call(*site), site.slot) {
            (Some(call), Some(slot)) => format!("{}.{}", call.trace_idx, slot),
            (Some(call), None) => call.trace_idx.to_string(),
            (None, _) => "-1".to_string(),
        },
        // objects drawn from explicit domains identify by their `key` entry
        Value::Object(o) => match o.get("key") {
            Some(Value::Str(key)) => key.text.clone(),
            _ => "-1".to_string(),
        },
        _ => "-1".to_string(),
    }
}
