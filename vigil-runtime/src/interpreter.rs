//! Three-valued partial evaluation of rule-body expressions.
//!
//! Expressions evaluate under a variable store (enumerated and derived
//! bindings), the frozen global environment, and an analysis context
//! (trace, policy parameters, predicate cache). Every expression produces a
//! value, `Unknown` (truth still depends on unbound variables), or `Nop`
//! (`:=` bindings, which make no boolean contribution).
//!
//! The interpreter's discovered-domain map and range list are owned by the
//! interpreter instance for one evaluation; the enumeration driver reads
//! them out afterwards.

use crate::cache::FunctionCache;
use crate::detectors::DetectorRegistry;
use crate::enumeration;
use crate::link::{Binding, CallArgs, CallScope, LinkedPolicy};
use crate::patterns;
use crate::quantifiers::{self, QuantifierKind, QuantifierSpec};
use crate::trilean::Trilean;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use vigil_core::{EvalError, ListValue, Range, StrValue, Trace, Value};
use vigil_dsl::{BinaryOp, DeclId, Expr, ExprKind, Stmt, UnaryOp};

// ============================================================================
// EVALUATION STATE
// ============================================================================

/// Variable bindings for one enumeration candidate. Keys are declaration
/// ids; `:=` bindings land here during evaluation.
pub type VariableStore = BTreeMap<DeclId, Value>;

/// Result of evaluating a single expression.
#[derive(Debug, Clone)]
pub enum Eval {
    Val(Value),
    Unknown,
    Nop,
}

impl Eval {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Eval::Unknown)
    }

    /// Boolean contribution of a body clause. Non-boolean values cannot
    /// satisfy a conjunction; they are treated as unresolved.
    pub fn clause_truth(&self) -> Option<Trilean> {
        match self {
            Eval::Nop => None,
            Eval::Unknown => Some(Trilean::Unknown),
            Eval::Val(Value::Bool(b)) => Some((*b).into()),
            Eval::Val(_) => Some(Trilean::Unknown),
        }
    }
}

/// The domain of a free or derived variable in a rule body. Domains are
/// discovered during evaluation; `values: None` means the variable ranges
/// over the whole input of its declared type.
#[derive(Debug, Clone)]
pub struct VariableDomain {
    pub type_ref: String,
    pub values: Option<Vec<Value>>,
}

/// Cooperative cancellation handle. The engine polls it between body
/// clauses and at enumeration task boundaries; a cancelled analysis
/// returns the errors discovered so far together with a cancellation
/// flag, never dropping partial results.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Everything one analysis shares between rule evaluations: the trace, the
/// policy parameters, the predicate cache and the cancellation signal.
pub struct AnalysisContext<'a> {
    pub trace: &'a Trace,
    pub params: &'a BTreeMap<String, Value>,
    pub cache: &'a FunctionCache,
    pub detectors: &'a DetectorRegistry,
    pub cancel: Option<&'a CancelToken>,
}

impl AnalysisContext<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.map(CancelToken::is_cancelled).unwrap_or(false)
    }
}

/// Result of evaluating a rule body under one candidate assignment.
#[derive(Debug)]
pub struct BodyEval {
    pub result: Trilean,
    pub domains: BTreeMap<DeclId, VariableDomain>,
    pub ranges: Vec<Range>,
}

/// Evaluates a rule body as a short-circuited conjunction with partial
/// evaluation enabled. Short-circuiting is semantically required: earlier
/// clauses bind variables used by later clauses, and later clauses may
/// fail with type errors when earlier guards do not hold.
pub fn eval_rule_body(
    policy: &LinkedPolicy,
    ctx: &AnalysisContext<'_>,
    store: &mut VariableStore,
    body: &[Expr],
) -> Result<BodyEval, EvalError> {
    let mut interp = Interpreter::new(policy, ctx, store, true);
    let mut result = Trilean::True;

    for expr in body {
        // cancellation is polled between body clauses; an undecided
        // result with no domains simply drops out of enumeration
        if ctx.is_cancelled() {
            result = Trilean::Unknown;
            break;
        }
        let part = interp.visit(expr)?;
        if let Some(truth) = part.clause_truth() {
            result = result.and(truth);
            if truth.is_false() {
                break;
            }
        }
    }

    Ok(BodyEval {
        result,
        domains: interp.domains,
        ranges: interp.ranges,
    })
}

/// Evaluates a single expression (e.g. an error constructor) under the
/// given store. With `partial` false, unbound variables are errors.
pub fn eval_expression(
    policy: &LinkedPolicy,
    ctx: &AnalysisContext<'_>,
    store: &mut VariableStore,
    expr: &Expr,
    partial: bool,
) -> Result<(Eval, Vec<Range>), EvalError> {
    let mut interp = Interpreter::new(policy, ctx, store, partial);
    let result = interp.visit(expr)?;
    Ok((result, interp.ranges))
}

// ============================================================================
// INTERPRETER
// ============================================================================

pub struct Interpreter<'a, 'c> {
    policy: &'a LinkedPolicy,
    ctx: &'a AnalysisContext<'c>,
    store: &'a mut VariableStore,
    partial: bool,
    pub(crate) domains: BTreeMap<DeclId, VariableDomain>,
    pub(crate) ranges: Vec<Range>,
}

impl<'a, 'c> Interpreter<'a, 'c> {
    pub fn new(
        policy: &'a LinkedPolicy,
        ctx: &'a AnalysisContext<'c>,
        store: &'a mut VariableStore,
        partial: bool,
    ) -> Self {
        Self {
            policy,
            ctx,
            store,
            partial,
            domains: BTreeMap::new(),
            ranges: Vec::new(),
        }
    }

    fn scope(&mut self) -> CallScope<'_> {
        CallScope {
            trace: self.ctx.trace,
            ranges: &mut self.ranges,
            detectors: self.ctx.detectors,
        }
    }

    fn register_domain(&mut self, decl: DeclId, domain: VariableDomain) {
        if !self.store.contains_key(&decl) && !self.policy.globals.contains(decl) {
            self.domains.insert(decl, domain);
        }
    }

    pub fn visit(&mut self, expr: &Expr) -> Result<Eval, EvalError> {
        match &expr.kind {
            ExprKind::Int(n) => Ok(Eval::Val(Value::Int(*n))),
            ExprKind::Float(n) => Ok(Eval::Val(Value::Float(*n))),
            ExprKind::Str { value, .. } => Ok(Eval::Val(Value::str(value.clone()))),
            ExprKind::Bool(b) => Ok(Eval::Val(Value::Bool(*b))),
            ExprKind::NoneLit => Ok(Eval::Val(Value::None)),
            ExprKind::Ident { name, decl } => self.visit_ident(name, *decl),
            ExprKind::TypedIdent { type_ref, decl, .. } => {
                let decl = (*decl).ok_or_else(|| {
                    EvalError::Type("typed identifier without declaration".to_string())
                })?;
                self.register_domain(
                    decl,
                    VariableDomain {
                        type_ref: type_ref.clone(),
                        values: None,
                    },
                );
                Ok(Eval::Val(Value::Bool(true)))
            }
            ExprKind::Binary { op, left, right } => self.visit_binary(*op, left, right),
            ExprKind::Unary { op, expr } => self.visit_unary(*op, expr),
            ExprKind::Member { object, member } => self.visit_member(object, member),
            ExprKind::Key { object, key } => self.visit_key(object, key),
            ExprKind::Call {
                callee,
                args,
                kwargs,
            } => self.visit_call(callee, args, kwargs),
            ExprKind::ObjectLit { entries } => {
                let mut object = BTreeMap::new();
                for (key, value) in entries {
                    match self.visit(value)? {
                        Eval::Val(v) => {
                            object.insert(key.clone(), v);
                        }
                        _ => return Ok(Eval::Unknown),
                    }
                }
                Ok(Eval::Val(Value::object(object)))
            }
            ExprKind::ListLit { items } => {
                let mut list = Vec::with_capacity(items.len());
                for item in items {
                    match self.visit(item)? {
                        Eval::Val(v) => list.push(v),
                        _ => return Ok(Eval::Unknown),
                    }
                }
                Ok(Eval::Val(Value::list(list)))
            }
            ExprKind::ListComprehension {
                expr: body,
                var_decl,
                iterable,
                condition,
                ..
            } => self.visit_comprehension(body, *var_decl, iterable, condition.as_deref()),
            ExprKind::Ternary {
                then,
                cond,
                otherwise,
            } => match self.visit(cond)? {
                Eval::Unknown => Ok(Eval::Unknown),
                Eval::Val(c) if c.truthy() => self.visit(then),
                Eval::Nop => Ok(Eval::Unknown),
                _ => self.visit(otherwise),
            },
            ExprKind::Quantifier {
                call,
                negated,
                body,
            } => self.visit_quantifier(call, *negated, body),
            ExprKind::ToolRef { .. } | ExprKind::SemanticPattern { .. } => Err(EvalError::Type(
                "semantic patterns can only be matched with the 'is' operator".to_string(),
            )),
            ExprKind::ValueRef { .. } | ExprKind::Wildcard => Err(EvalError::Type(
                "value references and wildcards are only valid inside semantic patterns"
                    .to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------------
    // Identifiers
    // ------------------------------------------------------------------------

    fn visit_ident(&mut self, name: &str, decl: Option<DeclId>) -> Result<Eval, EvalError> {
        let decl =
            decl.ok_or_else(|| EvalError::Type(format!("unresolved identifier '{}'", name)))?;

        if let Some(value) = self.store.get(&decl) {
            return Ok(Eval::Val(value.clone()));
        }

        match self.policy.globals.get(decl) {
            Some(Binding::Constant { stmt }) => self.eval_constant(*stmt),
            Some(Binding::Params) => Ok(Eval::Val(Value::Params)),
            Some(Binding::TypeName(type_name)) => Ok(Eval::Val(Value::str(type_name.clone()))),
            Some(Binding::Predicate { .. }) => Err(EvalError::Type(format!(
                "predicate '{}' can only be called",
                name
            ))),
            Some(Binding::Host(_)) => Err(EvalError::Type(format!(
                "function '{}' can only be called",
                name
            ))),
            Some(Binding::Quantifier(_)) => Err(EvalError::Type(format!(
                "quantifier '{}' requires an indented body",
                name
            ))),
            Some(Binding::ErrorConstructor) => Err(EvalError::Type(
                "Violation(...) can only be used as a raise constructor".to_string(),
            )),
            Some(Binding::Module(module)) => Err(EvalError::Type(format!(
                "module '{}' is not a value",
                module
            ))),
            None => {
                if self.partial {
                    Ok(Eval::Unknown)
                } else {
                    Err(EvalError::Type(format!(
                        "Failed to resolve variable {}, no binding found",
                        name
                    )))
                }
            }
        }
    }

    fn eval_constant(&mut self, stmt: usize) -> Result<Eval, EvalError> {
        let decl = match self.policy.ast.statements.get(stmt) {
            Some(Stmt::Declaration(decl)) => decl,
            _ => return Err(EvalError::Type("dangling constant declaration".to_string())),
        };
        let expr = decl
            .body
            .first()
            .ok_or_else(|| EvalError::Type("constant declaration without value".to_string()))?;

        let mut child_store = VariableStore::new();
        let mut child = Interpreter::new(self.policy, self.ctx, &mut child_store, self.partial);
        let result = child.visit(expr)?;
        let child_ranges = child.ranges;
        self.ranges.extend(child_ranges);
        Ok(result)
    }

    // ------------------------------------------------------------------------
    // Binary operators
    // ------------------------------------------------------------------------

    fn visit_binary(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
    ) -> Result<Eval, EvalError> {
        // variable binding
        if op == BinaryOp::Assign {
            let decl = match &left.kind {
                ExprKind::Ident { decl: Some(id), .. } => *id,
                _ => {
                    return Err(EvalError::Type(
                        "left side of ':=' must be an identifier".to_string(),
                    ))
                }
            };
            match self.visit(right)? {
                Eval::Val(value) => {
                    self.store.insert(decl, value);
                }
                // the binding stays open; later reads surface as Unknown
                Eval::Unknown | Eval::Nop => {}
            }
            return Ok(Eval::Nop);
        }

        // (v: T) in E registers a bounded variable domain
        if op == BinaryOp::In {
            if let ExprKind::TypedIdent { type_ref, decl, .. } = &left.kind {
                let decl = (*decl).ok_or_else(|| {
                    EvalError::Type("typed identifier without declaration".to_string())
                })?;
                if let Eval::Val(rvalue) = self.visit(right)? {
                    let values = match rvalue {
                        Value::List(l) => l.items,
                        other => vec![other],
                    };
                    self.register_domain(
                        decl,
                        VariableDomain {
                            type_ref: type_ref.clone(),
                            values: Some(values),
                        },
                    );
                }
                // in boolean semantics the binding itself is simply true
                return Ok(Eval::Val(Value::Bool(true)));
            }
        }

        // flow operators work on event-bound identifiers
        if op == BinaryOp::FlowsTo || op == BinaryOp::Successor {
            return self.visit_flow(op, left, right);
        }

        // `is` matches against semantic patterns without evaluating them
        if op == BinaryOp::Is {
            return self.visit_is(left, right);
        }

        let lvalue = self.visit(left)?;
        let rvalue = self.visit(right)?;

        if op == BinaryOp::And || op == BinaryOp::Or {
            return self.visit_logical(op, lvalue, rvalue);
        }

        let (lvalue, rvalue) = match (lvalue, rvalue) {
            (Eval::Val(l), Eval::Val(r)) => (l, r),
            _ => return Ok(Eval::Unknown),
        };

        let result = match op {
            BinaryOp::Eq => Value::Bool(lvalue == rvalue),
            BinaryOp::Ne => Value::Bool(lvalue != rvalue),
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
                Value::Bool(compare(op, &lvalue, &rvalue)?)
            }
            BinaryOp::In => return self.visit_in(lvalue, rvalue),
            BinaryOp::ContainsOnly => Value::Bool(contains_only(&lvalue, &rvalue)?),
            BinaryOp::Add => arith_add(&lvalue, &rvalue)?,
            BinaryOp::Sub => numeric_op(op, &lvalue, &rvalue)?,
            BinaryOp::Mul => numeric_op(op, &lvalue, &rvalue)?,
            BinaryOp::Div => numeric_op(op, &lvalue, &rvalue)?,
            BinaryOp::Mod => numeric_op(op, &lvalue, &rvalue)?,
            BinaryOp::Pow => numeric_op(op, &lvalue, &rvalue)?,
            _ => unreachable!("operator handled above"),
        };
        Ok(Eval::Val(result))
    }

    fn visit_logical(&mut self, op: BinaryOp, l: Eval, r: Eval) -> Result<Eval, EvalError> {
        let bool_of = |e: &Eval, b: bool| matches!(e, Eval::Val(Value::Bool(x)) if *x == b);

        if op == BinaryOp::And {
            // a false part decides the conjunction even if the other part
            // is unknown
            if bool_of(&l, false) || bool_of(&r, false) {
                return Ok(Eval::Val(Value::Bool(false)));
            }
            if l.is_unknown() || r.is_unknown() {
                return Ok(Eval::Unknown);
            }
            let (l, r) = (unwrap_val(l)?, unwrap_val(r)?);
            Ok(Eval::Val(if !l.truthy() { l } else { r }))
        } else {
            if bool_of(&l, true) || bool_of(&r, true) {
                return Ok(Eval::Val(Value::Bool(true)));
            }
            if l.is_unknown() || r.is_unknown() {
                return Ok(Eval::Unknown);
            }
            let (l, r) = (unwrap_val(l)?, unwrap_val(r)?);
            Ok(Eval::Val(if l.truthy() { l } else { r }))
        }
    }

    fn visit_flow(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<Eval, EvalError> {
        let operator = if op == BinaryOp::FlowsTo { "->" } else { "~>" };
        let mut resolve = |interp: &mut Self, side: &Expr| -> Result<Eval, EvalError> {
            match &side.kind {
                ExprKind::TypedIdent { type_ref, decl, .. } => {
                    let decl = (*decl).ok_or_else(|| {
                        EvalError::Type("typed identifier without declaration".to_string())
                    })?;
                    interp.register_domain(
                        decl,
                        VariableDomain {
                            type_ref: type_ref.clone(),
                            values: None,
                        },
                    );
                    match interp.store.get(&decl) {
                        Some(value) => Ok(Eval::Val(value.clone())),
                        None => Ok(Eval::Unknown),
                    }
                }
                ExprKind::Ident { name, decl } => interp.visit_ident(name, *decl),
                _ => Err(EvalError::Type(format!(
                    "The '{}' operator can only be used with identifiers",
                    operator
                ))),
            }
        };

        let lvalue = resolve(self, left)?;
        let rvalue = resolve(self, right)?;
        let (l, r) = match (lvalue, rvalue) {
            (Eval::Val(l), Eval::Val(r)) => (l, r),
            _ => return Ok(Eval::Unknown),
        };

        let holds = if op == BinaryOp::FlowsTo {
            self.ctx.trace.has_flow(&l, &r)?
        } else {
            self.ctx.trace.is_successor(&l, &r)?
        };
        Ok(Eval::Val(Value::Bool(holds)))
    }

    fn visit_is(&mut self, left: &Expr, right: &Expr) -> Result<Eval, EvalError> {
        // `x is not None`
        if let ExprKind::Unary {
            op: UnaryOp::Not,
            expr,
        } = &right.kind
        {
            if matches!(expr.kind, ExprKind::NoneLit) {
                return match self.visit(left)? {
                    Eval::Val(v) => Ok(Eval::Val(Value::Bool(!matches!(v, Value::None)))),
                    _ => Ok(Eval::Unknown),
                };
            }
        }

        match &right.kind {
            ExprKind::SemanticPattern { tool, args } => {
                let lvalue = match self.visit(left)? {
                    Eval::Val(v) => v,
                    _ => return Ok(Eval::Unknown),
                };
                let matcher = patterns::compile(tool, args)?;
                let cache = self.ctx.cache;
                let matched =
                    patterns::match_value(&matcher, &lvalue, cache, &mut self.scope())?;
                Ok(Eval::Val(Value::Bool(matched)))
            }
            ExprKind::ToolRef { name } => {
                let lvalue = match self.visit(left)? {
                    Eval::Val(v) => v,
                    _ => return Ok(Eval::Unknown),
                };
                let matcher = patterns::tool_matcher(name);
                let cache = self.ctx.cache;
                let matched =
                    patterns::match_value(&matcher, &lvalue, cache, &mut self.scope())?;
                Ok(Eval::Val(Value::Bool(matched)))
            }
            _ => {
                let lvalue = self.visit(left)?;
                let rvalue = self.visit(right)?;
                match (lvalue, rvalue) {
                    (Eval::Val(Value::None), Eval::Val(Value::None)) => {
                        Ok(Eval::Val(Value::Bool(true)))
                    }
                    (Eval::Val(l), Eval::Val(r)) => Ok(Eval::Val(Value::Bool(l == r))),
                    _ => Ok(Eval::Unknown),
                }
            }
        }
    }

    /// `in` as containment. On strings the left side is also treated as a
    /// regex and every match is recorded as a character range, while the
    /// boolean result is plain substring containment. `x in None` is
    /// `false`, never an error.
    fn visit_in(&mut self, lvalue: Value, rvalue: Value) -> Result<Eval, EvalError> {
        if matches!(rvalue, Value::None) {
            return Ok(Eval::Val(Value::Bool(false)));
        }

        // elementwise containment for a list on the left
        if let Value::List(items) = &lvalue {
            let mut results = Vec::with_capacity(items.items.len());
            for item in &items.items {
                match self.visit_in(item.clone(), rvalue.clone())? {
                    Eval::Val(v) => results.push(v),
                    other => return Ok(other),
                }
            }
            return Ok(Eval::Val(Value::list(results)));
        }

        match (&lvalue, &rvalue) {
            (Value::Str(needle), Value::Str(haystack)) => {
                self.mark_matches(&needle.text, &haystack.text, haystack.origin)?;
                Ok(Eval::Val(Value::Bool(
                    haystack.text.contains(&needle.text),
                )))
            }
            (Value::Str(needle), Value::Chunks(event)) => {
                let mut found = false;
                let texts: Vec<(vigil_core::NodeId, String)> = self
                    .ctx
                    .trace
                    .chunk_texts(*event)
                    .into_iter()
                    .map(|(node, text)| (node, text.to_string()))
                    .collect();
                for (node, text) in texts {
                    self.mark_matches(&needle.text, &text, Some(node))?;
                    found = found || text.contains(&needle.text);
                }
                for (_, url) in self.ctx.trace.chunk_images(*event) {
                    found = found || url.contains(&needle.text);
                }
                Ok(Eval::Val(Value::Bool(found)))
            }
            (_, Value::List(items)) => Ok(Eval::Val(Value::Bool(
                items.items.iter().any(|item| *item == lvalue),
            ))),
            (Value::Str(key), Value::Object(object)) => Ok(Eval::Val(Value::Bool(
                object.entries.contains_key(&key.text),
            ))),
            _ => Err(EvalError::Type(format!(
                "'in' is not supported between {} and {}",
                lvalue.type_name(),
                rvalue.type_name()
            ))),
        }
    }

    fn mark_matches(
        &mut self,
        pattern: &str,
        haystack: &str,
        origin: Option<vigil_core::NodeId>,
    ) -> Result<(), EvalError> {
        let Some(origin) = origin else {
            return Ok(());
        };
        let regex = Regex::new(pattern)
            .map_err(|e| EvalError::Type(format!("invalid pattern {:?}: {}", pattern, e)))?;
        for m in regex.find_iter(haystack) {
            self.ranges.push(Range::chars(origin, m.start(), m.end()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Unary, member and key access
    // ------------------------------------------------------------------------

    fn visit_unary(&mut self, op: UnaryOp, expr: &Expr) -> Result<Eval, EvalError> {
        let value = match self.visit(expr)? {
            Eval::Val(v) => v,
            _ => return Ok(Eval::Unknown),
        };
        let result = match op {
            UnaryOp::Not => Value::Bool(!value.truthy()),
            UnaryOp::Neg => match value {
                Value::Int(n) => Value::Int(-n),
                Value::Float(n) => Value::Float(-n),
                other => {
                    return Err(EvalError::Type(format!(
                        "cannot negate {}",
                        other.type_name()
                    )))
                }
            },
            UnaryOp::Pos => match value {
                Value::Int(_) | Value::Float(_) => value,
                other => {
                    return Err(EvalError::Type(format!(
                        "unary '+' is not defined for {}",
                        other.type_name()
                    )))
                }
            },
        };
        Ok(Eval::Val(result))
    }

    fn visit_member(&mut self, object: &Expr, member: &str) -> Result<Eval, EvalError> {
        let value = match self.visit(object)? {
            Eval::Val(v) => v,
            _ => return Ok(Eval::Unknown),
        };

        match &value {
            Value::Params => {
                if let Some(param) = self.ctx.params.get(member) {
                    Ok(Eval::Val(param.clone()))
                } else {
                    Err(EvalError::MissingPolicyParameter(format!(
                        "{} (policy relies on `input.{}`)",
                        member, member
                    )))
                }
            }
            // member access on stringified JSON objects resolves into the
            // parsed object
            Value::Str(s) => {
                if let Ok(serde_json::Value::Object(entries)) =
                    serde_json::from_str::<serde_json::Value>(&s.text)
                {
                    return match entries.get(member) {
                        Some(v) => Ok(Eval::Val(Value::from_json(v))),
                        None => Err(EvalError::Key(format!(
                            "object {} has no key {}",
                            s.text, member
                        ))),
                    };
                }
                const STR_METHODS: &[&str] =
                    &["strip", "lower", "upper", "splitlines", "split", "format", "join"];
                match STR_METHODS.iter().find(|m| **m == member) {
                    Some(&name) => Ok(Eval::Val(Value::Method {
                        target: Box::new(value.clone()),
                        name,
                    })),
                    None => Err(EvalError::ExcessivePolicy(format!(
                        "Unavailable attribute {} for str values.",
                        member
                    ))),
                }
            }
            Value::Object(object) => {
                if let Some(v) = object.get(member) {
                    return Ok(Eval::Val(v.clone()));
                }
                const DICT_METHODS: &[&str] = &["keys", "values", "items", "get"];
                match DICT_METHODS.iter().find(|m| **m == member) {
                    Some(&name) => Ok(Eval::Val(Value::Method {
                        target: Box::new(value.clone()),
                        name,
                    })),
                    None => Err(EvalError::ExcessivePolicy(format!(
                        "Unavailable attribute {} for dict values.",
                        member
                    ))),
                }
            }
            Value::Message(_)
            | Value::ToolCall(_)
            | Value::ToolOutput(_)
            | Value::FuncSpec(_)
            | Value::Chunks(_) => Ok(Eval::Val(self.ctx.trace.member(&value, member)?)),
            Value::List(_) => Err(EvalError::Type(format!(
                "attribute {} not found on list; use list[index] to access elements",
                member
            ))),
            other => Err(EvalError::Type(format!(
                "object of type {} does not support member access (e.g. {})",
                other.type_name(),
                member
            ))),
        }
    }

    fn visit_key(&mut self, object: &Expr, key: &Expr) -> Result<Eval, EvalError> {
        let object = match self.visit(object)? {
            Eval::Val(v) => v,
            _ => return Ok(Eval::Unknown),
        };
        let key = match self.visit(key)? {
            Eval::Val(v) => v,
            _ => return Ok(Eval::Unknown),
        };

        match (&object, &key) {
            (Value::List(items), Value::Int(idx)) => {
                let value = index_sequence(items.items.len(), *idx)
                    .and_then(|i| items.items.get(i))
                    .ok_or(EvalError::IndexOutOfBounds {
                        index: *idx,
                        len: items.items.len(),
                    })?;
                Ok(Eval::Val(value.clone()))
            }
            (Value::Str(s), Value::Int(idx)) => {
                let chars: Vec<char> = s.text.chars().collect();
                let ch = index_sequence(chars.len(), *idx)
                    .and_then(|i| chars.get(i))
                    .ok_or(EvalError::IndexOutOfBounds {
                        index: *idx,
                        len: chars.len(),
                    })?;
                Ok(Eval::Val(Value::str(ch.to_string())))
            }
            (Value::Object(o), Value::Str(k)) => match o.get(&k.text) {
                Some(v) => Ok(Eval::Val(v.clone())),
                None => Err(EvalError::Key(format!("object has no key {}", k.text))),
            },
            _ => Err(EvalError::Type(format!(
                "cannot index {} with {}",
                object.type_name(),
                key.type_name()
            ))),
        }
    }

    // ------------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------------

    fn visit_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        kwargs: &[(String, Expr)],
    ) -> Result<Eval, EvalError> {
        // calls through a named binding dispatch on the binding kind
        if let ExprKind::Ident { name, decl } = &callee.kind {
            let decl = (*decl)
                .ok_or_else(|| EvalError::Type(format!("unresolved identifier '{}'", name)))?;
            if !self.store.contains_key(&decl) {
                match self.policy.globals.get(decl).cloned() {
                    Some(Binding::Host(host)) => {
                        let call_args = match self.eval_args(args, kwargs)? {
                            Some(call_args) => call_args,
                            None => return Ok(Eval::Unknown),
                        };
                        let cache = self.ctx.cache;
                        let mut scope = self.scope();
                        return Ok(Eval::Val(cache.call(&host, &call_args, &mut scope)?));
                    }
                    Some(Binding::Predicate { stmt }) => {
                        return self.call_predicate(stmt, args, kwargs);
                    }
                    Some(Binding::Quantifier(_)) => {
                        return Err(EvalError::Type(format!(
                            "quantifier '{}' requires an indented body",
                            name
                        )));
                    }
                    Some(Binding::ErrorConstructor) => {
                        return Err(EvalError::Type(
                            "Violation(...) can only be used as a raise constructor".to_string(),
                        ));
                    }
                    _ => {}
                }
            }
        }

        // otherwise the callee must evaluate to a bound method
        let target = match self.visit(callee)? {
            Eval::Val(v) => v,
            _ => return Ok(Eval::Unknown),
        };
        match target {
            Value::Method { target, name } => {
                let call_args = match self.eval_args(args, kwargs)? {
                    Some(call_args) => call_args,
                    None => return Ok(Eval::Unknown),
                };
                self.dispatch_method(&target, name, &call_args)
            }
            other => Err(EvalError::Type(format!(
                "value of type {} is not callable",
                other.type_name()
            ))),
        }
    }

    /// Evaluates call arguments; `None` when any argument is still
    /// unknown (functions are only called once fully determined).
    fn eval_args(
        &mut self,
        args: &[Expr],
        kwargs: &[(String, Expr)],
    ) -> Result<Option<CallArgs>, EvalError> {
        let mut call_args = CallArgs::default();
        for arg in args {
            match self.visit(arg)? {
                Eval::Val(v) => call_args.args.push(v),
                _ => return Ok(None),
            }
        }
        for (name, value) in kwargs {
            match self.visit(value)? {
                Eval::Val(v) => {
                    call_args.kwargs.insert(name.clone(), v);
                }
                _ => return Ok(None),
            }
        }
        Ok(Some(call_args))
    }

    /// Calls a predicate (parameterized rule): binds formals to actuals and
    /// searches for one satisfying assignment of the predicate body.
    fn call_predicate(
        &mut self,
        stmt: usize,
        args: &[Expr],
        kwargs: &[(String, Expr)],
    ) -> Result<Eval, EvalError> {
        let call_args = match self.eval_args(args, kwargs)? {
            Some(call_args) => call_args,
            None => return Ok(Eval::Unknown),
        };

        let decl = match self.policy.ast.statements.get(stmt) {
            Some(Stmt::Declaration(decl)) => decl,
            _ => return Err(EvalError::Type("dangling predicate declaration".to_string())),
        };
        let params = match &decl.signature {
            vigil_dsl::DeclSignature::Predicate { params, .. } => params,
            _ => return Err(EvalError::Type("constant used as predicate".to_string())),
        };

        let mut bound = VariableStore::new();
        let mut positional = call_args.args.into_iter();
        for param in params {
            let param_decl = param.decl.ok_or_else(|| {
                EvalError::Type("predicate parameter without declaration".to_string())
            })?;
            let value = match call_args.kwargs.get(&param.name) {
                Some(v) => v.clone(),
                None => positional.next().ok_or_else(|| {
                    EvalError::Type(format!(
                        "missing argument '{}' in predicate call",
                        param.name
                    ))
                })?,
            };
            bound.insert(param_decl, value);
        }

        let (satisfied, ranges) =
            enumeration::predicate_exists(self.policy, self.ctx, &decl.body, &bound)?;
        self.ranges.extend(ranges);
        Ok(Eval::Val(Value::Bool(satisfied)))
    }

    fn dispatch_method(
        &mut self,
        target: &Value,
        name: &str,
        call_args: &CallArgs,
    ) -> Result<Eval, EvalError> {
        let result = match (target, name) {
            (Value::Str(s), "strip") => Value::str(s.text.trim().to_string()),
            (Value::Str(s), "lower") => Value::str(s.text.to_lowercase()),
            (Value::Str(s), "upper") => Value::str(s.text.to_uppercase()),
            (Value::Str(s), "splitlines") => Value::list(
                s.text.lines().map(|line| Value::str(line.to_string())).collect(),
            ),
            (Value::Str(s), "split") => {
                let parts: Vec<Value> = match call_args.args.first() {
                    Some(Value::Str(sep)) => s
                        .text
                        .split(sep.text.as_str())
                        .map(|p| Value::str(p.to_string()))
                        .collect(),
                    None => s
                        .text
                        .split_whitespace()
                        .map(|p| Value::str(p.to_string()))
                        .collect(),
                    Some(other) => {
                        return Err(EvalError::Type(format!(
                            "split separator must be a string, got {}",
                            other.type_name()
                        )))
                    }
                };
                Value::list(parts)
            }
            (Value::Str(s), "join") => {
                let list = match call_args.arg(0)? {
                    Value::List(l) => l,
                    other => {
                        return Err(EvalError::Type(format!(
                            "join expects a list, got {}",
                            other.type_name()
                        )))
                    }
                };
                let mut parts = Vec::with_capacity(list.items.len());
                for item in &list.items {
                    match item.as_str() {
                        Some(text) => parts.push(text.to_string()),
                        None => {
                            return Err(EvalError::Type(
                                "join expects a list of strings".to_string(),
                            ))
                        }
                    }
                }
                Value::str(parts.join(&s.text))
            }
            (Value::Str(s), "format") => {
                let mut out = String::new();
                let mut args = call_args.args.iter();
                let mut rest = s.text.as_str();
                while let Some(idx) = rest.find("{}") {
                    out.push_str(&rest[..idx]);
                    match args.next() {
                        Some(arg) => out.push_str(&arg.to_string()),
                        None => out.push_str("{}"),
                    }
                    rest = &rest[idx + 2..];
                }
                out.push_str(rest);
                Value::str(out)
            }
            (Value::Object(o), "keys") => Value::list(
                o.entries.keys().map(|k| Value::str(k.clone())).collect(),
            ),
            (Value::Object(o), "values") => Value::list(o.entries.values().cloned().collect()),
            (Value::Object(o), "items") => Value::list(
                o.entries
                    .iter()
                    .map(|(k, v)| Value::list(vec![Value::str(k.clone()), v.clone()]))
                    .collect(),
            ),
            (Value::Object(o), "get") => {
                let key = match call_args.arg(0)? {
                    Value::Str(k) => k.text.clone(),
                    other => {
                        return Err(EvalError::Type(format!(
                            "get expects a string key, got {}",
                            other.type_name()
                        )))
                    }
                };
                match o.get(&key) {
                    Some(v) => v.clone(),
                    None => call_args.args.get(1).cloned().unwrap_or(Value::None),
                }
            }
            (Value::Chunks(event), "text") => Value::List(ListValue {
                items: self
                    .ctx
                    .trace
                    .chunk_texts(*event)
                    .into_iter()
                    .map(|(node, text)| Value::Str(StrValue::traced(text.to_string(), node)))
                    .collect(),
                origin: None,
            }),
            (Value::Chunks(event), "image") => Value::List(ListValue {
                items: self
                    .ctx
                    .trace
                    .chunk_images(*event)
                    .into_iter()
                    .map(|(node, url)| Value::Str(StrValue::traced(url.to_string(), node)))
                    .collect(),
                origin: None,
            }),
            (target, name) => {
                return Err(EvalError::Type(format!(
                    "method {} is not defined for {}",
                    name,
                    target.type_name()
                )))
            }
        };
        Ok(Eval::Val(result))
    }

    // ------------------------------------------------------------------------
    // Comprehensions and quantifiers
    // ------------------------------------------------------------------------

    fn visit_comprehension(
        &mut self,
        body: &Expr,
        var_decl: Option<DeclId>,
        iterable: &Expr,
        condition: Option<&Expr>,
    ) -> Result<Eval, EvalError> {
        let var_decl = var_decl.ok_or_else(|| {
            EvalError::Type("comprehension variable without declaration".to_string())
        })?;

        let iterable = match self.visit(iterable)? {
            Eval::Val(Value::None) => return Ok(Eval::Val(Value::list(Vec::new()))),
            Eval::Val(v) => v,
            _ => return Ok(Eval::Unknown),
        };

        let items: Vec<Value> = match iterable {
            Value::List(l) => l.items,
            Value::Chunks(event) => self
                .ctx
                .trace
                .chunk_texts(event)
                .into_iter()
                .map(|(node, text)| Value::Str(StrValue::traced(text.to_string(), node)))
                .collect(),
            other => {
                return Err(EvalError::Type(format!(
                    "cannot iterate over {}",
                    other.type_name()
                )))
            }
        };

        let saved = self.store.get(&var_decl).cloned();
        let mut results = Vec::new();
        let mut outcome = None;

        for item in items {
            self.store.insert(var_decl, item);

            if let Some(condition) = condition {
                match self.visit(condition)? {
                    Eval::Val(c) if c.truthy() => {}
                    Eval::Unknown => {
                        outcome = Some(Eval::Unknown);
                        break;
                    }
                    _ => continue,
                }
            }

            match self.visit(body)? {
                Eval::Val(v) => results.push(v),
                _ => {
                    outcome = Some(Eval::Unknown);
                    break;
                }
            }
        }

        match saved {
            Some(value) => {
                self.store.insert(var_decl, value);
            }
            None => {
                self.store.remove(&var_decl);
            }
        }

        Ok(outcome.unwrap_or(Eval::Val(Value::list(results))))
    }

    fn visit_quantifier(
        &mut self,
        call: &Expr,
        negated: bool,
        body: &[Expr],
    ) -> Result<Eval, EvalError> {
        let spec = self.quantifier_spec(call)?;

        // a quantifier body that still captures unbound outer variables
        // cannot be decided yet
        if self.has_free_captures(body) {
            return Ok(Eval::Unknown);
        }

        let result = quantifiers::eval_quantifier(
            self.policy,
            self.ctx,
            &spec,
            body,
            &*self.store,
            &mut self.ranges,
        )?;

        let result = if negated { !result } else { result };
        Ok(Eval::Val(Value::Bool(result)))
    }

    fn quantifier_spec(&mut self, call: &Expr) -> Result<QuantifierSpec, EvalError> {
        let policy = self.policy;
        let kind_of = move |decl: Option<DeclId>| -> Option<QuantifierKind> {
            match policy.globals.get(decl?) {
                Some(Binding::Quantifier(kind)) => Some(*kind),
                _ => None,
            }
        };

        match &call.kind {
            ExprKind::Ident { decl, .. } => match kind_of(*decl) {
                Some(kind) => Ok(QuantifierSpec {
                    kind,
                    min: None,
                    max: None,
                }),
                None => Err(EvalError::Type(
                    "expected a quantifier before an indented body".to_string(),
                )),
            },
            ExprKind::Call { callee, kwargs, .. } => {
                let kind = match &callee.kind {
                    ExprKind::Ident { decl, .. } => kind_of(*decl),
                    _ => None,
                }
                .ok_or_else(|| {
                    EvalError::Type("expected a quantifier before an indented body".to_string())
                })?;

                let mut min = None;
                let mut max = None;
                for (name, value) in kwargs {
                    let bound = match self.visit(value)? {
                        Eval::Val(Value::Int(n)) => n,
                        _ => {
                            return Err(EvalError::Type(
                                "quantifier bounds must be integers".to_string(),
                            ))
                        }
                    };
                    match name.as_str() {
                        "min" => min = Some(bound),
                        "max" => max = Some(bound),
                        other => {
                            return Err(EvalError::Type(format!(
                                "unknown quantifier argument '{}'",
                                other
                            )))
                        }
                    }
                }
                Ok(QuantifierSpec { kind, min, max })
            }
            _ => Err(EvalError::Type(
                "expected a quantifier before an indented body".to_string(),
            )),
        }
    }

    /// True when the body uses a rule-local variable that is neither
    /// declared inside the body nor bound in the current store.
    fn has_free_captures(&self, body: &[Expr]) -> bool {
        let mut declared: HashSet<DeclId> = HashSet::new();
        let mut used: HashSet<DeclId> = HashSet::new();

        for expr in body {
            expr.walk(&mut |node| match &node.kind {
                ExprKind::TypedIdent { decl: Some(id), .. } => {
                    declared.insert(*id);
                }
                ExprKind::ListComprehension {
                    var_decl: Some(id), ..
                } => {
                    declared.insert(*id);
                }
                ExprKind::Binary { op, left, .. } if *op == BinaryOp::Assign => {
                    if let ExprKind::Ident { decl: Some(id), .. } = &left.kind {
                        declared.insert(*id);
                    }
                }
                ExprKind::Ident { decl: Some(id), .. } => {
                    used.insert(*id);
                }
                _ => {}
            });
        }

        used.iter().any(|id| {
            !declared.contains(id)
                && !self.store.contains_key(id)
                && !self.policy.globals.contains(*id)
        })
    }
}

// ============================================================================
// VALUE OPERATIONS
// ============================================================================

fn unwrap_val(eval: Eval) -> Result<Value, EvalError> {
    match eval {
        Eval::Val(v) => Ok(v),
        _ => Err(EvalError::Type("expected a concrete value".to_string())),
    }
}

fn index_sequence(len: usize, index: i64) -> Option<usize> {
    if index >= 0 {
        let index = index as usize;
        (index < len).then_some(index)
    } else {
        len.checked_sub(index.unsigned_abs() as usize)
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Result<bool, EvalError> {
    use std::cmp::Ordering;
    let ordering = match (l, r) {
        (Value::Str(a), Value::Str(b)) => a.text.cmp(&b.text),
        _ => match (l.as_number(), r.as_number()) {
            (Some(a), Some(b)) => a
                .partial_cmp(&b)
                .ok_or_else(|| EvalError::Type("cannot compare NaN".to_string()))?,
            _ => {
                return Err(EvalError::Type(format!(
                    "cannot compare {} with {}",
                    l.type_name(),
                    r.type_name()
                )))
            }
        },
    };
    Ok(match op {
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::Le => ordering != Ordering::Greater,
        BinaryOp::Ge => ordering != Ordering::Less,
        _ => unreachable!(),
    })
}

fn contains_only(l: &Value, r: &Value) -> Result<bool, EvalError> {
    let elements = match r {
        Value::List(items) => items.items.clone(),
        other => vec![other.clone()],
    };
    for el in &elements {
        let contained = match (l, el) {
            (Value::List(items), _) => items.items.contains(el),
            (Value::Str(s), Value::Str(sub)) => s.text.contains(&sub.text),
            _ => {
                return Err(EvalError::Type(format!(
                    "'contains_only' is not supported for {}",
                    l.type_name()
                )))
            }
        };
        if !contained {
            return Ok(false);
        }
    }
    Ok(true)
}

fn arith_add(l: &Value, r: &Value) -> Result<Value, EvalError> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
        (Value::Str(a), Value::Str(b)) => Ok(Value::str(format!("{}{}", a.text, b.text))),
        (Value::List(a), Value::List(b)) => {
            let mut items = a.items.clone();
            items.extend(b.items.clone());
            Ok(Value::list(items))
        }
        _ => match (l.as_number(), r.as_number()) {
            (Some(a), Some(b)) => Ok(Value::Float(a + b)),
            _ => Err(EvalError::Type(format!(
                "cannot add {} and {}",
                l.type_name(),
                r.type_name()
            ))),
        },
    }
}

fn numeric_op(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, EvalError> {
    if let (Value::Int(a), Value::Int(b)) = (l, r) {
        return match op {
            BinaryOp::Sub => Ok(Value::Int(a - b)),
            BinaryOp::Mul => Ok(Value::Int(a * b)),
            BinaryOp::Mod => {
                if *b == 0 {
                    Err(EvalError::DivisionByZero)
                } else {
                    Ok(Value::Int(a.rem_euclid(*b)))
                }
            }
            BinaryOp::Div => {
                if *b == 0 {
                    Err(EvalError::DivisionByZero)
                } else {
                    Ok(Value::Float(*a as f64 / *b as f64))
                }
            }
            BinaryOp::Pow => {
                if *b >= 0 {
                    match u32::try_from(*b).ok().and_then(|e| a.checked_pow(e)) {
                        Some(n) => Ok(Value::Int(n)),
                        None => Ok(Value::Float((*a as f64).powf(*b as f64))),
                    }
                } else {
                    Ok(Value::Float((*a as f64).powi(*b as i32)))
                }
            }
            _ => unreachable!(),
        };
    }

    match (l.as_number(), r.as_number()) {
        (Some(a), Some(b)) => match op {
            BinaryOp::Sub => Ok(Value::Float(a - b)),
            BinaryOp::Mul => Ok(Value::Float(a * b)),
            BinaryOp::Div => {
                if b == 0.0 {
                    Err(EvalError::DivisionByZero)
                } else {
                    Ok(Value::Float(a / b))
                }
            }
            BinaryOp::Mod => {
                if b == 0.0 {
                    Err(EvalError::DivisionByZero)
                } else {
                    Ok(Value::Float(a.rem_euclid(b)))
                }
            }
            BinaryOp::Pow => Ok(Value::Float(a.powf(b))),
            _ => unreachable!(),
        },
        _ => Err(EvalError::Type(format!(
            "arithmetic is not defined between {} and {}",
            l.type_name(),
            r.type_name()
        ))),
    }
}
