//! Scope resolution and policy validation.
//!
//! Two passes over the AST: import scoping installs imported names into the
//! module scope; declaration collection walks each lexical scope (policy
//! root, rule body, predicate body, comprehension) and registers the
//! variables it introduces. Identifier resolution then binds every
//! identifier to its declaration, innermost scope first. A policy with
//! unresolved identifiers, duplicate declarations, or wildcards / value
//! references outside semantic patterns is rejected.

use crate::parser::ast::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// DECLARATIONS
// ============================================================================

/// Index of a declaration in the policy's `ScopeTable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeclId(pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeclKind {
    /// A name from the built-in library (types, functions, quantifiers).
    Builtin,
    /// A name imported from an external module.
    External {
        module: String,
        symbol: Option<String>,
    },
    /// A policy-level constant; `stmt` indexes the policy statements.
    Constant { stmt: usize },
    /// A policy-level predicate; `stmt` indexes the policy statements.
    Predicate { stmt: usize },
    /// A formal predicate parameter.
    Parameter { index: usize },
    /// A rule-body variable from `(v: T)`, `(v: T) in E` or `v := E`.
    RuleLocal { type_ref: Option<String> },
    /// A list-comprehension iteration variable.
    ComprehensionVar,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclInfo {
    pub name: String,
    pub kind: DeclKind,
}

/// All declarations of a policy, addressed by `DeclId`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeTable {
    pub decls: Vec<DeclInfo>,
}

impl ScopeTable {
    pub fn push(&mut self, info: DeclInfo) -> DeclId {
        let id = DeclId(self.decls.len() as u32);
        self.decls.push(info);
        id
    }

    pub fn info(&self, id: DeclId) -> &DeclInfo {
        &self.decls[id.0 as usize]
    }
}

/// Names available without any import.
pub const BUILTINS: &[&str] = &[
    // trace entity types
    "Message",
    "ToolCall",
    "ToolOutput",
    "Function",
    "Input",
    "TextChunk",
    "Image",
    // error constructors
    "Violation",
    "PolicyViolation",
    // functions
    "any",
    "empty",
    "match",
    "find",
    "len",
    "min",
    "max",
    "sum",
    "print",
    "json_loads",
    "text",
    "image",
    // quantifiers
    "forall",
    "count",
    // policy parameters
    "input",
];

// ============================================================================
// ISSUES
// ============================================================================

/// A single loading problem, localized to the policy source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyIssue {
    pub message: String,
    pub line: usize,
    pub column: usize,
    pub path: Option<String>,
}

impl fmt::Display for PolicyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(
                f,
                "{}:{}:{}: {}",
                path, self.line, self.column, self.message
            ),
            None => write!(f, "line {}, column {}: {}", self.line, self.column, self.message),
        }
    }
}

// ============================================================================
// RESOLUTION
// ============================================================================

/// Resolves all identifiers of the policy in place and returns the scope
/// table plus any issues found. The caller rejects the policy when issues
/// are present.
pub fn resolve(ast: &mut PolicyAst, value_types: &[&str]) -> (ScopeTable, Vec<PolicyIssue>) {
    let mut resolver = Resolver {
        table: ScopeTable::default(),
        issues: Vec::new(),
        env: Vec::new(),
        value_types,
    };
    resolver.run(ast);
    (resolver.table, resolver.issues)
}

struct Resolver<'a> {
    table: ScopeTable,
    issues: Vec<PolicyIssue>,
    /// Scope stack, innermost last.
    env: Vec<HashMap<String, DeclId>>,
    value_types: &'a [&'a str],
}

impl<'a> Resolver<'a> {
    fn run(&mut self, ast: &mut PolicyAst) {
        // built-in scope
        let mut builtins = HashMap::new();
        for name in BUILTINS {
            let id = self.table.push(DeclInfo {
                name: name.to_string(),
                kind: DeclKind::Builtin,
            });
            builtins.insert(name.to_string(), id);
        }
        self.env.push(builtins);

        // module scope: imported names
        let mut module_scope = HashMap::new();
        for stmt in &ast.statements {
            if let Stmt::Import(import) = stmt {
                self.install_import(import, &mut module_scope);
            }
        }
        self.env.push(module_scope);

        // policy scope: constants and predicates
        let mut policy_scope = HashMap::new();
        for (idx, stmt) in ast.statements.iter().enumerate() {
            if let Stmt::Declaration(decl) = stmt {
                let kind = if decl.is_constant() {
                    DeclKind::Constant { stmt: idx }
                } else {
                    DeclKind::Predicate { stmt: idx }
                };
                let name = decl.name().to_string();
                if policy_scope.contains_key(&name) {
                    self.issue(format!("Variable {} already declared", name), decl.loc);
                    continue;
                }
                let id = self.table.push(DeclInfo {
                    name: name.clone(),
                    kind,
                });
                policy_scope.insert(name, id);
            }
        }
        self.env.push(policy_scope);

        // per-statement scopes
        for stmt in &mut ast.statements {
            match stmt {
                Stmt::Raise(rule) => {
                    let mut rule_scope = HashMap::new();
                    Self::collect_locals(
                        &mut self.table,
                        &mut self.issues,
                        &mut rule.body,
                        &mut rule_scope,
                    );
                    self.env.push(rule_scope);
                    for expr in &mut rule.body {
                        self.resolve_expr(expr, false);
                    }
                    self.resolve_expr(&mut rule.constructor, false);
                    self.env.pop();
                }
                Stmt::Declaration(decl) => {
                    let mut param_scope = HashMap::new();
                    if let DeclSignature::Predicate { params, .. } = &mut decl.signature {
                        for (index, param) in params.iter_mut().enumerate() {
                            let id = self.table.push(DeclInfo {
                                name: param.name.clone(),
                                kind: DeclKind::Parameter { index },
                            });
                            param.decl = Some(id);
                            param_scope.insert(param.name.clone(), id);
                        }
                    }
                    self.env.push(param_scope);

                    let mut local_scope = HashMap::new();
                    Self::collect_locals(
                        &mut self.table,
                        &mut self.issues,
                        &mut decl.body,
                        &mut local_scope,
                    );
                    self.env.push(local_scope);
                    for expr in &mut decl.body {
                        self.resolve_expr(expr, false);
                    }
                    self.env.pop();
                    self.env.pop();
                }
                Stmt::Import(_) => {}
            }
        }
    }

    fn install_import(&mut self, import: &ImportStmt, scope: &mut HashMap<String, DeclId>) {
        if import.names.is_empty() {
            let bound = import.alias.clone().unwrap_or_else(|| import.module.clone());
            let id = self.table.push(DeclInfo {
                name: bound.clone(),
                kind: DeclKind::External {
                    module: import.module.clone(),
                    symbol: None,
                },
            });
            scope.insert(bound, id);
            return;
        }
        for spec in &import.names {
            let bound = spec.alias.clone().unwrap_or_else(|| spec.name.clone());
            let id = self.table.push(DeclInfo {
                name: bound.clone(),
                kind: DeclKind::External {
                    module: import.module.clone(),
                    symbol: Some(spec.name.clone()),
                },
            });
            scope.insert(bound, id);
        }
    }

    /// Collects the variables a rule or predicate body declares: typed
    /// identifiers `(v: T)` (also in `(v: T) in E` form) and `v := E`
    /// bindings. Recurses into quantifier bodies; those share the rule's
    /// scope.
    fn collect_locals(
        table: &mut ScopeTable,
        issues: &mut Vec<PolicyIssue>,
        body: &mut [Expr],
        scope: &mut HashMap<String, DeclId>,
    ) {
        for expr in body {
            Self::collect_expr(table, issues, expr, scope);
        }
    }

    fn collect_expr(
        table: &mut ScopeTable,
        issues: &mut Vec<PolicyIssue>,
        expr: &mut Expr,
        scope: &mut HashMap<String, DeclId>,
    ) {
        let loc = expr.loc;
        match &mut expr.kind {
            ExprKind::TypedIdent { name, type_ref, decl } => {
                if scope.contains_key(name.as_str()) {
                    issues.push(PolicyIssue {
                        message: format!("Variable {} already declared", name),
                        line: loc.line,
                        column: loc.column,
                        path: None,
                    });
                    *decl = scope.get(name.as_str()).copied();
                    return;
                }
                let id = table.push(DeclInfo {
                    name: name.clone(),
                    kind: DeclKind::RuleLocal {
                        type_ref: Some(type_ref.clone()),
                    },
                });
                *decl = Some(id);
                scope.insert(name.clone(), id);
            }
            ExprKind::Binary { op, left, right } => {
                if *op == BinaryOp::Assign {
                    if let ExprKind::Ident { name, .. } = &left.kind {
                        if !scope.contains_key(name.as_str()) {
                            let id = table.push(DeclInfo {
                                name: name.clone(),
                                kind: DeclKind::RuleLocal { type_ref: None },
                            });
                            scope.insert(name.clone(), id);
                        } else {
                            issues.push(PolicyIssue {
                                message: format!("Variable {} already declared", name),
                                line: loc.line,
                                column: loc.column,
                                path: None,
                            });
                        }
                    }
                    Self::collect_expr(table, issues, right, scope);
                    return;
                }
                Self::collect_expr(table, issues, left, scope);
                Self::collect_expr(table, issues, right, scope);
            }
            ExprKind::Unary { expr, .. } => Self::collect_expr(table, issues, expr, scope),
            ExprKind::Member { object, .. } => Self::collect_expr(table, issues, object, scope),
            ExprKind::Key { object, key } => {
                Self::collect_expr(table, issues, object, scope);
                Self::collect_expr(table, issues, key, scope);
            }
            ExprKind::Call { callee, args, kwargs } => {
                Self::collect_expr(table, issues, callee, scope);
                for arg in args {
                    Self::collect_expr(table, issues, arg, scope);
                }
                for (_, value) in kwargs {
                    Self::collect_expr(table, issues, value, scope);
                }
            }
            ExprKind::ObjectLit { entries } => {
                for (_, value) in entries {
                    Self::collect_expr(table, issues, value, scope);
                }
            }
            ExprKind::ListLit { items } => {
                for item in items {
                    Self::collect_expr(table, issues, item, scope);
                }
            }
            ExprKind::ListComprehension { iterable, .. } => {
                // the iteration variable gets its own scope at resolution
                Self::collect_expr(table, issues, iterable, scope);
            }
            ExprKind::Ternary { then, cond, otherwise } => {
                Self::collect_expr(table, issues, then, scope);
                Self::collect_expr(table, issues, cond, scope);
                Self::collect_expr(table, issues, otherwise, scope);
            }
            ExprKind::Quantifier { body, .. } => {
                for expr in body {
                    Self::collect_expr(table, issues, expr, scope);
                }
            }
            ExprKind::SemanticPattern { args, .. } => {
                for arg in args {
                    Self::collect_expr(table, issues, arg, scope);
                }
            }
            _ => {}
        }
    }

    fn resolve_expr(&mut self, expr: &mut Expr, in_pattern: bool) {
        let loc = expr.loc;
        match &mut expr.kind {
            ExprKind::Ident { name, decl } => {
                match self.lookup(name) {
                    Some(id) => *decl = Some(id),
                    None => {
                        self.issue(format!("Failed to resolve identifier {}", name), loc)
                    }
                }
            }
            ExprKind::TypedIdent { type_ref, .. } => {
                if self.lookup(type_ref).is_none() {
                    self.issue(format!("Failed to resolve type {}", type_ref), loc);
                }
            }
            ExprKind::Binary { left, right, .. } => {
                self.resolve_expr(left, in_pattern);
                self.resolve_expr(right, in_pattern);
            }
            ExprKind::Unary { expr, .. } => self.resolve_expr(expr, in_pattern),
            ExprKind::Member { object, .. } => self.resolve_expr(object, in_pattern),
            ExprKind::Key { object, key } => {
                self.resolve_expr(object, in_pattern);
                self.resolve_expr(key, in_pattern);
            }
            ExprKind::Call { callee, args, kwargs } => {
                self.resolve_expr(callee, in_pattern);
                for arg in args {
                    self.resolve_expr(arg, in_pattern);
                }
                for (_, value) in kwargs {
                    self.resolve_expr(value, in_pattern);
                }
            }
            ExprKind::ObjectLit { entries } => {
                for (_, value) in entries {
                    self.resolve_expr(value, in_pattern);
                }
            }
            ExprKind::ListLit { items } => {
                for item in items {
                    self.resolve_expr(item, in_pattern);
                }
            }
            ExprKind::ListComprehension {
                expr: body,
                var,
                var_decl,
                iterable,
                condition,
            } => {
                self.resolve_expr(iterable, in_pattern);
                let id = self.table.push(DeclInfo {
                    name: var.clone(),
                    kind: DeclKind::ComprehensionVar,
                });
                *var_decl = Some(id);
                let mut comp_scope = HashMap::new();
                comp_scope.insert(var.clone(), id);
                self.env.push(comp_scope);
                self.resolve_expr(body, in_pattern);
                if let Some(condition) = condition {
                    self.resolve_expr(condition, in_pattern);
                }
                self.env.pop();
            }
            ExprKind::Ternary { then, cond, otherwise } => {
                self.resolve_expr(then, in_pattern);
                self.resolve_expr(cond, in_pattern);
                self.resolve_expr(otherwise, in_pattern);
            }
            ExprKind::SemanticPattern { args, .. } => {
                for arg in args {
                    self.resolve_expr(arg, true);
                }
            }
            ExprKind::ValueRef { value_type } => {
                if !in_pattern {
                    self.issue(
                        "You cannot use value references outside of semantic patterns (e.g. tool:abc(<VALUE>, 12))"
                            .to_string(),
                        loc,
                    );
                } else if !self.value_types.contains(&value_type.as_str()) {
                    self.issue(
                        format!(
                            "Unsupported value type: {}. Available types: {}",
                            value_type,
                            self.value_types.join(" ")
                        ),
                        loc,
                    );
                }
            }
            ExprKind::Wildcard => {
                if !in_pattern {
                    self.issue(
                        "You cannot use wildcards outside of semantic patterns (e.g. tool:abc(*, 12))"
                            .to_string(),
                        loc,
                    );
                }
            }
            ExprKind::Quantifier { call, body, .. } => {
                self.resolve_expr(call, in_pattern);
                for expr in body {
                    self.resolve_expr(expr, in_pattern);
                }
            }
            ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Str { .. }
            | ExprKind::Bool(_)
            | ExprKind::NoneLit
            | ExprKind::ToolRef { .. } => {}
        }
    }

    fn lookup(&self, name: &str) -> Option<DeclId> {
        for scope in self.env.iter().rev() {
            if let Some(id) = scope.get(name) {
                return Some(*id);
            }
        }
        None
    }

    fn issue(&mut self, message: String, loc: Loc) {
        self.issues.push(PolicyIssue {
            message,
            line: loc.line,
            column: loc.column,
            path: None,
        });
    }
}
