//! Abstract Syntax Tree types
//!
//! The AST is a plain sum type; evaluation and analysis passes match on the
//! tags rather than dispatching by name. Identifier nodes carry the
//! declaration they resolve to once scope resolution has run.

use crate::scope::DeclId;
use serde::{Deserialize, Serialize};

// ============================================================================
// LOCATIONS
// ============================================================================

/// Source location of a node, in original (pre-rewrite) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loc {
    pub line: usize,
    pub column: usize,
}

impl Default for Loc {
    fn default() -> Self {
        Self { line: 1, column: 1 }
    }
}

// ============================================================================
// POLICY AND STATEMENTS
// ============================================================================

/// The root AST node for a policy file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PolicyAst {
    pub statements: Vec<Stmt>,
}

/// A top-level statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Import(ImportStmt),
    Declaration(Declaration),
    Raise(RaiseRule),
}

/// `import a.b` or `from a.b import x, y as z`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportStmt {
    pub module: String,
    /// Empty for a plain `import`.
    pub names: Vec<ImportSpec>,
    pub alias: Option<String>,
    pub loc: Loc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSpec {
    pub name: String,
    pub alias: Option<String>,
}

/// A constant (`NAME := expr`) or predicate
/// (`name(a: T) := body` / indented form) declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    pub signature: DeclSignature,
    pub body: Vec<Expr>,
    pub loc: Loc,
}

impl Declaration {
    pub fn name(&self) -> &str {
        match &self.signature {
            DeclSignature::Constant(name) => name,
            DeclSignature::Predicate { name, .. } => name,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.signature, DeclSignature::Constant(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeclSignature {
    Constant(String),
    Predicate { name: String, params: Vec<Param> },
}

/// A formal predicate parameter `name: Type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub type_ref: String,
    pub loc: Loc,
    /// Filled by scope resolution.
    pub decl: Option<DeclId>,
}

/// A `raise <constructor> if: <body>` rule. The body is a conjunction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiseRule {
    pub constructor: Expr,
    pub body: Vec<Expr>,
    pub loc: Loc,
}

// ============================================================================
// EXPRESSIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub loc: Loc,
}

impl Expr {
    pub fn new(kind: ExprKind, loc: Loc) -> Self {
        Self { kind, loc }
    }

    /// Pre-order traversal over this expression and all sub-expressions.
    pub fn walk(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match &self.kind {
            ExprKind::Binary { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            ExprKind::Unary { expr, .. } => expr.walk(f),
            ExprKind::Member { object, .. } => object.walk(f),
            ExprKind::Key { object, key } => {
                object.walk(f);
                key.walk(f);
            }
            ExprKind::Call {
                callee,
                args,
                kwargs,
            } => {
                callee.walk(f);
                for arg in args {
                    arg.walk(f);
                }
                for (_, value) in kwargs {
                    value.walk(f);
                }
            }
            ExprKind::ObjectLit { entries } => {
                for (_, value) in entries {
                    value.walk(f);
                }
            }
            ExprKind::ListLit { items } => {
                for item in items {
                    item.walk(f);
                }
            }
            ExprKind::ListComprehension {
                expr,
                iterable,
                condition,
                ..
            } => {
                expr.walk(f);
                iterable.walk(f);
                if let Some(condition) = condition {
                    condition.walk(f);
                }
            }
            ExprKind::Ternary {
                then,
                cond,
                otherwise,
            } => {
                then.walk(f);
                cond.walk(f);
                otherwise.walk(f);
            }
            ExprKind::SemanticPattern { args, .. } => {
                for arg in args {
                    arg.walk(f);
                }
            }
            ExprKind::Quantifier { call, body, .. } => {
                call.walk(f);
                for expr in body {
                    expr.walk(f);
                }
            }
            ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Str { .. }
            | ExprKind::Bool(_)
            | ExprKind::NoneLit
            | ExprKind::Ident { .. }
            | ExprKind::TypedIdent { .. }
            | ExprKind::ToolRef { .. }
            | ExprKind::ValueRef { .. }
            | ExprKind::Wildcard => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    Str {
        value: String,
        /// `r` or `f` prefix, if any.
        modifier: Option<char>,
    },
    Bool(bool),
    NoneLit,
    Ident {
        name: String,
        /// Filled by scope resolution.
        decl: Option<DeclId>,
    },
    /// A free-variable declaration `(name: Type)`.
    TypedIdent {
        name: String,
        type_ref: String,
        decl: Option<DeclId>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Member {
        object: Box<Expr>,
        member: String,
    },
    Key {
        object: Box<Expr>,
        key: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    ObjectLit {
        entries: Vec<(String, Expr)>,
    },
    ListLit {
        items: Vec<Expr>,
    },
    ListComprehension {
        expr: Box<Expr>,
        var: String,
        var_decl: Option<DeclId>,
        iterable: Box<Expr>,
        condition: Option<Box<Expr>>,
    },
    /// `a if c else b`
    Ternary {
        then: Box<Expr>,
        cond: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// `tool:name`
    ToolRef {
        name: String,
    },
    /// `tool:name({...}, *)` after the post-parse rewrite.
    SemanticPattern {
        tool: String,
        args: Vec<Expr>,
    },
    /// `<EMAIL_ADDRESS>` and friends; valid only inside semantic patterns.
    ValueRef {
        value_type: String,
    },
    /// `*`; valid only inside semantic patterns.
    Wildcard,
    /// An indented quantifier block, e.g. `forall:` or `count(min=1):`.
    Quantifier {
        call: Box<Expr>,
        negated: bool,
        body: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Assign,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Is,
    In,
    ContainsOnly,
    /// `->`: dataflow reachability.
    FlowsTo,
    /// `~>`: immediate successor.
    Successor,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
}

// ============================================================================
// POST-PARSE TRANSFORM
// ============================================================================

/// Rewrites calls whose callee is a tool reference into semantic patterns:
/// `tool:send_mail({to: "..."})` parses as a call and becomes a
/// `SemanticPattern` node here.
pub fn rewrite_tool_call_patterns(ast: &mut PolicyAst) {
    for stmt in &mut ast.statements {
        match stmt {
            Stmt::Raise(rule) => {
                rewrite_expr(&mut rule.constructor);
                for expr in &mut rule.body {
                    rewrite_expr(expr);
                }
            }
            Stmt::Declaration(decl) => {
                for expr in &mut decl.body {
                    rewrite_expr(expr);
                }
            }
            Stmt::Import(_) => {}
        }
    }
}

fn rewrite_expr(expr: &mut Expr) {
    if let ExprKind::Call { callee, args, kwargs } = &mut expr.kind {
        if let ExprKind::ToolRef { name } = &callee.kind {
            if kwargs.is_empty() {
                let mut pattern_args = std::mem::take(args);
                for arg in &mut pattern_args {
                    rewrite_expr(arg);
                }
                expr.kind = ExprKind::SemanticPattern {
                    tool: name.clone(),
                    args: pattern_args,
                };
                return;
            }
        }
    }

    match &mut expr.kind {
        ExprKind::Binary { left, right, .. } => {
            rewrite_expr(left);
            rewrite_expr(right);
        }
        ExprKind::Unary { expr, .. } => rewrite_expr(expr),
        ExprKind::Member { object, .. } => rewrite_expr(object),
        ExprKind::Key { object, key } => {
            rewrite_expr(object);
            rewrite_expr(key);
        }
        ExprKind::Call {
            callee,
            args,
            kwargs,
        } => {
            rewrite_expr(callee);
            for arg in args {
                rewrite_expr(arg);
            }
            for (_, value) in kwargs {
                rewrite_expr(value);
            }
        }
        ExprKind::ObjectLit { entries } => {
            for (_, value) in entries {
                rewrite_expr(value);
            }
        }
        ExprKind::ListLit { items } => {
            for item in items {
                rewrite_expr(item);
            }
        }
        ExprKind::ListComprehension {
            expr: body,
            iterable,
            condition,
            ..
        } => {
            rewrite_expr(body);
            rewrite_expr(iterable);
            if let Some(condition) = condition {
                rewrite_expr(condition);
            }
        }
        ExprKind::Ternary {
            then,
            cond,
            otherwise,
        } => {
            rewrite_expr(then);
            rewrite_expr(cond);
            rewrite_expr(otherwise);
        }
        ExprKind::SemanticPattern { args, .. } => {
            for arg in args {
                rewrite_expr(arg);
            }
        }
        ExprKind::Quantifier { call, body, .. } => {
            rewrite_expr(call);
            for expr in body {
                rewrite_expr(expr);
            }
        }
        _ => {}
    }
}
