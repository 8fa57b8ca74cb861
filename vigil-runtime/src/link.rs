//! Linking: resolving declarations to runtime bindings.
//!
//! After scope resolution every identifier points at a declaration; the
//! linker maps each declaration to its runtime meaning. Built-in names come
//! from the standard library, imported names are resolved through a
//! `SymbolTable` of registered host functions. The resulting global
//! environment is frozen for the lifetime of the rule set.

use crate::detectors::DetectorRegistry;
use crate::quantifiers::QuantifierKind;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use vigil_core::{EvalError, Range, Trace, Value};
use vigil_dsl::{DeclId, DeclKind, ParsedPolicy, PolicyAst, PolicyIssue, ScopeTable, SourceCode};

// ============================================================================
// HOST FUNCTIONS
// ============================================================================

/// Positional and keyword arguments of a host-function call.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl CallArgs {
    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: BTreeMap::new(),
        }
    }

    pub fn arg(&self, index: usize) -> Result<&Value, EvalError> {
        self.args
            .get(index)
            .ok_or_else(|| EvalError::Type(format!("missing argument {}", index)))
    }
}

/// What a host function may touch during a call: the trace under analysis,
/// the interpreter's range list (for `mark`-style side effects), and the
/// detector registry.
pub struct CallScope<'a> {
    pub trace: &'a Trace,
    pub ranges: &'a mut Vec<Range>,
    pub detectors: &'a DetectorRegistry,
}

impl CallScope<'_> {
    /// Records a relevant range on a trace-derived value. Character ranges
    /// on values without trace identity are silently ignored.
    pub fn mark(&mut self, value: &Value, start: Option<usize>, end: Option<usize>) {
        if let Some(origin) = value.origin() {
            self.ranges.push(vigil_core::Range {
                object_id: Some(origin),
                start,
                end,
                json_path: None,
            });
        }
    }
}

pub type HostFnImpl =
    dyn Fn(&mut CallScope<'_>, &CallArgs) -> Result<Value, EvalError> + Send + Sync;

/// A callable host function (built-in or registered by the embedder).
#[derive(Clone)]
pub struct HostFn {
    pub name: String,
    /// Whether results may be memoized by the predicate cache.
    pub cached: bool,
    /// Optional predicates swallow backend failures and evaluate to
    /// `None`; everything else surfaces failures as evaluation errors.
    pub optional: bool,
    pub func: Arc<HostFnImpl>,
}

impl HostFn {
    pub fn new(
        name: &str,
        func: impl Fn(&mut CallScope<'_>, &CallArgs) -> Result<Value, EvalError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            cached: false,
            optional: false,
            func: Arc::new(func),
        }
    }

    pub fn cached(mut self) -> Self {
        self.cached = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Identity of this function for cache keying.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.func) as *const () as usize
    }
}

impl std::fmt::Debug for HostFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<host fn {}{}>", self.name, if self.cached { " (cached)" } else { "" })
    }
}

// ============================================================================
// BINDINGS
// ============================================================================

/// Runtime meaning of a declaration.
#[derive(Debug, Clone)]
pub enum Binding {
    /// A callable host function.
    Host(HostFn),
    /// A trace entity type name (`Message`, `ToolCall`, ...).
    TypeName(String),
    /// A quantifier constructor (`forall`, `count`).
    Quantifier(QuantifierKind),
    /// A policy-level constant; evaluated on access.
    Constant { stmt: usize },
    /// A policy-level predicate; evaluated by opening a nested enumeration.
    Predicate { stmt: usize },
    /// The reserved `input` identifier (policy parameters).
    Params,
    /// `Violation` / `PolicyViolation`; only valid as a raise constructor.
    ErrorConstructor,
    /// A bare module import; unusable as a value.
    Module(String),
}

// ============================================================================
// SYMBOL TABLE
// ============================================================================

/// Registry of host symbols importable from policies.
///
/// Unlike the unrestricted-module mode of dynamic hosts, only explicitly
/// registered symbols resolve; an unresolved import is a loading error.
#[derive(Default, Clone)]
pub struct SymbolTable {
    modules: HashMap<String, HashMap<String, Binding>>,
}

impl SymbolTable {
    /// The standard library: detector predicates and re-exports of the
    /// built-in names under the `vigil` module path.
    pub fn standard() -> Self {
        let mut table = Self::default();
        for name in vigil_dsl::BUILTINS {
            if let Some(binding) = crate::builtins::builtin_binding(name) {
                table.register("vigil", name, binding);
            }
        }
        for (name, host) in crate::detectors::detector_functions() {
            table.register("vigil.detectors", name, Binding::Host(host));
        }
        table
    }

    pub fn register(&mut self, module: &str, name: &str, binding: Binding) {
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(name.to_string(), binding);
    }

    pub fn resolve(&self, module: &str, symbol: Option<&str>) -> Option<Binding> {
        match symbol {
            Some(symbol) => self.modules.get(module)?.get(symbol).cloned(),
            None => Some(Binding::Module(module.to_string())),
        }
    }
}

// ============================================================================
// LINKED POLICY
// ============================================================================

/// A policy after parsing, scoping and linking: the frozen AST, the scope
/// table, the global environment, and the source handle for diagnostics.
pub struct LinkedPolicy {
    pub ast: PolicyAst,
    pub scopes: ScopeTable,
    pub globals: GlobalEnv,
    pub source: SourceCode,
}

/// Frozen map from declaration to runtime binding.
#[derive(Debug, Default)]
pub struct GlobalEnv {
    bindings: HashMap<DeclId, Binding>,
}

impl GlobalEnv {
    pub fn get(&self, decl: DeclId) -> Option<&Binding> {
        self.bindings.get(&decl)
    }

    pub fn contains(&self, decl: DeclId) -> bool {
        self.bindings.contains_key(&decl)
    }
}

/// Links a parsed policy against a symbol table. Unresolvable imports are
/// reported as loading issues.
pub fn link(parsed: ParsedPolicy, symbol_table: &SymbolTable) -> Result<LinkedPolicy, Vec<PolicyIssue>> {
    let mut issues = parsed.issues;
    let mut bindings = HashMap::new();

    for (idx, info) in parsed.scopes.decls.iter().enumerate() {
        let id = DeclId(idx as u32);
        match &info.kind {
            DeclKind::Builtin => {
                if let Some(binding) = crate::builtins::builtin_binding(&info.name) {
                    bindings.insert(id, binding);
                }
            }
            DeclKind::External { module, symbol } => {
                match symbol_table.resolve(module, symbol.as_deref()) {
                    Some(binding) => {
                        bindings.insert(id, binding);
                    }
                    None => issues.push(PolicyIssue {
                        message: match symbol {
                            Some(symbol) => {
                                format!("cannot import name '{}' from '{}'", symbol, module)
                            }
                            None => format!("Module '{}' could not be resolved", module),
                        },
                        line: 1,
                        column: 1,
                        path: parsed.source.path.clone(),
                    }),
                }
            }
            DeclKind::Constant { stmt } => {
                bindings.insert(id, Binding::Constant { stmt: *stmt });
            }
            DeclKind::Predicate { stmt } => {
                bindings.insert(id, Binding::Predicate { stmt: *stmt });
            }
            DeclKind::Parameter { .. }
            | DeclKind::RuleLocal { .. }
            | DeclKind::ComprehensionVar => {}
        }
    }

    if !issues.is_empty() {
        return Err(issues);
    }

    Ok(LinkedPolicy {
        ast: parsed.ast,
        scopes: parsed.scopes,
        globals: GlobalEnv { bindings },
        source: parsed.source,
    })
}
