//! Predicate cache.
//!
//! Memoizes expensive host-predicate calls by argument identity so that a
//! detector runs at most once per distinct input within (and, for cached
//! rule sets, across) analyses. Only functions marked as cacheable take
//! part; everything else is called through directly. Entries are inserted
//! once per key and never mutated.

use crate::link::{CallArgs, CallScope, HostFn};
use std::cell::RefCell;
use std::collections::HashMap;
use vigil_core::{EvalError, Trace, Value};

/// Canonical form of one call argument.
///
/// Primitives are keyed by value, lists and objects structurally, trace
/// entities by their position in the trace; anything else falls back to an
/// opaque key that never matches a prior call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArgKey {
    None,
    Bool(bool),
    Int(i64),
    /// Bit pattern, so `NaN` keys consistently.
    Float(u64),
    Str(String),
    List(Vec<ArgKey>),
    Dict(Vec<(String, ArgKey)>),
    Event(usize),
    InlineCall(usize, usize),
    Chunks(usize),
    Node(u32),
    Opaque(u64),
}

fn arg_key(trace: &Trace, value: &Value, fallback: &mut u64) -> ArgKey {
    match value {
        Value::None => ArgKey::None,
        Value::Bool(b) => ArgKey::Bool(*b),
        Value::Int(n) => ArgKey::Int(*n),
        Value::Float(n) => ArgKey::Float(n.to_bits()),
        Value::Str(s) => ArgKey::Str(s.text.clone()),
        Value::List(l) => ArgKey::List(
            l.items
                .iter()
                .map(|item| arg_key(trace, item, fallback))
                .collect(),
        ),
        Value::Object(o) => ArgKey::Dict(
            o.entries
                .iter()
                .map(|(k, v)| (k.clone(), arg_key(trace, v, fallback)))
                .collect(),
        ),
        Value::Message(idx) | Value::ToolOutput(idx) => ArgKey::Event(*idx),
        Value::ToolCall(site) => match site.slot {
            Some(slot) => ArgKey::InlineCall(site.event, slot),
            None => ArgKey::Event(site.event),
        },
        Value::Chunks(idx) => ArgKey::Chunks(*idx),
        Value::FuncSpec(site) => match trace.call(*site) {
            Some(call) => ArgKey::Node(call.node.0),
            None => ArgKey::Opaque(bump(fallback)),
        },
        _ => ArgKey::Opaque(bump(fallback)),
    }
}

fn bump(counter: &mut u64) -> u64 {
    *counter += 1;
    *counter
}

type CallKey = (usize, Vec<ArgKey>, Vec<(String, ArgKey)>);

/// Memoization table for host-predicate calls.
#[derive(Default)]
pub struct FunctionCache {
    entries: RefCell<HashMap<CallKey, Value>>,
    opaque_counter: RefCell<u64>,
}

impl FunctionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Calls `function`, consulting the cache when the function is marked
    /// cacheable. Failures of optional predicates degrade to `None`.
    pub fn call(
        &self,
        function: &HostFn,
        args: &CallArgs,
        scope: &mut CallScope<'_>,
    ) -> Result<Value, EvalError> {
        if !function.cached {
            return self.invoke(function, args, scope);
        }

        let key = self.call_key(function, args, scope.trace);
        if let Some(value) = self.entries.borrow().get(&key) {
            return Ok(value.clone());
        }

        let value = self.invoke(function, args, scope)?;
        self.entries.borrow_mut().insert(key, value.clone());
        Ok(value)
    }

    fn invoke(
        &self,
        function: &HostFn,
        args: &CallArgs,
        scope: &mut CallScope<'_>,
    ) -> Result<Value, EvalError> {
        match (function.func)(scope, args) {
            Ok(value) => Ok(value),
            Err(error) if function.optional => {
                tracing::warn!(
                    function = %function.name,
                    error = %error,
                    "optional predicate failed; evaluating to None"
                );
                Ok(Value::None)
            }
            Err(error) => Err(error),
        }
    }

    fn call_key(&self, function: &HostFn, args: &CallArgs, trace: &Trace) -> CallKey {
        let mut fallback = self.opaque_counter.borrow_mut();
        let positional = args
            .args
            .iter()
            .map(|arg| arg_key(trace, arg, &mut fallback))
            .collect();
        let keyword = args
            .kwargs
            .iter()
            .map(|(name, value)| (name.clone(), arg_key(trace, value, &mut fallback)))
            .collect();
        (function.identity(), positional, keyword)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use crate::detectors::DetectorRegistry;

    fn counting_fn(counter: Arc<AtomicUsize>) -> HostFn {
        HostFn::new("probe", move |_, args| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(args.args.first().cloned().unwrap_or(Value::None))
        })
    }

    fn with_scope<R>(f: impl FnOnce(&mut CallScope<'_>) -> R) -> R {
        let trace = Trace::default();
        let mut ranges = Vec::new();
        let detectors = DetectorRegistry::standard();
        let mut scope = CallScope {
            trace: &trace,
            ranges: &mut ranges,
            detectors: &detectors,
        };
        f(&mut scope)
    }

    #[test]
    fn cached_functions_run_once_per_argument_identity() {
        let counter = Arc::new(AtomicUsize::new(0));
        let function = counting_fn(counter.clone()).cached();
        let cache = FunctionCache::new();
        let args = CallArgs::positional(vec![Value::str("x")]);

        with_scope(|scope| {
            cache.call(&function, &args, scope).unwrap();
            cache.call(&function, &args, scope).unwrap();
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn uncached_functions_bypass_the_table() {
        let counter = Arc::new(AtomicUsize::new(0));
        let function = counting_fn(counter.clone());
        let cache = FunctionCache::new();
        let args = CallArgs::positional(vec![Value::str("x")]);

        with_scope(|scope| {
            cache.call(&function, &args, scope).unwrap();
            cache.call(&function, &args, scope).unwrap();
        });
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn optional_predicates_degrade_to_none() {
        let failing = HostFn::new("flaky", |_, _| {
            Err(EvalError::PredicateFailed("backend down".to_string()))
        })
        .optional();
        let cache = FunctionCache::new();

        let value = with_scope(|scope| cache.call(&failing, &CallArgs::default(), scope));
        assert_eq!(value.unwrap(), Value::None);
    }

    #[test]
    fn required_predicate_failures_propagate() {
        let failing = HostFn::new("flaky", |_, _| {
            Err(EvalError::PredicateFailed("backend down".to_string()))
        });
        let cache = FunctionCache::new();

        let value = with_scope(|scope| cache.call(&failing, &CallArgs::default(), scope));
        assert!(value.is_err());
    }

    #[test]
    fn distinct_arguments_key_separately() {
        let counter = Arc::new(AtomicUsize::new(0));
        let function = counting_fn(counter.clone()).cached();
        let cache = FunctionCache::new();

        with_scope(|scope| {
            cache
                .call(&function, &CallArgs::positional(vec![Value::str("a")]), scope)
                .unwrap();
            cache
                .call(&function, &CallArgs::positional(vec![Value::str("b")]), scope)
                .unwrap();
        });
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }
}
