//! Value-reference detectors.
//!
//! Semantic patterns can reference classes of values (`<EMAIL_ADDRESS>`,
//! `<MODERATED>`, ...); an extensible registry maps each value type to a
//! detector. The registry and its calling convention are the contract;
//! the detectors shipped here are lightweight regex/keyword stand-ins for
//! the real classifier backends, which plug in through
//! `DetectorRegistry::register`.

use crate::builtins::strings_of;
use crate::cache::FunctionCache;
use crate::link::{CallArgs, CallScope, HostFn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use vigil_core::{EvalError, Value};

// ============================================================================
// REGISTRY
// ============================================================================

/// Decides whether a value matches a value-reference type.
pub trait ValueDetector: Send + Sync {
    fn matches(
        &self,
        value_type: &str,
        value: &Value,
        cache: &FunctionCache,
        scope: &mut CallScope<'_>,
    ) -> Result<bool, EvalError>;
}

/// Registry of value-reference detectors, keyed by value type.
#[derive(Clone, Default)]
pub struct DetectorRegistry {
    matchers: HashMap<String, Arc<dyn ValueDetector>>,
}

impl DetectorRegistry {
    /// The built-in detector set.
    pub fn standard() -> Self {
        let mut registry = Self::default();
        let pii: Arc<dyn ValueDetector> = Arc::new(PiiDetector {
            pii: pii_function(),
        });
        for value_type in ["EMAIL_ADDRESS", "PHONE_NUMBER", "LOCATION", "PERSON"] {
            registry.register(value_type, pii.clone());
        }
        registry.register(
            "MODERATED",
            Arc::new(ModerationDetector {
                moderated: moderated_function(),
            }),
        );
        registry.register(
            "SECRET",
            Arc::new(SecretsDetector {
                secrets: secrets_function(),
            }),
        );
        // integration-test matcher without any backend dependency
        registry.register("DUMMY", Arc::new(DummyDetector));
        registry
    }

    pub fn register(&mut self, value_type: &str, detector: Arc<dyn ValueDetector>) {
        self.matchers.insert(value_type.to_string(), detector);
    }

    pub fn clone_handle(&self, value_type: &str) -> Option<Arc<dyn ValueDetector>> {
        self.matchers.get(value_type).cloned()
    }

    /// The supported value types, for policy validation.
    pub fn value_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.matchers.keys().cloned().collect();
        types.sort();
        types
    }
}

// ============================================================================
// BUILT-IN DETECTORS
// ============================================================================

struct PiiDetector {
    pii: HostFn,
}

impl ValueDetector for PiiDetector {
    fn matches(
        &self,
        value_type: &str,
        value: &Value,
        cache: &FunctionCache,
        scope: &mut CallScope<'_>,
    ) -> Result<bool, EvalError> {
        let found = cache.call(
            &self.pii,
            &CallArgs::positional(vec![value.clone()]),
            scope,
        )?;
        match found {
            Value::List(entities) => Ok(entities
                .items
                .iter()
                .any(|entity| entity.as_str() == Some(value_type))),
            _ => Ok(false),
        }
    }
}

struct ModerationDetector {
    moderated: HostFn,
}

impl ValueDetector for ModerationDetector {
    fn matches(
        &self,
        _value_type: &str,
        value: &Value,
        cache: &FunctionCache,
        scope: &mut CallScope<'_>,
    ) -> Result<bool, EvalError> {
        let flagged = cache.call(
            &self.moderated,
            &CallArgs::positional(vec![value.clone()]),
            scope,
        )?;
        Ok(flagged.truthy())
    }
}

struct SecretsDetector {
    secrets: HostFn,
}

impl ValueDetector for SecretsDetector {
    fn matches(
        &self,
        _value_type: &str,
        value: &Value,
        cache: &FunctionCache,
        scope: &mut CallScope<'_>,
    ) -> Result<bool, EvalError> {
        let found = cache.call(
            &self.secrets,
            &CallArgs::positional(vec![value.clone()]),
            scope,
        )?;
        match found {
            Value::List(kinds) => Ok(!kinds.items.is_empty()),
            _ => Ok(false),
        }
    }
}

struct DummyDetector;

impl ValueDetector for DummyDetector {
    fn matches(
        &self,
        _value_type: &str,
        value: &Value,
        _cache: &FunctionCache,
        _scope: &mut CallScope<'_>,
    ) -> Result<bool, EvalError> {
        Ok(value.as_str() == Some("__DUMMY__"))
    }
}

// ============================================================================
// DETECTOR PREDICATES
// ============================================================================

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap()
});

static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\+?[0-9][0-9 ()./-]{6,}[0-9]").unwrap());

// tiny stand-in gazetteers; real deployments register NER-backed detectors
const LOCATIONS: &[&str] = &[
    "Zurich", "Berlin", "Paris", "London", "New York", "San Francisco", "Tokyo", "Switzerland",
    "Germany", "France",
];
const PERSONS: &[&str] = &["Alice", "Bob", "Carol", "Dave", "Eve", "Mallory"];

const MODERATION_TERMS: &[&str] = &["kill", "hate", "attack", "hurt", "destroy all"];

static SECRET_PATTERNS: &[(&str, &str)] = &[
    ("AWS_ACCESS_KEY", r"AKIA[0-9A-Z]{16}"),
    ("GITHUB_TOKEN", r"ghp_[A-Za-z0-9]{36}"),
    ("SLACK_TOKEN", r"xox[baprs]-[A-Za-z0-9-]{10,}"),
    ("OPENAI_API_KEY", r"sk-[A-Za-z0-9]{20,}"),
];

static SECRET_RES: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    SECRET_PATTERNS
        .iter()
        .map(|(name, pattern)| (*name, Regex::new(pattern).unwrap()))
        .collect()
});

/// `pii(value) -> [entity types]`
pub fn pii_function() -> HostFn {
    HostFn::new("pii", |scope, args| {
        let value = args.arg(0)?;
        let mut found: Vec<Value> = Vec::new();
        let mut push = |entity: &str| {
            if !found.iter().any(|v| v.as_str() == Some(entity)) {
                found.push(Value::str(entity.to_string()));
            }
        };
        for text in strings_of(scope.trace, value) {
            if EMAIL_RE.is_match(&text) {
                push("EMAIL_ADDRESS");
            }
            if PHONE_RE.is_match(&text) {
                push("PHONE_NUMBER");
            }
            if LOCATIONS.iter().any(|l| text.contains(l)) {
                push("LOCATION");
            }
            if PERSONS.iter().any(|p| text.contains(p)) {
                push("PERSON");
            }
        }
        Ok(Value::list(found))
    })
    .cached()
}

/// `moderated(value) -> bool`
pub fn moderated_function() -> HostFn {
    HostFn::new("moderated", |scope, args| {
        let value = args.arg(0)?;
        let flagged = strings_of(scope.trace, value).iter().any(|text| {
            let lower = text.to_lowercase();
            MODERATION_TERMS.iter().any(|term| lower.contains(term))
        });
        Ok(Value::Bool(flagged))
    })
    .cached()
}

/// `secrets(value) -> [secret kinds]`
pub fn secrets_function() -> HostFn {
    HostFn::new("secrets", |scope, args| {
        let value = args.arg(0)?;
        let mut found: Vec<Value> = Vec::new();
        for text in strings_of(scope.trace, value) {
            for (name, regex) in SECRET_RES.iter() {
                if regex.is_match(&text) && !found.iter().any(|v| v.as_str() == Some(*name)) {
                    found.push(Value::str(name.to_string()));
                }
            }
        }
        Ok(Value::list(found))
    })
    .cached()
}

/// The detector predicates importable from `vigil.detectors`.
pub fn detector_functions() -> Vec<(&'static str, HostFn)> {
    vec![
        ("pii", pii_function()),
        ("moderated", moderated_function()),
        ("secrets", secrets_function()),
    ]
}
