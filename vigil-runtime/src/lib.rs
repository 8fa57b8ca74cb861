//! Vigil Runtime - Rule Evaluation Engine
//!
//! Evaluates linked policies against traces:
//!
//! ```text
//! ParsedPolicy (vigil-dsl)
//!     ↓ link (symbol table → global environment)
//! LinkedPolicy
//!     ↓ RuleSet::apply(trace)
//!       interpreter (three-valued partial evaluation)
//!       model enumeration (assignments satisfying each rule body)
//!     ↓
//! AnalysisResult (rule-fired errors with ranges and stable keys)
//! ```
//!
//! The `Monitor` layer on top deduplicates errors by stable key across
//! repeated invocations and supports pending-window analysis.

pub mod builtins;
pub mod cache;
pub mod detectors;
pub mod enumeration;
pub mod interpreter;
pub mod link;
pub mod monitor;
pub mod patterns;
pub mod policy;
pub mod quantifiers;
pub mod rule;
pub mod trilean;

pub use cache::*;
pub use detectors::*;
pub use enumeration::*;
pub use interpreter::*;
pub use link::*;
pub use monitor::*;
pub use patterns::*;
pub use policy::*;
pub use quantifiers::*;
pub use rule::*;
pub use trilean::*;
