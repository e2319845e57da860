//! Admission control: rules, keys, results and the engine.

mod engine;
mod key;
mod result;
pub mod rules;

pub use engine::{EngineConfig, EngineStats, RateLimitEngine};
pub use key::{KeyBuilder, DEFAULT_NAMESPACE, MAX_COMPONENT_LEN, UNKNOWN_COMPONENT};
pub use result::AdmissionResult;
pub use rules::{Rule, RuleScope, RuleSet};
