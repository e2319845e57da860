//! Turnstile - Fixed-Window Request Admission Control
//!
//! This crate decides whether a request from a caller identity against a
//! logical resource is admitted under a time-windowed quota. Counters live in
//! a pluggable store: process memory for single instances, or Redis when
//! several instances must share one quota.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use turnstile::ratelimit::{EngineConfig, KeyBuilder, RateLimitEngine, Rule, RuleSet};
//! use turnstile::store::LocalCounterStore;
//!
//! let rules = RuleSet::new(Rule::new(100, Duration::from_secs(60)))
//!     .with_resource_rule("POST /login", Rule::new(5, Duration::from_secs(300)));
//! let engine = RateLimitEngine::new(
//!     Arc::new(LocalCounterStore::new()),
//!     KeyBuilder::default(),
//!     EngineConfig::new(rules),
//! )?;
//!
//! let result = engine.acquire("203.0.113.7", "POST /login").await?;
//! if !result.is_granted() {
//!     // respond 429 with Retry-After: result.reset_after_secs()
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
