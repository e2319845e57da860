//! The admission engine.
//!
//! [`RateLimitEngine`] ties rule resolution, key building and a counter store
//! together. Storage failures during a check fail open: the request is
//! admitted, the failure is logged and counted, and the result is marked
//! degraded. Any other error is returned to the caller.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::key::KeyBuilder;
use super::result::{ceil_secs, AdmissionResult};
use super::rules::{Rule, RuleSet};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TurnstileError};
use crate::store::CounterStore;

/// Immutable engine configuration. Swapped wholesale on reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Global switch; when off every request is admitted without counting
    pub enabled: bool,
    /// Rules to resolve against
    pub rules: RuleSet,
}

impl EngineConfig {
    /// An enabled configuration over `rules`.
    pub fn new(rules: RuleSet) -> Self {
        Self { enabled: true, rules }
    }

    /// Toggle the global switch.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub granted: u64,
    pub denied: u64,
    /// Requests admitted because the counter store failed
    pub storage_failure_admits: u64,
    /// Requests admitted while the engine was disabled
    pub bypassed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    granted: AtomicU64,
    denied: AtomicU64,
    storage_failure_admits: AtomicU64,
    bypassed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> EngineStats {
        EngineStats {
            granted: self.granted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            storage_failure_admits: self.storage_failure_admits.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
        }
    }
}

/// Fixed-window admission control over a pluggable counter store.
///
/// The engine is thread-safe and is meant to be shared behind an `Arc`.
pub struct RateLimitEngine {
    store: Arc<dyn CounterStore>,
    keys: KeyBuilder,
    clock: Arc<dyn Clock>,
    config: RwLock<Arc<EngineConfig>>,
    counters: Counters,
}

impl RateLimitEngine {
    /// Create an engine on the system clock.
    pub fn new(store: Arc<dyn CounterStore>, keys: KeyBuilder, config: EngineConfig) -> Result<Self> {
        Self::with_clock(store, keys, config, Arc::new(SystemClock))
    }

    /// Create an engine with an explicit clock.
    ///
    /// The clock should be the same one the store judges expiry against.
    pub fn with_clock(
        store: Arc<dyn CounterStore>,
        keys: KeyBuilder,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.rules.validate()?;

        info!(
            backend = store.name(),
            namespace = keys.namespace(),
            enabled = config.enabled,
            client_rules = config.rules.client_rules.len(),
            resource_rules = config.rules.resource_rules.len(),
            "Rate limit engine initialized"
        );

        Ok(Self {
            store,
            keys,
            clock,
            config: RwLock::new(Arc::new(config)),
            counters: Counters::default(),
        })
    }

    /// The current configuration snapshot.
    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.read().clone()
    }

    /// Replace the configuration. Checks already running keep the old one.
    pub fn reload(&self, config: EngineConfig) -> Result<()> {
        config.rules.validate()?;
        info!(
            enabled = config.enabled,
            client_rules = config.rules.client_rules.len(),
            resource_rules = config.rules.resource_rules.len(),
            "Reloaded rate limit configuration"
        );
        *self.config.write() = Arc::new(config);
        Ok(())
    }

    /// Whether rate limiting is currently switched on.
    pub fn is_enabled(&self) -> bool {
        self.config.read().enabled
    }

    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    pub fn key_builder(&self) -> &KeyBuilder {
        &self.keys
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Count a request against the rule that applies to it.
    pub async fn acquire(&self, identity: &str, resource: &str) -> Result<AdmissionResult> {
        let config = self.config();
        if !config.enabled {
            return Ok(self.bypass());
        }

        let rule = config.rules.resolve(identity, resource)?;
        self.acquire_under(identity, resource, &rule).await
    }

    /// Count a request against a caller-supplied rule, skipping resolution.
    pub async fn acquire_with_rule(&self, identity: &str, resource: &str, rule: &Rule) -> Result<AdmissionResult> {
        if !self.is_enabled() {
            return Ok(self.bypass());
        }

        rule.validate()?;
        self.acquire_under(identity, resource, rule).await
    }

    /// Report the current state without counting a request.
    pub async fn inspect(&self, identity: &str, resource: &str) -> Result<AdmissionResult> {
        let config = self.config();
        if !config.enabled {
            return Ok(AdmissionResult::unlimited(self.clock.now()));
        }

        let rule = config.rules.resolve(identity, resource)?;
        let key = self.keys.build_key(identity, resource);

        match self.read_window(&key).await {
            Ok((count, ttl)) => Ok(self.decide(&rule, count, ttl)),
            Err(err) if err.is_storage() => Ok(self.fail_open(&key, &rule, err)),
            Err(err) => Err(err),
        }
    }

    /// Clear the counter for one identity and resource.
    pub async fn reset(&self, identity: &str, resource: &str) -> Result<bool> {
        let key = self.keys.build_key(identity, resource);
        let existed = self.store.reset(&key).await?;
        info!(key = %key, existed = existed, "Reset rate limit counter");
        Ok(existed)
    }

    /// Clear every counter belonging to an identity.
    pub async fn reset_client(&self, identity: &str) -> Result<u64> {
        let pattern = self.keys.build_client_pattern(identity);
        let removed = self.store.reset_by_prefix(&pattern).await?;
        info!(identity = %identity, removed = removed, "Reset client rate limit counters");
        Ok(removed)
    }

    /// Clear every counter for a resource, across all identities.
    pub async fn reset_resource(&self, resource: &str) -> Result<u64> {
        let pattern = self.keys.build_resource_pattern(resource);
        let removed = self.store.reset_by_prefix(&pattern).await?;
        info!(resource = %resource, removed = removed, "Reset resource rate limit counters");
        Ok(removed)
    }

    async fn acquire_under(&self, identity: &str, resource: &str, rule: &Rule) -> Result<AdmissionResult> {
        let key = self.keys.build_key(identity, resource);

        trace!(
            key = %key,
            permit_limit = rule.permit_limit,
            window = ?rule.window,
            "Checking rate limit"
        );

        let (count, ttl) = match self.store.increment_with_ttl(&key, rule.window).await {
            Ok(observed) => observed,
            Err(err) if err.is_storage() => return Ok(self.fail_open(&key, rule, err)),
            Err(err) => return Err(err),
        };

        let result = self.decide(rule, count, ttl);
        if result.is_granted() {
            self.counters.granted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
            debug!(
                key = %key,
                count = count,
                limit = rule.permit_limit,
                reset_after_secs = result.reset_after_secs(),
                "Rate limit exceeded"
            );
        }
        Ok(result)
    }

    async fn read_window(&self, key: &str) -> Result<(u64, Duration)> {
        let count = self.store.get_count(key).await?;
        let ttl = self.store.time_to_live(key).await?;
        Ok((count, ttl))
    }

    fn decide(&self, rule: &Rule, count: u64, ttl: Duration) -> AdmissionResult {
        let now = self.clock.now();
        let reset_after_secs = ceil_secs(ttl);

        if count > rule.permit_limit {
            AdmissionResult::denied(rule.permit_limit, reset_after_secs, now)
        } else {
            AdmissionResult::granted(rule.permit_limit, rule.permit_limit - count, reset_after_secs, now)
        }
    }

    fn fail_open(&self, key: &str, rule: &Rule, err: TurnstileError) -> AdmissionResult {
        self.counters.storage_failure_admits.fetch_add(1, Ordering::Relaxed);
        warn!(
            backend = self.store.name(),
            key = %key,
            error = %err,
            "Counter store unavailable, admitting request"
        );
        AdmissionResult::fail_open(rule.permit_limit, self.clock.now())
    }

    fn bypass(&self) -> AdmissionResult {
        self.counters.bypassed.fetch_add(1, Ordering::Relaxed);
        AdmissionResult::unlimited(self.clock.now())
    }
}
