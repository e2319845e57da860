//! In-process counter store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{glob_match, CounterStore};
use crate::clock::{add_std, Clock, SystemClock};
use crate::error::Result;

/// A counter and the instant its window closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CounterEntry {
    count: u64,
    expires_at: DateTime<Utc>,
}

impl CounterEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Counter store held in process memory.
///
/// Each read-modify-write runs under the map's entry guard, which locks only
/// the shard holding that key. Unrelated keys proceed in parallel.
#[derive(Debug)]
pub struct LocalCounterStore {
    entries: DashMap<String, CounterEntry>,
    clock: Arc<dyn Clock>,
}

impl LocalCounterStore {
    /// Create a store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that judges expiry against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            debug!(removed = removed, "Purged expired counters");
        }
        removed
    }

    /// Periodically purge expired entries until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.purge_expired();
                    }
                    None => break,
                }
            }
        })
    }

    /// Number of entries held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LocalCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for LocalCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64> {
        self.increment_with_ttl(key, window).await.map(|(count, _)| count)
    }

    async fn increment_with_ttl(&self, key: &str, window: Duration) -> Result<(u64, Duration)> {
        let now = self.clock.now();
        let expires_at = add_std(now, window)?;

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert(CounterEntry { count: 0, expires_at });

        if entry.is_expired(now) {
            trace!(key = %key, "Starting new window");
            entry.count = 0;
            entry.expires_at = expires_at;
        }

        entry.count = entry.count.saturating_add(1);
        let ttl = (entry.expires_at - now).to_std().unwrap_or(Duration::ZERO);
        Ok((entry.count, ttl))
    }

    async fn get_count(&self, key: &str) -> Result<u64> {
        let now = self.clock.now();
        Ok(match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => entry.count,
            _ => 0,
        })
    }

    async fn time_to_live(&self, key: &str) -> Result<Duration> {
        let now = self.clock.now();
        Ok(match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                (entry.expires_at - now).to_std().unwrap_or(Duration::ZERO)
            }
            _ => Duration::ZERO,
        })
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, entry)| !entry.is_expired(now))
            .unwrap_or(false))
    }

    async fn reset_by_prefix(&self, pattern: &str) -> Result<u64> {
        let now = self.clock.now();
        let mut removed = 0u64;

        self.entries.retain(|key, entry| {
            if !glob_match(pattern, key) {
                return true;
            }
            if !entry.is_expired(now) {
                removed += 1;
            }
            false
        });

        Ok(removed)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
