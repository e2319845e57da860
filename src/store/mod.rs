//! Counter stores for fixed-window accounting.
//!
//! A [`CounterStore`] owns the lifetime of every counter entry. The engine
//! only ever touches counters through this trait, so the local and remote
//! implementations are interchangeable.

mod local;
mod remote;

pub use local::LocalCounterStore;
pub use remote::{RemoteCounterStore, DEFAULT_SCAN_BATCH};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::clock::Clock;
use crate::config::{StorageBackend, StorageConfig};
use crate::error::{Result, TurnstileError};

/// Storage for windowed counters.
///
/// Implementations must make `increment` atomic per key: concurrent callers
/// on the same key never lose an update, and a fresh window gets exactly one
/// expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `key`, starting a new window of length
    /// `window` if the key is absent or expired. Returns the new count.
    async fn increment(&self, key: &str, window: Duration) -> Result<u64>;

    /// Increment like [`increment`](Self::increment) and report the time
    /// left in the window as of that increment.
    ///
    /// The default issues two calls, so the key may expire in between.
    /// Stores that can observe both at once should override it.
    async fn increment_with_ttl(&self, key: &str, window: Duration) -> Result<(u64, Duration)> {
        let count = self.increment(key, window).await?;
        let ttl = self.time_to_live(key).await?;
        Ok((count, ttl))
    }

    /// Current count, or zero if the key is absent or expired.
    async fn get_count(&self, key: &str) -> Result<u64>;

    /// Time until the key expires, or zero if absent or expired.
    async fn time_to_live(&self, key: &str) -> Result<Duration>;

    /// Delete a key. Returns whether a live entry existed.
    async fn reset(&self, key: &str) -> Result<bool>;

    /// Delete every key matching a glob pattern. Returns how many were removed.
    async fn reset_by_prefix(&self, pattern: &str) -> Result<u64>;

    /// Check that the store is reachable.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    /// Short label used in logs.
    fn name(&self) -> &'static str;
}

/// Build the store selected by configuration.
pub async fn from_config(config: &StorageConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn CounterStore>> {
    match config.backend {
        StorageBackend::Local => {
            let interval = Duration::from_secs(config.sweep_interval_secs.max(1));
            info!(sweep_interval = ?interval, "Using in-process counter store");

            let store = Arc::new(LocalCounterStore::with_clock(clock));
            // The sweeper exits once the last handle to the store is dropped.
            store.spawn_sweeper(interval);
            Ok(store as Arc<dyn CounterStore>)
        }
        StorageBackend::Remote => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                TurnstileError::Config("storage.redis_url is required for the remote backend".to_string())
            })?;
            let store = RemoteCounterStore::connect(url).await?.with_scan_batch(config.scan_batch_size);
            Ok(Arc::new(store) as Arc<dyn CounterStore>)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Any,
    One,
    Literal(char),
}

fn tokenize(pattern: &str) -> Vec<Token> {
    let mut tokens = Vec::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '*' => Token::Any,
            '?' => Token::One,
            '\\' => Token::Literal(chars.next().unwrap_or('\\')),
            other => Token::Literal(other),
        });
    }
    tokens
}

/// Match `text` against a glob pattern.
///
/// Supports `*`, `?` and backslash escapes, the subset of Redis `MATCH`
/// syntax that key patterns are built from.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let tokens = tokenize(pattern);
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    // Last `*` seen and the text position it is currently absorbing up to.
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match tokens.get(p) {
            Some(Token::Literal(c)) if *c == text[t] => {
                p += 1;
                t += 1;
            }
            Some(Token::One) => {
                p += 1;
                t += 1;
            }
            Some(Token::Any) => {
                backtrack = Some((p, t));
                p += 1;
            }
            _ => match backtrack {
                Some((star, absorbed)) => {
                    p = star + 1;
                    t = absorbed + 1;
                    backtrack = Some((star, absorbed + 1));
                }
                None => return false,
            },
        }
    }

    tokens[p..].iter().all(|token| *token == Token::Any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    #[test]
    fn test_glob_literal() {
        assert!(glob_match("abc", "abc"));
        assert!(!glob_match("abc", "abcd"));
        assert!(!glob_match("abcd", "abc"));
    }

    #[test]
    fn test_glob_star() {
        assert!(glob_match("rl:k1:*", "rl:k1:r1"));
        assert!(glob_match("rl:k1:*", "rl:k1:"));
        assert!(glob_match("rl:*:r1", "rl:k1:r1"));
        assert!(!glob_match("rl:*:r1", "rl:k1:r10"));
        assert!(glob_match("*", ""));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b*c", "axxbyy"));
    }

    #[test]
    fn test_glob_question_mark() {
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
    }

    #[test]
    fn test_glob_escapes() {
        assert!(glob_match("a\\*", "a*"));
        assert!(!glob_match("a\\*", "ab"));
        assert!(glob_match("a\\[b\\]", "a[b]"));
    }

    #[tokio::test]
    async fn test_from_config_local() {
        let config = StorageConfig::default();
        let store = from_config(&config, Arc::new(SystemClock)).await.unwrap();
        assert_eq!(store.name(), "local");
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_from_config_remote_requires_url() {
        let config = StorageConfig {
            backend: StorageBackend::Remote,
            redis_url: None,
            ..StorageConfig::default()
        };
        let err = from_config(&config, Arc::new(SystemClock)).await.err().unwrap();
        assert!(matches!(err, TurnstileError::Config(_)));
    }
}
