//! Redis-backed counter store shared across processes.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::{debug, info};

use super::CounterStore;
use crate::error::Result;

/// Keys requested per `SCAN` round trip.
pub const DEFAULT_SCAN_BATCH: usize = 100;

/// Increment and, on the first hit of a window, set the expiry. Returns the
/// new count and the milliseconds left in the window.
///
/// Runs as one script so Redis applies it atomically. The `PTTL` check also
/// repairs a key that somehow lost its expiry instead of letting it live
/// forever.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Counter store backed by a shared Redis instance.
///
/// Atomicity comes from Redis itself; this type never reads a counter and
/// then writes it back.
pub struct RemoteCounterStore {
    conn: ConnectionManager,
    increment: Script,
    scan_batch: usize,
}

impl RemoteCounterStore {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis counter store");
        Ok(Self::from_connection(conn))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            increment: Script::new(INCREMENT_SCRIPT),
            scan_batch: DEFAULT_SCAN_BATCH,
        }
    }

    /// Set how many keys each `SCAN` step asks for.
    pub fn with_scan_batch(mut self, scan_batch: usize) -> Self {
        self.scan_batch = scan_batch.max(1);
        self
    }
}

fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// `PTTL` reply as a duration. Redis answers -2 for a missing key and -1 for
/// a key without expiry.
fn ttl_from_millis(millis: i64) -> Duration {
    u64::try_from(millis).map(Duration::from_millis).unwrap_or(Duration::ZERO)
}

#[async_trait]
impl CounterStore for RemoteCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64> {
        self.increment_with_ttl(key, window).await.map(|(count, _)| count)
    }

    async fn increment_with_ttl(&self, key: &str, window: Duration) -> Result<(u64, Duration)> {
        let mut conn = self.conn.clone();
        let (count, millis): (u64, i64) = self
            .increment
            .key(key)
            .arg(window_millis(window))
            .invoke_async(&mut conn)
            .await?;
        Ok((count, ttl_from_millis(millis)))
    }

    async fn get_count(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = conn.get(key).await?;
        Ok(count.unwrap_or(0))
    }

    async fn time_to_live(&self, key: &str) -> Result<Duration> {
        let mut conn = self.conn.clone();
        let millis: i64 = conn.pttl(key).await?;
        Ok(ttl_from_millis(millis))
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn reset_by_prefix(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0u64;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(self.scan_batch)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %pattern, removed = removed, "Deleted counters by pattern");
        Ok(removed)
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TurnstileError;

    fn redis_url() -> String {
        std::env::var("TURNSTILE_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    /// Unique key namespace per test so runs do not interfere.
    fn test_prefix(name: &str) -> String {
        format!("turnstile-test:{}:{}", name, std::process::id())
    }

    #[test]
    fn test_window_millis() {
        assert_eq!(window_millis(Duration::from_secs(60)), 60_000);
        assert_eq!(window_millis(Duration::from_micros(10)), 1);
        assert_eq!(window_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_ttl_from_millis() {
        assert_eq!(ttl_from_millis(1_500), Duration::from_millis(1_500));
        assert_eq!(ttl_from_millis(-1), Duration::ZERO);
        assert_eq!(ttl_from_millis(-2), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_invalid_url_is_storage_error() {
        let err = RemoteCounterStore::connect("not a redis url").await.err().unwrap();
        assert!(matches!(err, TurnstileError::Storage(_)));
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at TURNSTILE_TEST_REDIS_URL"]
    async fn test_remote_increment_and_ttl() {
        let store = RemoteCounterStore::connect(&redis_url()).await.unwrap();
        let key = format!("{}:k", test_prefix("incr"));
        store.reset(&key).await.unwrap();

        let (count, ttl) = store.increment_with_ttl(&key, Duration::from_secs(60)).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(ttl, Duration::from_secs(60));
        assert_eq!(store.increment(&key, Duration::from_secs(60)).await.unwrap(), 2);
        assert_eq!(store.get_count(&key).await.unwrap(), 2);

        let ttl = store.time_to_live(&key).await.unwrap();
        assert!(ttl > Duration::from_secs(55) && ttl <= Duration::from_secs(60));

        assert!(store.reset(&key).await.unwrap());
        assert!(!store.reset(&key).await.unwrap());
        assert_eq!(store.get_count(&key).await.unwrap(), 0);
        assert_eq!(store.time_to_live(&key).await.unwrap(), Duration::ZERO);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at TURNSTILE_TEST_REDIS_URL"]
    async fn test_remote_window_expires() {
        let store = RemoteCounterStore::connect(&redis_url()).await.unwrap();
        let key = format!("{}:k", test_prefix("expiry"));
        store.reset(&key).await.unwrap();

        store.increment(&key, Duration::from_millis(200)).await.unwrap();
        store.increment(&key, Duration::from_millis(200)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(store.get_count(&key).await.unwrap(), 0);
        assert_eq!(store.increment(&key, Duration::from_secs(60)).await.unwrap(), 1);
        store.reset(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at TURNSTILE_TEST_REDIS_URL"]
    async fn test_remote_reset_by_prefix() {
        let store = RemoteCounterStore::connect(&redis_url()).await.unwrap().with_scan_batch(2);
        let prefix = test_prefix("prefix");

        for i in 0..5 {
            store.increment(&format!("{}:alice:{}", prefix, i), Duration::from_secs(60)).await.unwrap();
        }
        store.increment(&format!("{}:bob:0", prefix), Duration::from_secs(60)).await.unwrap();

        let removed = store.reset_by_prefix(&format!("{}:alice:*", prefix)).await.unwrap();
        assert_eq!(removed, 5);
        assert_eq!(store.get_count(&format!("{}:bob:0", prefix)).await.unwrap(), 1);

        store.reset_by_prefix(&format!("{}:*", prefix)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires a running Redis at TURNSTILE_TEST_REDIS_URL"]
    async fn test_remote_concurrent_increments() {
        let store = std::sync::Arc::new(RemoteCounterStore::connect(&redis_url()).await.unwrap());
        let key = format!("{}:hot", test_prefix("concurrent"));
        store.reset(&key).await.unwrap();

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move { store.increment(&key, Duration::from_secs(60)).await.unwrap() })
            })
            .collect();
        futures::future::join_all(tasks).await;

        assert_eq!(store.get_count(&key).await.unwrap(), 50);
        store.reset(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at TURNSTILE_TEST_REDIS_URL"]
    async fn test_remote_health_check() {
        let store = RemoteCounterStore::connect(&redis_url()).await.unwrap();
        assert!(store.health_check().await.is_ok());
    }
}
