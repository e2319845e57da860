//! The outcome of an admission check.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Immutable admission decision.
///
/// Granted and denied results share one shape; a denial always reports
/// zero remaining permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionResult {
    granted: bool,
    remaining: u64,
    limit: u64,
    reset_after_secs: u64,
    reset_at: DateTime<Utc>,
    degraded: bool,
}

impl AdmissionResult {
    /// A granted request.
    pub fn granted(limit: u64, remaining: u64, reset_after_secs: u64, now: DateTime<Utc>) -> Self {
        Self {
            granted: true,
            remaining,
            limit,
            reset_after_secs,
            reset_at: reset_at(now, reset_after_secs),
            degraded: false,
        }
    }

    /// A denied request.
    pub fn denied(limit: u64, reset_after_secs: u64, now: DateTime<Utc>) -> Self {
        Self {
            granted: false,
            remaining: 0,
            limit,
            reset_after_secs,
            reset_at: reset_at(now, reset_after_secs),
            degraded: false,
        }
    }

    /// A request admitted because the counter store could not be reached.
    pub fn fail_open(limit: u64, now: DateTime<Utc>) -> Self {
        Self {
            granted: true,
            remaining: limit,
            limit,
            reset_after_secs: 0,
            reset_at: now,
            degraded: true,
        }
    }

    /// A request admitted while rate limiting is switched off.
    pub fn unlimited(now: DateTime<Utc>) -> Self {
        Self {
            granted: true,
            remaining: u64::MAX,
            limit: u64::MAX,
            reset_after_secs: 0,
            reset_at: now,
            degraded: false,
        }
    }

    pub fn is_granted(&self) -> bool {
        self.granted
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Whole seconds until the window resets, rounded up.
    pub fn reset_after_secs(&self) -> u64 {
        self.reset_after_secs
    }

    /// When the window resets, as of evaluation time.
    pub fn reset_at(&self) -> DateTime<Utc> {
        self.reset_at
    }

    /// Whether the decision was made without consulting the counter store.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

/// Round a TTL up to whole seconds.
pub(crate) fn ceil_secs(ttl: Duration) -> u64 {
    if ttl.subsec_nanos() > 0 {
        ttl.as_secs().saturating_add(1)
    } else {
        ttl.as_secs()
    }
}

fn reset_at(now: DateTime<Utc>, reset_after_secs: u64) -> DateTime<Utc> {
    i64::try_from(reset_after_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::ZERO), 0);
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::from_millis(59_001)), 60);
        assert_eq!(ceil_secs(Duration::from_secs(60)), 60);
    }

    #[test]
    fn test_granted_shape() {
        let now = Utc::now();
        let result = AdmissionResult::granted(10, 4, 30, now);

        assert!(result.is_granted());
        assert!(!result.is_degraded());
        assert_eq!(result.remaining(), 4);
        assert_eq!(result.limit(), 10);
        assert_eq!(result.reset_at(), now + chrono::Duration::seconds(30));
    }

    #[test]
    fn test_denied_has_no_remaining() {
        let now = Utc::now();
        let result = AdmissionResult::denied(10, 5, now);

        assert!(!result.is_granted());
        assert_eq!(result.remaining(), 0);
        assert_eq!(result.reset_after_secs(), 5);
    }

    #[test]
    fn test_fail_open_is_marked_degraded() {
        let result = AdmissionResult::fail_open(10, Utc::now());

        assert!(result.is_granted());
        assert!(result.is_degraded());
        assert_eq!(result.remaining(), 10);
    }

    #[test]
    fn test_serializes_to_json() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let json = serde_json::to_value(AdmissionResult::denied(3, 60, now)).unwrap();

        assert_eq!(json["granted"], false);
        assert_eq!(json["remaining"], 0);
        assert_eq!(json["limit"], 3);
        assert_eq!(json["reset_after_secs"], 60);
    }
}
