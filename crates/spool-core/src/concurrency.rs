//! Concurrency gate: "at most N admitted jobs per concurrency key".
//!
//! The stores own the counting and locking; this module owns the limits and the
//! decision itself so both stores place jobs identically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_CONCURRENCY_LIMIT: u32 = 1;
pub const DEFAULT_BLOCKED_FOR: Duration = Duration::from_secs(180);

/// Limit and blocked-expiry for one concurrency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyLimit {
    #[serde(rename = "to")]
    pub limit: u32,
    /// How long a blocked job may wait before the maintenance sweep releases it.
    #[serde(rename = "duration", with = "crate::config::secs")]
    pub blocked_for: Duration,
}

impl ConcurrencyLimit {
    pub fn new(limit: u32, blocked_for: Duration) -> Self {
        Self { limit, blocked_for }
    }
}

impl Default for ConcurrencyLimit {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY_LIMIT, DEFAULT_BLOCKED_FOR)
    }
}

/// Looks up the limit for a concurrency key.
pub trait ConcurrencyPolicy: Send + Sync {
    fn limit_for(&self, key: &str) -> ConcurrencyLimit;
}

/// Fixed limits: exact key, then key group (text before the first `/`), then
/// the default.
#[derive(Debug, Clone, Default)]
pub struct StaticConcurrencyPolicy {
    default: ConcurrencyLimit,
    overrides: HashMap<String, ConcurrencyLimit>,
}

impl StaticConcurrencyPolicy {
    pub fn new(default: ConcurrencyLimit) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, key_or_group: impl Into<String>, limit: ConcurrencyLimit) -> Self {
        self.overrides.insert(key_or_group.into(), limit);
        self
    }
}

impl ConcurrencyPolicy for StaticConcurrencyPolicy {
    fn limit_for(&self, key: &str) -> ConcurrencyLimit {
        if let Some(limit) = self.overrides.get(key) {
            return *limit;
        }
        key.split_once('/')
            .and_then(|(group, _)| self.overrides.get(group))
            .copied()
            .unwrap_or(self.default)
    }
}

/// Where a job that is due goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Ready,
    Blocked { expires_at: DateTime<Utc> },
}

/// Can one more job with this key be admitted?
pub fn admits(admitted: usize, limit: &ConcurrencyLimit) -> bool {
    admitted < limit.limit as usize
}

/// Gate decision for a due job whose key currently has `admitted` jobs.
pub fn placement(admitted: usize, limit: &ConcurrencyLimit, now: DateTime<Utc>) -> Placement {
    if admits(admitted, limit) {
        Placement::Ready
    } else {
        Placement::Blocked {
            expires_at: after(now, limit.blocked_for),
        }
    }
}

/// `now + duration`, saturating at the largest representable instant.
pub(crate) fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy() -> StaticConcurrencyPolicy {
        StaticConcurrencyPolicy::default()
            .with_override("imports", ConcurrencyLimit::new(3, Duration::from_secs(60)))
            .with_override("imports/acme", ConcurrencyLimit::new(5, Duration::from_secs(30)))
    }

    #[rstest]
    #[case::exact("imports/acme", 5)]
    #[case::group("imports/globex", 3)]
    #[case::group_itself("imports", 3)]
    #[case::default("customer/7", DEFAULT_CONCURRENCY_LIMIT)]
    fn limit_lookup(#[case] key: &str, #[case] expected: u32) {
        assert_eq!(policy().limit_for(key).limit, expected);
    }

    #[test]
    fn below_limit_is_ready() {
        let limit = ConcurrencyLimit::new(2, Duration::from_secs(60));
        assert_eq!(placement(1, &limit, Utc::now()), Placement::Ready);
    }

    #[test]
    fn at_limit_is_blocked_until_expiry() {
        let now = Utc::now();
        let limit = ConcurrencyLimit::new(1, Duration::from_secs(60));
        assert_eq!(
            placement(1, &limit, now),
            Placement::Blocked {
                expires_at: now + chrono::Duration::seconds(60)
            }
        );
    }

    #[test]
    fn zero_limit_never_admits() {
        let limit = ConcurrencyLimit::new(0, Duration::from_secs(1));
        assert!(!admits(0, &limit));
    }
}
