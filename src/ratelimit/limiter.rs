//! Core sliding-window rate limiter.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, trace, warn};

use crate::config::{FailurePolicy, LimiterConfig};
use crate::error::Result;
use crate::store::WindowStore;

use super::key::RateLimitKey;

/// The outcome of one admission check.
///
/// Computed fresh per call, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request is over the configured limit.
    pub is_limited: bool,
    /// The configured limit.
    pub limit: u32,
    /// Requests left in the window. Negative once over the limit, and left
    /// unclamped: a negative remaining is itself meaningful telemetry.
    pub remaining: i64,
    /// Seconds until the oldest counted entry leaves the window.
    pub reset_seconds: u64,
}

impl Decision {
    /// The decision handed out under `fail_open` when the store is down.
    fn fail_open(config: &LimiterConfig) -> Self {
        Self {
            is_limited: false,
            limit: config.limit,
            remaining: config.limit as i64,
            reset_seconds: 0,
        }
    }

    /// The decision handed out under `fail_closed` when the store is down.
    fn fail_closed(config: &LimiterConfig) -> Self {
        Self {
            is_limited: true,
            limit: config.limit,
            remaining: 0,
            reset_seconds: config.window_seconds,
        }
    }
}

/// Sliding-window rate limiter over a shared [`WindowStore`].
///
/// The counted interval is always the trailing `window_seconds` from now, so
/// the fixed-window double-burst problem at bucket boundaries cannot occur.
///
/// The per-check trim/add/count sequence is deliberately not one atomic
/// store transaction: two concurrent checks for the same key can interleave,
/// and under heavy concurrent load on a single key the enforced limit can
/// overshoot by at most the number of in-flight checks minus one. Exact
/// enforcement would require fusing the sequence into a store-side script
/// without changing this type's contract.
///
/// Holds only immutable configuration and a store handle, so a single
/// instance is shared by reference across any number of request workers.
pub struct RateLimiter<S: WindowStore> {
    store: Arc<S>,
    config: LimiterConfig,
}

impl<S: WindowStore> RateLimiter<S> {
    pub fn new(store: Arc<S>, config: LimiterConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Evaluate one request against the window for `key`.
    ///
    /// The request is recorded even when it will be rejected: rejected
    /// requests still count against the caller's budget, so a retry storm
    /// cannot hold the window open for itself.
    ///
    /// A store failure surfaces as `StoreUnavailable` rather than a silent
    /// admit; use [`check_admission`](Self::check_admission) to apply the
    /// configured failure policy instead.
    pub async fn check(&self, key: &RateLimitKey) -> Result<Decision> {
        self.check_at(key, Utc::now().timestamp_millis()).await
    }

    /// Apply the configured [`FailurePolicy`] on top of [`check`](Self::check).
    pub async fn check_admission(&self, key: &RateLimitKey) -> Decision {
        match self.check(key).await {
            Ok(decision) => decision,
            Err(e) => match self.config.failure_policy {
                FailurePolicy::FailOpen => {
                    warn!(key = %key, error = %e, "Store unavailable, admitting request (fail-open)");
                    Decision::fail_open(&self.config)
                }
                FailurePolicy::FailClosed => {
                    error!(key = %key, error = %e, "Store unavailable, rejecting request (fail-closed)");
                    Decision::fail_closed(&self.config)
                }
            },
        }
    }

    pub(crate) async fn check_at(&self, key: &RateLimitKey, now_ms: i64) -> Result<Decision> {
        let window_start = now_ms - self.config.window_ms();

        trace!(key = %key, now_ms, window_start, "Checking rate limit");

        self.store.trim_older_than(key.as_str(), window_start).await?;

        // Score stays the bare timestamp; the random suffix keeps two
        // requests landing in the same millisecond as two distinct members.
        let member = format!("{}-{:08x}", now_ms, rand::random::<u32>());
        self.store.add_member(key.as_str(), now_ms, &member).await?;

        let count = self.store.count(key.as_str()).await? as i64;
        let limit = self.config.limit as i64;
        let is_limited = count > limit;
        let remaining = limit - count;

        // Seconds until the oldest counted entry leaves the window. The set
        // cannot be empty here, the current request was just recorded.
        let oldest = self.store.oldest_score(key.as_str()).await?.unwrap_or(now_ms);
        let until_reset_ms = (self.config.window_ms() - (now_ms - oldest)).max(0);
        let reset_seconds = ((until_reset_ms + 999) / 1000) as u64;

        if is_limited {
            debug!(key = %key, count, limit, "Rate limit exceeded");
        }

        Ok(Decision {
            is_limited,
            limit: self.config.limit,
            remaining,
            reset_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio_test::assert_err;

    use super::*;
    use crate::error::TurnstileError;
    use crate::ratelimit::key::{Identity, KeyResolver};
    use crate::ratelimit::sweeper::Sweeper;
    use crate::store::MemoryWindowStore;

    /// A store where every operation fails, standing in for an unreachable
    /// shared store.
    struct FailingStore;

    fn store_down<T>() -> Result<T> {
        Err(TurnstileError::StoreUnavailable(
            "connection refused".to_string(),
        ))
    }

    #[async_trait]
    impl WindowStore for FailingStore {
        async fn trim_older_than(&self, _key: &str, _cutoff_ms: i64) -> Result<u64> {
            store_down()
        }

        async fn add_member(&self, _key: &str, _score_ms: i64, _member: &str) -> Result<()> {
            store_down()
        }

        async fn count(&self, _key: &str) -> Result<u64> {
            store_down()
        }

        async fn oldest_score(&self, _key: &str) -> Result<Option<i64>> {
            store_down()
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            store_down()
        }

        async fn scan_keys(
            &self,
            _pattern: &str,
            _cursor: u64,
            _page_size: usize,
        ) -> Result<(u64, Vec<String>)> {
            store_down()
        }

        async fn trim_and_count(
            &self,
            _keys: &[String],
            _cutoff_ms: i64,
        ) -> Result<Vec<(u64, u64)>> {
            store_down()
        }
    }

    fn failing_limiter(policy: FailurePolicy) -> RateLimiter<FailingStore> {
        let config = LimiterConfig {
            limit: 5,
            window_seconds: 60,
            failure_policy: policy,
            ..LimiterConfig::default()
        };
        RateLimiter::new(Arc::new(FailingStore), config)
    }

    fn limiter(limit: u32, window_seconds: u64) -> RateLimiter<MemoryWindowStore> {
        let config = LimiterConfig {
            limit,
            window_seconds,
            ..LimiterConfig::default()
        };
        RateLimiter::new(Arc::new(MemoryWindowStore::new()), config)
    }

    fn key(name: &str) -> RateLimitKey {
        KeyResolver::new("rl:").resolve(&Identity::principal(name))
    }

    #[tokio::test]
    async fn test_counts_down_to_limit_then_rejects() {
        let limiter = limiter(5, 60);
        let key = key("alice");

        for expected_remaining in [4, 3, 2, 1, 0] {
            let decision = limiter.check_at(&key, 0).await.unwrap();
            assert!(!decision.is_limited);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(decision.limit, 5);
        }

        let decision = limiter.check_at(&key, 0).await.unwrap();
        assert!(decision.is_limited);
        assert_eq!(decision.remaining, -1);
    }

    #[tokio::test]
    async fn test_window_expiry_restores_budget() {
        let limiter = limiter(5, 60);
        let key = key("alice");

        for _ in 0..5 {
            limiter.check_at(&key, 0).await.unwrap();
        }

        // At t=61s every t=0 entry is outside the trailing window.
        let decision = limiter.check_at(&key, 61_000).await.unwrap();
        assert!(!decision.is_limited);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn test_sliding_window_end_to_end() {
        let limiter = limiter(3, 10);
        let key = key("alice");

        let expected = [(false, 2), (false, 1), (false, 0), (true, -1)];
        for (t, (limited, remaining)) in [0i64, 2_000, 4_000, 6_000].into_iter().zip(expected) {
            let decision = limiter.check_at(&key, t).await.unwrap();
            assert_eq!(decision.is_limited, limited, "at t={}ms", t);
            assert_eq!(decision.remaining, remaining, "at t={}ms", t);
        }

        // Past the boundary the t=0 and t=2 entries have slid out, leaving
        // t=4, t=6 and this request in the trailing 10 seconds.
        let decision = limiter.check_at(&key, 12_500).await.unwrap();
        assert!(!decision.is_limited);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_reset_seconds_follows_oldest_entry() {
        let limiter = limiter(10, 60);
        let key = key("alice");

        // Fresh window: the new entry is the oldest, full window remains.
        let decision = limiter.check_at(&key, 0).await.unwrap();
        assert_eq!(decision.reset_seconds, 60);

        // The t=0 entry stays the oldest, so reset shrinks as time passes.
        let decision = limiter.check_at(&key, 10_000).await.unwrap();
        assert_eq!(decision.reset_seconds, 50);
        let decision = limiter.check_at(&key, 30_500).await.unwrap();
        assert_eq!(decision.reset_seconds, 30);

        // Once every prior entry has slid out, the next addition is the
        // oldest entry of a brand new window.
        let decision = limiter.check_at(&key, 95_000).await.unwrap();
        assert_eq!(decision.reset_seconds, 60);
    }

    #[tokio::test]
    async fn test_rejected_requests_still_burn_budget() {
        let limiter = limiter(2, 60);
        let key = key("alice");

        limiter.check_at(&key, 0).await.unwrap();
        limiter.check_at(&key, 0).await.unwrap();

        // Each rejected retry is still recorded, so remaining keeps falling.
        for expected_remaining in [-1, -2, -3] {
            let decision = limiter.check_at(&key, 1_000).await.unwrap();
            assert!(decision.is_limited);
            assert_eq!(decision.remaining, expected_remaining);
        }
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let limiter = limiter(1, 60);
        let alice = key("alice");
        let bob = key("bob");

        let decision = limiter.check_at(&alice, 0).await.unwrap();
        assert!(!decision.is_limited);
        let decision = limiter.check_at(&alice, 0).await.unwrap();
        assert!(decision.is_limited);

        // Alice being over limit says nothing about Bob.
        let decision = limiter.check_at(&bob, 0).await.unwrap();
        assert!(!decision.is_limited);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_sweeps_between_checks_change_nothing() {
        let store = Arc::new(MemoryWindowStore::new());
        let config = LimiterConfig {
            limit: 3,
            window_seconds: 10,
            ..LimiterConfig::default()
        };
        let limiter = RateLimiter::new(store.clone(), config.clone());
        let sweeper = Sweeper::new(store, config);
        let key = key("alice");

        limiter.check_at(&key, 0).await.unwrap();
        limiter.check_at(&key, 2_000).await.unwrap();

        // Check is self-sufficient: any number of sweeps in between must not
        // affect the next decision.
        for _ in 0..3 {
            sweeper.sweep_once_at(4_000).await.unwrap();
        }

        let decision = limiter.check_at(&key, 4_000).await.unwrap();
        assert!(!decision.is_limited);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_check_admission_passes_through_decisions() {
        let limiter = limiter(1, 60);
        let key = key("alice");

        let decision = limiter.check_admission(&key).await;
        assert!(!decision.is_limited);
        let decision = limiter.check_admission(&key).await;
        assert!(decision.is_limited);
    }

    #[tokio::test]
    async fn test_check_surfaces_store_failure() {
        let limiter = failing_limiter(FailurePolicy::FailOpen);

        // A limiter that cannot evaluate a request must say so, never
        // silently admit.
        let err = assert_err!(limiter.check(&key("alice")).await);
        assert!(matches!(err, TurnstileError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_check_admission_fail_open_admits_on_store_failure() {
        let limiter = failing_limiter(FailurePolicy::FailOpen);

        let decision = limiter.check_admission(&key("alice")).await;
        assert!(!decision.is_limited);
        assert_eq!(decision.remaining, 5);
        assert_eq!(decision.reset_seconds, 0);
    }

    #[tokio::test]
    async fn test_check_admission_fail_closed_rejects_on_store_failure() {
        let limiter = failing_limiter(FailurePolicy::FailClosed);

        let decision = limiter.check_admission(&key("alice")).await;
        assert!(decision.is_limited);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_seconds, 60);
    }

    #[tokio::test]
    async fn test_failure_policy_decisions() {
        let config = LimiterConfig {
            limit: 5,
            window_seconds: 60,
            ..LimiterConfig::default()
        };

        let open = Decision::fail_open(&config);
        assert!(!open.is_limited);
        assert_eq!(open.remaining, 5);
        assert_eq!(open.reset_seconds, 0);

        let closed = Decision::fail_closed(&config);
        assert!(closed.is_limited);
        assert_eq!(closed.remaining, 0);
        assert_eq!(closed.reset_seconds, 60);
    }
}
