//! Sliding-window log limiter backed by the shared [`LimiterStore`].
//!
//! Every admitted request is recorded as a `(timestamp, nonce)` member of a
//! per-key scored set. Pruning, counting and recording happen in one
//! atomic store call. If the store errors or times out the check fails open.

use std::time::Duration;

use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::AppError;
use crate::ratelimit::store::{LimiterStore, WindowAdmission};
use crate::ratelimit::types::RateLimitDecision;

#[derive(Clone)]
pub struct SlidingWindowLimiter<S: LimiterStore> {
    store: S,
    clock: SharedClock,
    store_timeout: Duration,
}

impl<S: LimiterStore> SlidingWindowLimiter<S> {
    pub fn new(store: S, clock: SharedClock, store_timeout: Duration) -> Self {
        Self {
            store,
            clock,
            store_timeout,
        }
    }

    fn window_key(key: &str) -> String {
        format!("window:{key}")
    }

    pub async fn check(&self, key: &str, limit: u32, window: Duration) -> RateLimitDecision {
        let outcome = tokio::time::timeout(self.store_timeout, self.try_check(key, limit, window))
            .await
            .unwrap_or_else(|_| {
                Err(AppError::StoreError(format!(
                    "sliding window check timed out after {}ms",
                    self.store_timeout.as_millis()
                )))
            });

        match outcome {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(%key, error = %e, "Sliding window store unavailable, failing open");
                RateLimitDecision::allow(limit, limit.saturating_sub(1), Duration::ZERO)
            }
        }
    }

    async fn try_check(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateLimitDecision, AppError> {
        let set_key = Self::window_key(key);
        let now = self.clock.now_ms();
        let window_ms = window.as_millis() as i64;
        let member = format!("{now}-{}", Uuid::new_v4().simple());

        // Members at exactly `now - window` still count.
        let admission = self
            .store
            .zadd_within_limit(&set_key, now - window_ms, u64::from(limit), now, &member, window)
            .await?;

        match admission {
            WindowAdmission::Recorded { count } => {
                let remaining = limit.saturating_sub(count as u32 + 1);
                Ok(RateLimitDecision::allow(limit, remaining, window))
            }
            WindowAdmission::Full { count, oldest } => {
                let oldest = oldest.unwrap_or(now);
                let retry_ms = (oldest + window_ms - now).max(0) as u64;
                let retry_after = Duration::from_millis(retry_ms);
                tracing::debug!(%key, count, limit, retry_ms, "Sliding window limit reached");
                Ok(RateLimitDecision::deny(limit, retry_after, retry_after))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::store::MemoryLimiterStore;
    use std::sync::Arc;

    use crate::testutil::{FailingLimiterStore, StallingLimiterStore, YieldingLimiterStore};

    fn limiter(clock: &ManualClock) -> SlidingWindowLimiter<MemoryLimiterStore> {
        SlidingWindowLimiter::new(
            MemoryLimiterStore::new(clock.shared()),
            clock.shared(),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn admits_limit_then_denies_until_window_passes() {
        let clock = ManualClock::new(10_000);
        let limiter = limiter(&clock);
        let window = Duration::from_millis(1_000);

        for expected_remaining in [2, 1, 0] {
            let d = limiter.check("login:10.0.0.1", 3, window).await;
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
            clock.advance(Duration::from_millis(100));
        }

        let denied = limiter.check("login:10.0.0.1", 3, window).await;
        assert!(!denied.allowed);
        // Oldest entry at 10_000, now 10_300.
        assert_eq!(denied.retry_after, Some(Duration::from_millis(700)));

        clock.set(10_000 + 1_200 + 1);
        let again = limiter.check("login:10.0.0.1", 3, window).await;
        assert!(again.allowed);
    }

    #[tokio::test]
    async fn window_slides_one_entry_at_a_time() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock);
        let window = Duration::from_millis(1_000);

        assert!(limiter.check("k", 2, window).await.allowed); // t=0
        clock.advance(Duration::from_millis(600));
        assert!(limiter.check("k", 2, window).await.allowed); // t=600
        clock.advance(Duration::from_millis(300));
        assert!(!limiter.check("k", 2, window).await.allowed); // t=900

        clock.advance(Duration::from_millis(101)); // t=1001, t=0 entry gone
        assert!(limiter.check("k", 2, window).await.allowed);
        assert!(!limiter.check("k", 2, window).await.allowed);
    }

    #[tokio::test]
    async fn denied_requests_are_not_recorded() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock);
        let window = Duration::from_millis(1_000);

        assert!(limiter.check("k", 1, window).await.allowed);
        for _ in 0..5 {
            clock.advance(Duration::from_millis(100));
            assert!(!limiter.check("k", 1, window).await.allowed);
        }
        clock.set(1_000 + 1);
        assert!(limiter.check("k", 1, window).await.allowed);
    }

    #[tokio::test]
    async fn fails_open_when_store_errors() {
        let clock = ManualClock::new(0);
        let limiter =
            SlidingWindowLimiter::new(FailingLimiterStore, clock.shared(), Duration::from_millis(50));

        for _ in 0..10 {
            assert!(limiter.check("k", 1, Duration::from_secs(1)).await.allowed);
        }
    }

    #[tokio::test]
    async fn fails_open_when_store_stalls() {
        let clock = ManualClock::new(0);
        let limiter = SlidingWindowLimiter::new(
            StallingLimiterStore,
            clock.shared(),
            Duration::from_millis(20),
        );

        let d = limiter.check("k", 1, Duration::from_secs(1)).await;
        assert!(d.allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_never_exceed_the_limit() {
        let clock = ManualClock::new(0);
        let store = YieldingLimiterStore::new(MemoryLimiterStore::new(clock.shared()));
        let limiter = Arc::new(SlidingWindowLimiter::new(
            store,
            clock.shared(),
            Duration::from_secs(1),
        ));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check("k", 3, Duration::from_secs(60)).await })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);
    }
}
