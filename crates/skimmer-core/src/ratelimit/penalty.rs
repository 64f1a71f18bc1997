//! Burst-with-penalty wrapper.
//!
//! ```text
//! NORMAL --[base check denies, burst configured]--> PENALIZED --[penalty expires]--> NORMAL
//! ```
//!
//! While a penalty record is live every check is denied without consulting
//! the base limiter. Penalty records are kept in the shared store with a TTL
//! equal to their own duration. Store trouble is logged and treated as "no
//! penalty" on read; a failed write still escalates the response.

use std::future::Future;
use std::time::Duration;

use crate::clock::SharedClock;
use crate::error::AppError;
use crate::ratelimit::store::LimiterStore;
use crate::ratelimit::types::RateLimitDecision;

pub const DEFAULT_PENALTY_MULTIPLIER: f64 = 2.0;

/// Burst allowance for a key. Exceeding it triggers a cooldown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BurstPolicy {
    /// Extra requests tolerated above the steady rate.
    pub burst: u32,
    pub cooldown: Duration,
    pub multiplier: f64,
}

impl BurstPolicy {
    pub fn new(burst: u32, cooldown: Duration) -> Self {
        Self {
            burst,
            cooldown,
            multiplier: DEFAULT_PENALTY_MULTIPLIER,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn penalty_duration(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown.as_secs_f64() * self.multiplier.max(0.0))
    }
}

#[derive(Clone)]
pub struct BurstPenaltyLimiter<S: LimiterStore> {
    store: S,
    clock: SharedClock,
    store_timeout: Duration,
}

impl<S: LimiterStore> BurstPenaltyLimiter<S> {
    pub fn new(store: S, clock: SharedClock, store_timeout: Duration) -> Self {
        Self {
            store,
            clock,
            store_timeout,
        }
    }

    fn penalty_key(key: &str) -> String {
        format!("penalty:{key}")
    }

    /// Run `base` for `key` unless a penalty is active.
    ///
    /// With `burst` set, a base denial starts a penalty of
    /// `cooldown × multiplier` and the returned `retry_after` is escalated to it.
    pub async fn check<F, Fut>(
        &self,
        key: &str,
        burst: Option<&BurstPolicy>,
        base: F,
    ) -> RateLimitDecision
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RateLimitDecision>,
    {
        let now = self.clock.now_ms();

        if let Some(end) = self.active_penalty(key, now).await {
            let remaining = Duration::from_millis((end - now) as u64);
            tracing::debug!(%key, remaining_ms = remaining.as_millis() as u64, "Penalty active");
            return RateLimitDecision::deny(0, remaining, remaining);
        }

        let mut decision = base().await;

        if !decision.allowed
            && let Some(burst) = burst
        {
            let penalty = burst.penalty_duration();
            let end = now + penalty.as_millis() as i64;
            tracing::info!(
                %key,
                penalty_ms = penalty.as_millis() as u64,
                "Burst exceeded, applying penalty"
            );
            if let Err(e) = self.write_penalty(key, end, penalty).await {
                tracing::warn!(%key, error = %e, "Failed to record penalty");
            }
            decision.retry_after = Some(penalty);
            decision.reset_after = decision.reset_after.max(penalty);
        }

        decision
    }

    /// Remaining penalty for `key`, if one is live.
    pub async fn remaining(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_ms();
        self.active_penalty(key, now)
            .await
            .map(|end| Duration::from_millis((end - now) as u64))
    }

    /// Lift a penalty early.
    pub async fn clear(&self, key: &str) -> Result<(), AppError> {
        tokio::time::timeout(self.store_timeout, self.store.delete(&Self::penalty_key(key)))
            .await
            .map_err(|_| AppError::StoreError("penalty delete timed out".into()))?
    }

    async fn active_penalty(&self, key: &str, now: i64) -> Option<i64> {
        let read =
            tokio::time::timeout(self.store_timeout, self.store.get(&Self::penalty_key(key))).await;
        let raw = match read {
            Ok(Ok(raw)) => raw?,
            Ok(Err(e)) => {
                tracing::warn!(%key, error = %e, "Penalty lookup failed, ignoring");
                return None;
            }
            Err(_) => {
                tracing::warn!(%key, "Penalty lookup timed out, ignoring");
                return None;
            }
        };
        match raw.parse::<i64>() {
            Ok(end) if end > now => Some(end),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(%key, error = %e, "Unreadable penalty record, ignoring");
                None
            }
        }
    }

    async fn write_penalty(&self, key: &str, end: i64, ttl: Duration) -> Result<(), AppError> {
        tokio::time::timeout(
            self.store_timeout,
            self.store.set(&Self::penalty_key(key), &end.to_string(), ttl),
        )
        .await
        .map_err(|_| AppError::StoreError("penalty write timed out".into()))?
    }
}
