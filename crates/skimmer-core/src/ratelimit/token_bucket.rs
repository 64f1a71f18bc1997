//! Continuous-refill token bucket.
//!
//! Buckets live in-process and are authoritative there. Each check
//! serializes on a per-key async mutex, refills from elapsed wall time,
//! then writes a best-effort snapshot to the [`LimiterStore`] so a restarted
//! process can pick up where it left off.
//!
//! The capacity and refill rate are taken from the policy passed on every
//! call. A bucket checked under a different policy than last time is
//! re-derived (tokens clamped to the new capacity); the adaptive limiter
//! relies on this.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::clock::SharedClock;
use crate::ratelimit::store::LimiterStore;
use crate::ratelimit::types::{AdmissionCheck, LimitPolicy, RateLimitDecision};

/// Token-bucket state for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate: f64,
    pub last_refill_ms: i64,
}

impl Bucket {
    /// A full bucket for `policy`.
    pub fn new(policy: &LimitPolicy, now_ms: i64) -> Self {
        let capacity = f64::from(policy.capacity);
        Self {
            tokens: capacity,
            capacity,
            refill_rate: policy.refill_rate(),
            last_refill_ms: now_ms,
        }
    }

    /// Add tokens for the time elapsed since the last refill.
    ///
    /// A clock that reads earlier than `last_refill_ms` adds nothing and
    /// leaves `last_refill_ms` untouched.
    pub fn refill(&mut self, now_ms: i64) {
        let elapsed_ms = now_ms - self.last_refill_ms;
        if elapsed_ms <= 0 {
            return;
        }
        let added = (elapsed_ms as f64 / 1000.0) * self.refill_rate;
        self.tokens = (self.tokens + added).clamp(0.0, self.capacity);
        self.last_refill_ms = now_ms;
    }

    pub fn try_consume(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Re-derive capacity and rate from `policy`. Returns true if anything changed.
    pub fn apply_policy(&mut self, policy: &LimitPolicy) -> bool {
        let capacity = f64::from(policy.capacity);
        let refill_rate = policy.refill_rate();
        let changed = capacity != self.capacity || refill_rate != self.refill_rate;
        self.capacity = capacity;
        self.refill_rate = refill_rate;
        self.tokens = self.tokens.clamp(0.0, capacity);
        changed
    }

    /// Time until the bucket is full again.
    pub fn time_to_full(&self) -> Duration {
        if self.refill_rate <= 0.0 {
            return Duration::ZERO;
        }
        let missing = (self.capacity - self.tokens).max(0.0);
        Duration::from_secs_f64(missing / self.refill_rate)
    }
}

type BucketSlot = Arc<Mutex<Option<Bucket>>>;

/// Default cap on buckets held in memory at once.
pub const DEFAULT_MAX_BUCKETS: u64 = 100_000;

/// Keyed token-bucket limiter.
#[derive(Clone)]
pub struct TokenBucketLimiter<S: LimiterStore> {
    buckets: Cache<String, BucketSlot>,
    store: S,
    clock: SharedClock,
    store_timeout: Duration,
    idle_ttl: Duration,
}

impl<S: LimiterStore> TokenBucketLimiter<S> {
    pub fn new(store: S, clock: SharedClock, store_timeout: Duration, idle_ttl: Duration) -> Self {
        Self {
            buckets: Self::build_cache(idle_ttl, DEFAULT_MAX_BUCKETS),
            store,
            clock,
            store_timeout,
            idle_ttl,
        }
    }

    /// Bound the in-memory bucket map; least recently used keys are evicted
    /// first and reload from their snapshot on the next check.
    pub fn with_max_buckets(mut self, max_buckets: u64) -> Self {
        self.buckets = Self::build_cache(self.idle_ttl, max_buckets);
        self
    }

    fn build_cache(idle_ttl: Duration, max_buckets: u64) -> Cache<String, BucketSlot> {
        Cache::builder()
            .max_capacity(max_buckets.max(1))
            .time_to_idle(idle_ttl)
            .build()
    }

    fn snapshot_key(key: &str) -> String {
        format!("bucket:{key}")
    }

    /// Consume one token from `key` if available.
    pub async fn check(&self, key: &str, policy: &LimitPolicy) -> RateLimitDecision {
        let slot = self
            .buckets
            .get_with(key.to_string(), async { Arc::new(Mutex::new(None)) })
            .await;
        let mut guard = slot.lock().await;
        let now = self.clock.now_ms();

        let mut bucket = match guard.take() {
            Some(bucket) => bucket,
            None => self.restore(key, policy, now).await,
        };

        if bucket.apply_policy(policy) {
            tracing::debug!(
                %key,
                capacity = policy.capacity,
                window_ms = policy.window.as_millis() as u64,
                "Bucket policy changed, re-derived refill rate"
            );
        }
        bucket.refill(now);

        let decision = if bucket.try_consume() {
            RateLimitDecision::allow(
                policy.capacity,
                bucket.tokens.floor() as u32,
                bucket.time_to_full(),
            )
        } else {
            let retry_after = if policy.capacity == 0 {
                policy.window
            } else {
                // 1 / refill_rate, computed as window / capacity to stay exact.
                Duration::from_secs_f64(
                    (policy.window.as_secs_f64() / f64::from(policy.capacity)).ceil(),
                )
            };
            RateLimitDecision::deny(policy.capacity, bucket.time_to_full(), retry_after)
        };

        *guard = Some(bucket.clone());
        self.persist(key, &bucket, policy.window).await;
        decision
    }

    /// Current bucket state for `key`, refilled to now, without consuming.
    pub async fn peek(&self, key: &str) -> Option<Bucket> {
        let slot = self.buckets.get(key).await?;
        let guard = slot.lock().await;
        guard.as_ref().map(|b| {
            let mut b = b.clone();
            b.refill(self.clock.now_ms());
            b
        })
    }

    /// Forget the bucket for `key`, locally and in the store.
    pub async fn reset(&self, key: &str) {
        self.buckets.invalidate(key).await;
        let deleted = tokio::time::timeout(
            self.store_timeout,
            self.store.delete(&Self::snapshot_key(key)),
        )
        .await;
        if !matches!(deleted, Ok(Ok(()))) {
            tracing::warn!(%key, "Failed to delete bucket snapshot");
        }
    }

    /// Evict buckets idle past the cache TTL. The TTL is configured above
    /// any policy window, so an evicted bucket had already refilled.
    /// Returns the number of buckets still tracked.
    pub async fn prune_idle(&self) -> u64 {
        self.buckets.run_pending_tasks().await;
        self.buckets.entry_count()
    }

    async fn restore(&self, key: &str, policy: &LimitPolicy, now: i64) -> Bucket {
        let loaded = tokio::time::timeout(
            self.store_timeout,
            self.store.get(&Self::snapshot_key(key)),
        )
        .await;

        match loaded {
            Ok(Ok(Some(raw))) => match serde_json::from_str::<Bucket>(&raw) {
                Ok(bucket) => {
                    tracing::debug!(%key, tokens = bucket.tokens, "Restored bucket snapshot");
                    bucket
                }
                Err(e) => {
                    tracing::warn!(%key, error = %e, "Discarding unreadable bucket snapshot");
                    Bucket::new(policy, now)
                }
            },
            Ok(Ok(None)) => Bucket::new(policy, now),
            Ok(Err(e)) => {
                tracing::warn!(%key, error = %e, "Bucket snapshot load failed, starting full");
                Bucket::new(policy, now)
            }
            Err(_) => {
                tracing::warn!(%key, "Bucket snapshot load timed out, starting full");
                Bucket::new(policy, now)
            }
        }
    }

    async fn persist(&self, key: &str, bucket: &Bucket, ttl: Duration) {
        let raw = match serde_json::to_string(bucket) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(%key, error = %e, "Failed to serialize bucket snapshot");
                return;
            }
        };
        let written = tokio::time::timeout(
            self.store_timeout,
            self.store.set(&Self::snapshot_key(key), &raw, ttl),
        )
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(%key, error = %e, "Bucket snapshot write failed"),
            Err(_) => tracing::warn!(%key, "Bucket snapshot write timed out"),
        }
    }
}

impl<S: LimiterStore> AdmissionCheck for TokenBucketLimiter<S> {
    async fn check(&self, key: &str, policy: &LimitPolicy) -> RateLimitDecision {
        TokenBucketLimiter::check(self, key, policy).await
    }
}
