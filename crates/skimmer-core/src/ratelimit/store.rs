//! Persistence for limiter state.
//!
//! Token buckets snapshot here best-effort; sliding windows and penalty
//! records live here exclusively. The interface mirrors a Redis-like
//! key-value store with TTLs plus a scored set per key.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{SharedClock, system_clock};
use crate::error::AppError;

/// Outcome of [`LimiterStore::zadd_within_limit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAdmission {
    /// Member added; `count` members were live before it.
    Recorded { count: u64 },
    /// Limit reached; nothing was added.
    Full { count: u64, oldest: Option<i64> },
}

pub trait LimiterStore: Send + Sync + Clone + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, AppError>> + Send;

    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Add `member` with `score` to the set at `key`.
    fn zadd(
        &self,
        key: &str,
        score: i64,
        member: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Remove members with `min <= score <= max`. Returns the number removed.
    fn zremrangebyscore(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn zcard(&self, key: &str) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Lowest score in the set, if any.
    fn zoldest(&self, key: &str) -> impl Future<Output = Result<Option<i64>, AppError>> + Send;

    /// Set the TTL of a scored set.
    fn expire(&self, key: &str, ttl: Duration) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Atomically drop members scored below `prune_before`, then add `member`
    /// only if fewer than `limit` remain. An insert sets the set's TTL.
    ///
    /// Concurrent callers on the same key are serialized.
    fn zadd_within_limit(
        &self,
        key: &str,
        prune_before: i64,
        limit: u64,
        score: i64,
        member: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<WindowAdmission, AppError>> + Send;

    /// Drop every expired entry. Returns the number of keys removed.
    fn purge_expired(&self) -> impl Future<Output = Result<u64, AppError>> + Send;
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    values: HashMap<String, (String, i64)>,
    sets: HashMap<String, ScoredSet>,
}

#[derive(Debug, Default)]
struct ScoredSet {
    members: BTreeSet<(i64, String)>,
    expires_at: Option<i64>,
}

/// In-process [`LimiterStore`]. Expiry is evaluated lazily against the
/// injected clock and swept by [`LimiterStore::purge_expired`].
#[derive(Debug, Clone)]
pub struct MemoryLimiterStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
    clock: SharedClock,
}

impl Default for MemoryLimiterStore {
    fn default() -> Self {
        Self::new(system_clock())
    }
}

impl MemoryLimiterStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryStoreInner::default())),
            clock,
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned limiter store mutex");
            poisoned.into_inner()
        })
    }

    fn expiry(&self, ttl: Duration) -> i64 {
        self.clock.now_ms() + ttl.as_millis() as i64
    }

    /// Number of live keys (values and sets).
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        let inner = self.lock_inner();
        let values = inner.values.values().filter(|(_, exp)| *exp > now).count();
        let sets = inner
            .sets
            .values()
            .filter(|s| s.expires_at.is_none_or(|exp| exp > now))
            .count();
        values + sets
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_set<'a>(inner: &'a mut MemoryStoreInner, key: &str, now: i64) -> Option<&'a mut ScoredSet> {
        let expired = inner
            .sets
            .get(key)
            .is_some_and(|s| s.expires_at.is_some_and(|exp| exp <= now));
        if expired {
            inner.sets.remove(key);
        }
        inner.sets.get_mut(key)
    }
}

impl LimiterStore for MemoryLimiterStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock_inner();
        let live = inner
            .values
            .get(key)
            .filter(|(_, exp)| *exp > now)
            .map(|(value, _)| value.clone());
        if live.is_none() {
            inner.values.remove(key);
        }
        Ok(live)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        let exp = self.expiry(ttl);
        self.lock_inner()
            .values
            .insert(key.to_string(), (value.to_string(), exp));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let mut inner = self.lock_inner();
        inner.values.remove(key);
        inner.sets.remove(key);
        Ok(())
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), AppError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock_inner();
        Self::live_set(&mut inner, key, now);
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .members
            .insert((score, member.to_string()));
        Ok(())
    }

    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<u64, AppError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock_inner();
        let Some(set) = Self::live_set(&mut inner, key, now) else {
            return Ok(0);
        };
        let before = set.members.len();
        set.members.retain(|(score, _)| *score < min || *score > max);
        Ok((before - set.members.len()) as u64)
    }

    async fn zcard(&self, key: &str) -> Result<u64, AppError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock_inner();
        Ok(Self::live_set(&mut inner, key, now).map_or(0, |s| s.members.len() as u64))
    }

    async fn zoldest(&self, key: &str) -> Result<Option<i64>, AppError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock_inner();
        Ok(Self::live_set(&mut inner, key, now)
            .and_then(|s| s.members.first().map(|(score, _)| *score)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), AppError> {
        let exp = self.expiry(ttl);
        let mut inner = self.lock_inner();
        if let Some(set) = inner.sets.get_mut(key) {
            set.expires_at = Some(exp);
        }
        if let Some((_, value_exp)) = inner.values.get_mut(key) {
            *value_exp = exp;
        }
        Ok(())
    }

    async fn zadd_within_limit(
        &self,
        key: &str,
        prune_before: i64,
        limit: u64,
        score: i64,
        member: &str,
        ttl: Duration,
    ) -> Result<WindowAdmission, AppError> {
        let now = self.clock.now_ms();
        let exp = self.expiry(ttl);
        let mut inner = self.lock_inner();
        Self::live_set(&mut inner, key, now);

        let set = inner.sets.entry(key.to_string()).or_default();
        set.members.retain(|(s, _)| *s >= prune_before);
        let count = set.members.len() as u64;
        if count >= limit {
            let oldest = set.members.first().map(|(s, _)| *s);
            return Ok(WindowAdmission::Full { count, oldest });
        }
        set.members.insert((score, member.to_string()));
        set.expires_at = Some(exp);
        Ok(WindowAdmission::Recorded { count })
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock_inner();
        let before = inner.values.len() + inner.sets.len();
        inner.values.retain(|_, (_, exp)| *exp > now);
        inner
            .sets
            .retain(|_, s| s.expires_at.is_none_or(|exp| exp > now) && !s.members.is_empty());
        Ok((before - inner.values.len() - inner.sets.len()) as u64)
    }
}
