//! The admission gate: every limiter behind one injectable handle.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::SharedClock;
use crate::config::{env_parse, env_positive};
use crate::error::AppError;
use crate::job::ExtractionJob;
use crate::ratelimit::adaptive::{AdaptiveLimiter, LoadSource};
use crate::ratelimit::hierarchical::{HierarchicalLimiter, HierarchicalOutcome, HierarchyPolicy};
use crate::ratelimit::penalty::{BurstPenaltyLimiter, BurstPolicy};
use crate::ratelimit::policy::DomainPolicyTable;
use crate::ratelimit::sliding_window::SlidingWindowLimiter;
use crate::ratelimit::store::LimiterStore;
use crate::ratelimit::token_bucket::{DEFAULT_MAX_BUCKETS, TokenBucketLimiter};
use crate::ratelimit::types::{ClientIdentity, LimitPolicy, RateLimitDecision};

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Upper bound on any single limiter store round-trip.
    pub store_timeout: Duration,
    /// In-memory buckets untouched this long are evicted.
    pub bucket_idle_ttl: Duration,
    /// Most buckets kept in memory; the rest live only as snapshots.
    pub max_buckets: u64,
    /// Per-level policies for the API surface.
    pub hierarchy: HierarchyPolicy,
    /// Sliding-window limit on job submissions per client.
    pub submit_limit: u32,
    pub submit_window: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(200),
            bucket_idle_ttl: Duration::from_secs(3600),
            max_buckets: DEFAULT_MAX_BUCKETS,
            hierarchy: HierarchyPolicy::default(),
            submit_limit: 30,
            submit_window: Duration::from_secs(60),
        }
    }
}

impl LimiterConfig {
    /// - `SKIMMER_STORE_TIMEOUT_MS` (default 200)
    /// - `SKIMMER_BUCKET_IDLE_SECS` (default 3600)
    /// - `SKIMMER_MAX_BUCKETS` (default 100000)
    /// - `SKIMMER_SUBMIT_LIMIT` / `SKIMMER_SUBMIT_WINDOW_MS` (default 30 per 60000)
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();
        Ok(Self {
            store_timeout: Duration::from_millis(env_positive("SKIMMER_STORE_TIMEOUT_MS", 200)?),
            bucket_idle_ttl: Duration::from_secs(env_positive("SKIMMER_BUCKET_IDLE_SECS", 3600)?),
            max_buckets: env_positive("SKIMMER_MAX_BUCKETS", DEFAULT_MAX_BUCKETS)?,
            hierarchy: defaults.hierarchy,
            submit_limit: env_parse("SKIMMER_SUBMIT_LIMIT", defaults.submit_limit)?,
            submit_window: Duration::from_millis(env_positive("SKIMMER_SUBMIT_WINDOW_MS", 60_000)?),
        })
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_hierarchy(mut self, hierarchy: HierarchyPolicy) -> Self {
        self.hierarchy = hierarchy;
        self
    }

    pub fn with_submit_limit(mut self, limit: u32, window: Duration) -> Self {
        self.submit_limit = limit;
        self.submit_window = window;
        self
    }
}

/// Shared, cloneable handle to all limiter state.
#[derive(Clone)]
pub struct RateLimiterService<S: LimiterStore> {
    buckets: TokenBucketLimiter<S>,
    windows: SlidingWindowLimiter<S>,
    penalties: BurstPenaltyLimiter<S>,
    hierarchy: HierarchicalLimiter<TokenBucketLimiter<S>>,
    adaptive: AdaptiveLimiter<TokenBucketLimiter<S>>,
    policies: Arc<DomainPolicyTable>,
    store: S,
    clock: SharedClock,
    config: LimiterConfig,
}

impl<S: LimiterStore> RateLimiterService<S> {
    pub fn new(
        store: S,
        policies: DomainPolicyTable,
        load: Arc<dyn LoadSource>,
        clock: SharedClock,
        config: LimiterConfig,
    ) -> Self {
        let buckets = TokenBucketLimiter::new(
            store.clone(),
            clock.clone(),
            config.store_timeout,
            config.bucket_idle_ttl,
        )
        .with_max_buckets(config.max_buckets);
        Self {
            windows: SlidingWindowLimiter::new(store.clone(), clock.clone(), config.store_timeout),
            penalties: BurstPenaltyLimiter::new(store.clone(), clock.clone(), config.store_timeout),
            hierarchy: HierarchicalLimiter::new(buckets.clone(), config.hierarchy),
            adaptive: AdaptiveLimiter::new(buckets.clone(), load),
            buckets,
            policies: Arc::new(policies),
            store,
            clock,
            config,
        }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn policies(&self) -> &DomainPolicyTable {
        &self.policies
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn current_load(&self) -> f64 {
        self.adaptive.current_load()
    }

    pub async fn check_token_bucket(&self, key: &str, policy: &LimitPolicy) -> RateLimitDecision {
        self.buckets.check(key, policy).await
    }

    pub async fn check_sliding_window(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> RateLimitDecision {
        self.windows.check(key, limit, window).await
    }

    pub async fn check_hierarchical(&self, identity: &ClientIdentity) -> HierarchicalOutcome {
        self.hierarchy.check(identity).await
    }

    pub async fn check_adaptive(&self, key: &str, base: &LimitPolicy) -> RateLimitDecision {
        self.adaptive.check(key, base).await
    }

    /// Token bucket for `key`, behind a burst penalty when `burst` is set.
    pub async fn check_with_penalty(
        &self,
        key: &str,
        policy: &LimitPolicy,
        burst: Option<&BurstPolicy>,
    ) -> RateLimitDecision {
        self.penalties
            .check(key, burst, || self.buckets.check(key, policy))
            .await
    }

    /// Sliding window on job submissions, keyed by the most specific
    /// identifier the client presented.
    pub async fn check_submission(&self, identity: &ClientIdentity) -> RateLimitDecision {
        let principal = identity.principal().unwrap_or("anonymous");
        self.windows
            .check(
                &format!("submit:{principal}"),
                self.config.submit_limit,
                self.config.submit_window,
            )
            .await
    }

    /// Limiter key for a job's target domain.
    pub fn job_key(job: &ExtractionJob) -> Option<String> {
        let domain = job.domain()?;
        Some(match &job.scope {
            Some(scope) => format!("domain:{domain}@{}", scope.to_lowercase()),
            None => format!("domain:{domain}"),
        })
    }

    /// Pre-dispatch gate for a job's target domain.
    ///
    /// Adaptive token bucket seeded from the domain policy, wrapped in the
    /// burst penalty when the policy carries a burst allowance.
    pub async fn admit_job(&self, job: &ExtractionJob) -> RateLimitDecision {
        let (Some(domain), Some(key)) = (job.domain(), Self::job_key(job)) else {
            tracing::warn!(job_id = %job.id, url = %job.url, "No domain for job, admitting");
            return RateLimitDecision::allow(0, 0, Duration::ZERO);
        };

        let policy = self.policies.resolve(&domain, job.scope.as_deref());
        let base = policy.limit_policy();
        let burst = policy.burst_policy();

        let decision = self
            .penalties
            .check(&key, burst.as_ref(), || self.adaptive.check(&key, &base))
            .await;
        if !decision.allowed {
            tracing::debug!(
                job_id = %job.id,
                %key,
                retry_after_ms = decision.wait().as_millis() as u64,
                "Job denied by domain limit"
            );
        }
        decision
    }

    /// Remaining penalty on a key, if any.
    pub async fn penalty_remaining(&self, key: &str) -> Option<Duration> {
        self.penalties.remaining(key).await
    }

    /// Evict idle buckets. Returns the number still tracked.
    pub async fn prune_idle_buckets(&self) -> u64 {
        self.buckets.prune_idle().await
    }

    /// Sweep expired entries from the limiter store.
    pub async fn purge_store(&self) -> Result<u64, AppError> {
        tokio::time::timeout(self.config.store_timeout * 10, self.store.purge_expired())
            .await
            .map_err(|_| AppError::StoreError("limiter store purge timed out".into()))?
    }
}
