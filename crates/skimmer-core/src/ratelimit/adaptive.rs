use std::sync::Arc;

use crate::ratelimit::types::{AdmissionCheck, LimitPolicy, RateLimitDecision};

/// Live load in `[0, 1]`. Out-of-range values are clamped by the limiter.
pub trait LoadSource: Send + Sync {
    fn load_factor(&self) -> f64;
}

/// Constant load, for wiring without a pool and for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedLoad(pub f64);

impl LoadSource for FixedLoad {
    fn load_factor(&self) -> f64 {
        self.0
    }
}

/// `max(1, floor(base × (1 − 0.5 × load)))`: full load halves the limit.
pub fn effective_limit(base: u32, load: f64) -> u32 {
    let load = if load.is_nan() { 0.0 } else { load.clamp(0.0, 1.0) };
    let scaled = (f64::from(base) * (1.0 - 0.5 * load)).floor() as u32;
    scaled.max(1)
}

/// Shrinks a token-bucket policy as load rises, then delegates.
#[derive(Clone)]
pub struct AdaptiveLimiter<L: AdmissionCheck> {
    inner: L,
    load: Arc<dyn LoadSource>,
}

impl<L: AdmissionCheck> AdaptiveLimiter<L> {
    pub fn new(inner: L, load: Arc<dyn LoadSource>) -> Self {
        Self { inner, load }
    }

    pub fn current_load(&self) -> f64 {
        self.load.load_factor()
    }

    pub fn adjusted_policy(&self, base: &LimitPolicy) -> LimitPolicy {
        base.with_capacity(effective_limit(base.capacity, self.current_load()))
    }

    pub async fn check(&self, key: &str, base: &LimitPolicy) -> RateLimitDecision {
        let adjusted = self.adjusted_policy(base);
        if adjusted.capacity != base.capacity {
            tracing::debug!(
                %key,
                base = base.capacity,
                effective = adjusted.capacity,
                "Adaptive limit reduced under load"
            );
        }
        self.inner.check(key, &adjusted).await
    }
}
