//! Admission control for job dispatch and the API surface.
//!
//! [`RateLimiterService`] composes the individual limiters:
//!
//! - [`TokenBucketLimiter`]: continuous refill, per-key async lock
//! - [`SlidingWindowLimiter`]: exact count over a trailing window, fails open
//! - [`HierarchicalLimiter`]: ip → user → api key cascade
//! - [`AdaptiveLimiter`]: capacity scaled down under worker load
//! - [`BurstPenaltyLimiter`]: cooldown after a burst violation

pub mod adaptive;
pub mod hierarchical;
pub mod penalty;
pub mod policy;
pub mod service;
pub mod sliding_window;
pub mod store;
pub mod token_bucket;
pub mod types;

pub use adaptive::{AdaptiveLimiter, FixedLoad, LoadSource, effective_limit};
pub use hierarchical::{HierarchicalLimiter, HierarchicalOutcome, HierarchyPolicy};
pub use penalty::{BurstPenaltyLimiter, BurstPolicy};
pub use policy::{DomainPolicy, DomainPolicyTable};
pub use service::{LimiterConfig, RateLimiterService};
pub use sliding_window::SlidingWindowLimiter;
pub use store::{LimiterStore, MemoryLimiterStore, WindowAdmission};
pub use token_bucket::{Bucket, TokenBucketLimiter};
pub use types::{
    AdmissionCheck, ClientIdentity, LimitLevel, LimitPolicy, RateLimitDecision, api_key_fingerprint,
};
