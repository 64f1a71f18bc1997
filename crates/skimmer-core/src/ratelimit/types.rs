use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::compute_hash;

/// Capacity and window for a single token-bucket style check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitPolicy {
    pub capacity: u32,
    #[serde(with = "duration_ms")]
    pub window: Duration,
}

impl LimitPolicy {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self { capacity, window }
    }

    pub fn per_minute(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(60))
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        let window = self.window.as_secs_f64();
        if window <= 0.0 {
            return f64::from(self.capacity);
        }
        f64::from(self.capacity) / window
    }

    pub fn with_capacity(self, capacity: u32) -> Self {
        Self { capacity, ..self }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the key is fully replenished.
    pub reset_after: Duration,
    /// Set on denials: how long the caller should wait.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    pub fn allow(limit: u32, remaining: u32, reset_after: Duration) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_after,
            retry_after: None,
        }
    }

    pub fn deny(limit: u32, reset_after: Duration, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_after,
            retry_after: Some(retry_after),
        }
    }

    /// Wait before the next attempt; zero when allowed.
    pub fn wait(&self) -> Duration {
        self.retry_after.unwrap_or(Duration::ZERO)
    }
}

/// Who is asking. Every component is optional; absent levels are skipped.
///
/// The bearer key is never held in clear: `api_key_hash` is its SHA-256
/// fingerprint, which is what limiter keys and persisted jobs see.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub ip: Option<String>,
    pub user_id: Option<String>,
    pub api_key_hash: Option<String>,
}

impl ClientIdentity {
    pub fn from_ip(ip: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach a bearer key, keeping only its fingerprint.
    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key_hash = Some(api_key_fingerprint(api_key));
        self
    }

    /// Most specific identifier, used for per-client sliding windows.
    pub fn principal(&self) -> Option<&str> {
        self.api_key_hash
            .as_deref()
            .or(self.user_id.as_deref())
            .or(self.ip.as_deref())
    }
}

/// Hex SHA-256 of a bearer key.
pub fn api_key_fingerprint(api_key: &str) -> String {
    compute_hash(api_key)
}

/// Scope evaluated by the hierarchical limiter, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitLevel {
    Ip,
    User,
    ApiKey,
}

impl LimitLevel {
    pub const ORDER: [LimitLevel; 3] = [LimitLevel::Ip, LimitLevel::User, LimitLevel::ApiKey];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitLevel::Ip => "ip",
            LimitLevel::User => "user",
            LimitLevel::ApiKey => "api_key",
        }
    }
}

impl fmt::Display for LimitLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A keyed check against a capacity/window policy.
///
/// Implemented by the token bucket; the hierarchical and adaptive limiters
/// are generic over it.
pub trait AdmissionCheck: Send + Sync + Clone {
    fn check(
        &self,
        key: &str,
        policy: &LimitPolicy,
    ) -> impl Future<Output = RateLimitDecision> + Send;
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
