use serde::{Deserialize, Serialize};

use crate::ratelimit::types::{
    AdmissionCheck, ClientIdentity, LimitLevel, LimitPolicy, RateLimitDecision,
};

/// One token-bucket policy per scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyPolicy {
    pub ip: LimitPolicy,
    pub user: LimitPolicy,
    pub api_key: LimitPolicy,
}

impl HierarchyPolicy {
    pub fn for_level(&self, level: LimitLevel) -> &LimitPolicy {
        match level {
            LimitLevel::Ip => &self.ip,
            LimitLevel::User => &self.user,
            LimitLevel::ApiKey => &self.api_key,
        }
    }
}

impl Default for HierarchyPolicy {
    fn default() -> Self {
        Self {
            ip: LimitPolicy::per_minute(60),
            user: LimitPolicy::per_minute(120),
            api_key: LimitPolicy::per_minute(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HierarchicalOutcome {
    /// Every evaluated level admitted the request.
    Allowed,
    /// The first level that denied, and its decision.
    Denied {
        level: LimitLevel,
        decision: RateLimitDecision,
    },
}

impl HierarchicalOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, HierarchicalOutcome::Allowed)
    }
}

/// Cascades ip → user → api key, stopping at the first denial.
#[derive(Clone)]
pub struct HierarchicalLimiter<L: AdmissionCheck> {
    inner: L,
    policy: HierarchyPolicy,
}

impl<L: AdmissionCheck> HierarchicalLimiter<L> {
    pub fn new(inner: L, policy: HierarchyPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &HierarchyPolicy {
        &self.policy
    }

    fn key_for(level: LimitLevel, identity: &ClientIdentity) -> Option<String> {
        let value = match level {
            LimitLevel::Ip => identity.ip.as_deref(),
            LimitLevel::User => identity.user_id.as_deref(),
            LimitLevel::ApiKey => identity.api_key_hash.as_deref(),
        }?;
        Some(format!("{}:{}", level.as_str(), value))
    }

    pub async fn check(&self, identity: &ClientIdentity) -> HierarchicalOutcome {
        for level in LimitLevel::ORDER {
            let Some(key) = Self::key_for(level, identity) else {
                continue;
            };
            let decision = self.inner.check(&key, self.policy.for_level(level)).await;
            if !decision.allowed {
                tracing::debug!(%level, %key, "Hierarchical limit denied");
                return HierarchicalOutcome::Denied { level, decision };
            }
        }
        HierarchicalOutcome::Allowed
    }
}
