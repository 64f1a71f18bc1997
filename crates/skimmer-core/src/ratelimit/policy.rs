//! Static per-domain limiter configuration.
//!
//! Loaded once at startup, either from the built-in table or from a JSON
//! file named by `SKIMMER_DOMAIN_POLICIES`:
//!
//! ```json
//! {
//!   "default": { "requests": 30, "window_ms": 60000, "cooldown_ms": 60000 },
//!   "domains": {
//!     "instagram.com": {
//!       "requests": 10, "window_ms": 60000, "burst": 2, "cooldown_ms": 600000,
//!       "scopes": { "residential": { "requests": 20, "window_ms": 60000, "cooldown_ms": 300000 } }
//!     }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::ratelimit::penalty::BurstPolicy;
use crate::ratelimit::types::{LimitPolicy, duration_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainPolicy {
    pub requests: u32,
    #[serde(rename = "window_ms", with = "duration_ms")]
    pub window: Duration,
    #[serde(default)]
    pub burst: Option<u32>,
    #[serde(rename = "cooldown_ms", with = "duration_ms")]
    pub cooldown: Duration,
}

impl DomainPolicy {
    pub const fn new(requests: u32, window: Duration) -> Self {
        Self {
            requests,
            window,
            burst: None,
            cooldown: Duration::from_secs(60),
        }
    }

    pub const fn with_burst(mut self, burst: u32, cooldown: Duration) -> Self {
        self.burst = Some(burst);
        self.cooldown = cooldown;
        self
    }

    /// Token-bucket policy seeded from this entry.
    ///
    /// The burst allowance adds headroom to the capacity; the window is
    /// stretched to match so the steady rate stays `requests / window`.
    pub fn limit_policy(&self) -> LimitPolicy {
        let burst = self.burst.unwrap_or(0);
        if burst == 0 || self.requests == 0 {
            return LimitPolicy::new(self.requests, self.window);
        }
        let capacity = self.requests.saturating_add(burst);
        let stretch = f64::from(capacity) / f64::from(self.requests);
        LimitPolicy::new(
            capacity,
            Duration::from_secs_f64(self.window.as_secs_f64() * stretch),
        )
    }

    /// Penalty configuration, present only when a burst allowance is set.
    pub fn burst_policy(&self) -> Option<BurstPolicy> {
        self.burst.map(|burst| BurstPolicy::new(burst, self.cooldown))
    }
}

impl Default for DomainPolicy {
    fn default() -> Self {
        Self::new(30, Duration::from_secs(60))
    }
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    default: DomainPolicy,
    #[serde(default)]
    domains: HashMap<String, DomainEntry>,
}

#[derive(Debug, Deserialize)]
struct DomainEntry {
    #[serde(flatten)]
    policy: DomainPolicy,
    #[serde(default)]
    scopes: HashMap<String, DomainPolicy>,
}

/// Domain → policy lookup with optional sub-scopes (e.g. proxy strategy).
#[derive(Debug, Clone)]
pub struct DomainPolicyTable {
    default: DomainPolicy,
    domains: HashMap<String, DomainPolicy>,
    scoped: HashMap<(String, String), DomainPolicy>,
}

impl DomainPolicyTable {
    pub fn new(default: DomainPolicy) -> Self {
        Self {
            default,
            domains: HashMap::new(),
            scoped: HashMap::new(),
        }
    }

    pub fn with_domain(mut self, domain: &str, policy: DomainPolicy) -> Self {
        self.domains.insert(normalize(domain), policy);
        self
    }

    pub fn with_scoped(mut self, domain: &str, scope: &str, policy: DomainPolicy) -> Self {
        self.scoped
            .insert((normalize(domain), scope.to_lowercase()), policy);
        self
    }

    /// Policies shipped with the service.
    pub fn builtin() -> Self {
        let minute = Duration::from_secs(60);
        Self::new(DomainPolicy::default())
            .with_domain(
                "twitter.com",
                DomainPolicy::new(15, minute).with_burst(5, Duration::from_secs(300)),
            )
            .with_domain(
                "x.com",
                DomainPolicy::new(15, minute).with_burst(5, Duration::from_secs(300)),
            )
            .with_domain(
                "instagram.com",
                DomainPolicy::new(10, minute).with_burst(2, Duration::from_secs(600)),
            )
            .with_scoped(
                "instagram.com",
                "residential",
                DomainPolicy::new(20, minute).with_burst(4, Duration::from_secs(300)),
            )
            .with_domain("facebook.com", DomainPolicy::new(10, minute))
            .with_domain(
                "linkedin.com",
                DomainPolicy::new(5, minute).with_burst(1, Duration::from_secs(900)),
            )
            .with_domain("tiktok.com", DomainPolicy::new(10, minute))
            .with_domain(
                "reddit.com",
                DomainPolicy::new(30, minute).with_burst(10, Duration::from_secs(120)),
            )
            .with_domain("medium.com", DomainPolicy::new(20, minute))
            .with_domain("youtube.com", DomainPolicy::new(60, minute))
    }

    pub fn from_json_str(raw: &str) -> Result<Self, AppError> {
        let file: PolicyFile = serde_json::from_str(raw)
            .map_err(|e| AppError::ConfigError(format!("Invalid domain policy file: {e}")))?;

        let mut table = Self::new(file.default);
        for (domain, entry) in file.domains {
            for (scope, policy) in entry.scopes {
                table = table.with_scoped(&domain, &scope, policy);
            }
            table = table.with_domain(&domain, entry.policy);
        }
        Ok(table)
    }

    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!(
                "Failed to read domain policy file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json_str(&raw)
    }

    /// `SKIMMER_DOMAIN_POLICIES` (a JSON file path) if set, else [`Self::builtin`].
    pub fn from_env() -> Result<Self, AppError> {
        match std::env::var("SKIMMER_DOMAIN_POLICIES") {
            Ok(path) if !path.trim().is_empty() => {
                let table = Self::from_file(Path::new(path.trim()))?;
                tracing::info!(%path, domains = table.len(), "Loaded domain policies");
                Ok(table)
            }
            _ => Ok(Self::builtin()),
        }
    }

    pub fn default_policy(&self) -> &DomainPolicy {
        &self.default
    }

    /// Number of unscoped domain entries.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Every explicit entry as `(domain, scope, policy)`, sorted by domain
    /// with the unscoped entry before its scopes.
    pub fn entries(&self) -> Vec<(String, Option<String>, DomainPolicy)> {
        let mut entries: Vec<_> = self
            .domains
            .iter()
            .map(|(domain, policy)| (domain.clone(), None, *policy))
            .chain(
                self.scoped
                    .iter()
                    .map(|((domain, scope), policy)| (domain.clone(), Some(scope.clone()), *policy)),
            )
            .collect();
        entries.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        entries
    }

    /// Resolve the policy for `domain`, most specific first: scoped entry,
    /// unscoped entry, then the same for each parent domain, then default.
    pub fn resolve(&self, domain: &str, scope: Option<&str>) -> &DomainPolicy {
        let scope = scope.map(str::to_lowercase);
        let mut candidate = normalize(domain);

        loop {
            if let Some(scope) = &scope
                && let Some(policy) = self.scoped.get(&(candidate.clone(), scope.clone()))
            {
                return policy;
            }
            if let Some(policy) = self.domains.get(&candidate) {
                return policy;
            }
            match candidate.split_once('.') {
                Some((_, parent)) if parent.contains('.') => candidate = parent.to_string(),
                _ => return &self.default,
            }
        }
    }
}

impl Default for DomainPolicyTable {
    fn default() -> Self {
        Self::builtin()
    }
}

fn normalize(domain: &str) -> String {
    let domain = domain.trim().trim_end_matches('.').to_lowercase();
    match domain.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => domain,
    }
}
