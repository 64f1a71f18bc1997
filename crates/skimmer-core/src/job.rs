use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{env_parse, env_positive};
use crate::error::AppError;
use crate::ratelimit::types::{ClientIdentity, duration_ms};
use crate::util::{domain_of, parse_job_url, rand_jitter_ms};

pub const DEFAULT_JOB_KIND: &str = "extract";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Status of an extraction job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Active,
    Delayed,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Active,
        JobStatus::Delayed,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Delayed => "delayed",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Waiting in the queue, not yet owned by a worker.
    pub fn is_waiting(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Delayed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "active" => Ok(JobStatus::Active),
            "delayed" => Ok(JobStatus::Delayed),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Last progress report for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub status: String,
    pub percentage: u8,
}

impl JobProgress {
    pub fn new(status: impl Into<String>, percentage: u8) -> Self {
        Self {
            status: status.into(),
            percentage: percentage.min(100),
        }
    }

    pub fn queued() -> Self {
        Self::new("queued", 0)
    }
}

impl Default for JobProgress {
    fn default() -> Self {
        Self::queued()
    }
}

/// Exponential backoff between transient failures.
///
/// Delay after the n-th failed attempt is `base × 2^(n-1)`, capped at `max`.
/// With `jitter`, up to a quarter of the delay is added on top (still capped).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(rename = "base_ms", with = "duration_ms")]
    pub base: Duration,
    #[serde(rename = "max_ms", with = "duration_ms")]
    pub max: Duration,
    #[serde(default)]
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retrying after `attempt` failures (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max);
        if !self.jitter {
            return delay;
        }
        let extra = rand_jitter_ms(delay.as_millis() as u64 / 4);
        (delay + Duration::from_millis(extra)).min(self.max)
    }
}

/// Outcome of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub content_id: Uuid,
    pub title: Option<String>,
}

/// An extraction job in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub id: Uuid,
    pub url: String,
    pub kind: String,
    /// Policy sub-scope (e.g. proxy strategy) used when resolving domain limits.
    pub scope: Option<String>,
    pub identity: ClientIdentity,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub not_before: DateTime<Utc>,
    pub worker_id: Option<String>,
}

impl ExtractionJob {
    /// Materialize a validated request as a queued job.
    pub fn from_request(request: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: request.url,
            kind: request.kind,
            scope: request.scope,
            identity: request.identity,
            priority: request.priority,
            attempts: 0,
            max_attempts: request.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            backoff: request.backoff.unwrap_or_default(),
            status: JobStatus::Queued,
            progress: JobProgress::queued(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            not_before: now,
            worker_id: None,
        }
    }

    /// Whether a transient failure of the current attempt leaves room to retry.
    pub fn can_retry(&self) -> bool {
        self.attempts + 1 < self.max_attempts
    }

    /// When to retry after the current attempt fails.
    pub fn next_retry_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.backoff.delay_for_attempt(self.attempts + 1);
        now + TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX)
    }

    pub fn domain(&self) -> Option<String> {
        domain_of(&self.url)
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_waiting() && self.not_before <= now
    }
}

/// Request to enqueue a new extraction job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub url: String,
    pub kind: String,
    pub scope: Option<String>,
    pub identity: ClientIdentity,
    pub priority: i32,
    pub max_attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
}

impl NewJob {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: DEFAULT_JOB_KIND.to_string(),
            scope: None,
            identity: ClientIdentity::default(),
            priority: 0,
            max_attempts: None,
            backoff: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Fill unset attempt/backoff settings from deployment defaults.
    pub fn with_defaults(mut self, defaults: &JobDefaults) -> Self {
        self.max_attempts.get_or_insert(defaults.max_attempts);
        self.backoff.get_or_insert(defaults.backoff);
        self
    }

    /// Reject requests that must never reach the queue.
    pub fn validate(&self) -> Result<(), AppError> {
        parse_job_url(&self.url)?;
        if self.kind.trim().is_empty() {
            return Err(AppError::ValidationError("type must not be empty".into()));
        }
        if self.max_attempts == Some(0) {
            return Err(AppError::ValidationError(
                "max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Deployment-wide defaults applied to requests that do not set their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDefaults {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl JobDefaults {
    /// - `SKIMMER_MAX_ATTEMPTS` (default 3)
    /// - `SKIMMER_BACKOFF_BASE_MS` (default 1000)
    pub fn from_env() -> Result<Self, AppError> {
        let max_attempts = env_positive("SKIMMER_MAX_ATTEMPTS", u64::from(DEFAULT_MAX_ATTEMPTS))?;
        let max_attempts = u32::try_from(max_attempts).map_err(|_| {
            AppError::ConfigError("SKIMMER_MAX_ATTEMPTS is out of range".into())
        })?;
        let base_ms = env_positive("SKIMMER_BACKOFF_BASE_MS", 1_000)?;
        let defaults = BackoffPolicy::default();
        Ok(Self {
            max_attempts,
            backoff: BackoffPolicy {
                base: Duration::from_millis(base_ms),
                max: defaults.max.max(Duration::from_millis(base_ms)),
                jitter: env_parse("SKIMMER_BACKOFF_JITTER", false)?,
            },
        })
    }
}

/// Configuration for a single worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
    pub extract_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]),
            poll_interval: Duration::from_secs(1),
            extract_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_extract_timeout(mut self, timeout: Duration) -> Self {
        self.extract_timeout = timeout;
        self
    }
}

/// Configuration for a pool of workers.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    /// Prefix for worker ids; each worker appends its index.
    pub name: String,
    pub poll_interval: Duration,
    pub extract_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let worker = WorkerConfig::default();
        Self {
            workers: 4,
            name: worker.worker_id,
            poll_interval: worker.poll_interval,
            extract_timeout: worker.extract_timeout,
        }
    }
}

impl PoolConfig {
    /// - `SKIMMER_WORKERS` (default 4)
    /// - `SKIMMER_POLL_INTERVAL_MS` (default 1000)
    /// - `SKIMMER_EXTRACT_TIMEOUT_SECS` (default 60)
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();
        Ok(Self {
            workers: env_positive("SKIMMER_WORKERS", defaults.workers as u64)? as usize,
            name: defaults.name,
            poll_interval: Duration::from_millis(env_positive("SKIMMER_POLL_INTERVAL_MS", 1_000)?),
            extract_timeout: Duration::from_secs(env_positive("SKIMMER_EXTRACT_TIMEOUT_SECS", 60)?),
        })
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_extract_timeout(mut self, timeout: Duration) -> Self {
        self.extract_timeout = timeout;
        self
    }

    pub fn worker_config(&self, index: usize) -> WorkerConfig {
        WorkerConfig {
            worker_id: format!("{}-{index}", self.name),
            poll_interval: self.poll_interval,
            extract_timeout: self.extract_timeout,
        }
    }
}
