//! Periodic housekeeping, registered at process start and stopped through
//! its cancellation token.

use std::time::Duration;

use chrono::TimeDelta;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::env_positive;
use crate::error::AppError;
use crate::job_queue::JobQueue;
use crate::ratelimit::service::RateLimiterService;
use crate::ratelimit::store::LimiterStore;

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub interval: Duration,
    /// Active jobs started longer ago than this are presumed orphaned.
    /// Must exceed the extract timeout.
    pub orphan_timeout: Duration,
    /// Terminal jobs are deleted this long after their last update.
    pub retention: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            orphan_timeout: Duration::from_secs(600),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl MaintenanceConfig {
    /// - `SKIMMER_MAINTENANCE_INTERVAL_SECS` (default 60)
    /// - `SKIMMER_ORPHAN_TIMEOUT_SECS` (default 600)
    /// - `SKIMMER_RETENTION_HOURS` (default 168)
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self {
            interval: Duration::from_secs(env_positive("SKIMMER_MAINTENANCE_INTERVAL_SECS", 60)?),
            orphan_timeout: Duration::from_secs(env_positive("SKIMMER_ORPHAN_TIMEOUT_SECS", 600)?),
            retention: Duration::from_secs(env_positive("SKIMMER_RETENTION_HOURS", 168)? * 3600),
        })
    }
}

/// Counts from one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub orphans_requeued: u64,
    pub jobs_purged: u64,
    pub buckets_tracked: u64,
    pub store_entries_purged: u64,
}

pub struct MaintenanceTask<Q: JobQueue, S: LimiterStore> {
    queue: Q,
    limiter: RateLimiterService<S>,
    config: MaintenanceConfig,
}

impl<Q: JobQueue + 'static, S: LimiterStore> MaintenanceTask<Q, S> {
    pub fn new(queue: Q, limiter: RateLimiterService<S>, config: MaintenanceConfig) -> Self {
        Self {
            queue,
            limiter,
            config,
        }
    }

    /// One pass. Each step runs even if an earlier one failed.
    pub async fn run_once(&self) -> MaintenanceReport {
        let now = self.limiter.clock().now();
        let mut report = MaintenanceReport::default();

        let stale_before = now - to_delta(self.config.orphan_timeout);
        match self.queue.requeue_orphaned(stale_before).await {
            Ok(n) => report.orphans_requeued = n,
            Err(e) => tracing::error!(error = %e, "Orphan requeue failed"),
        }

        let older_than = now - to_delta(self.config.retention);
        match self.queue.purge_terminal(older_than).await {
            Ok(n) => report.jobs_purged = n,
            Err(e) => tracing::error!(error = %e, "Job retention purge failed"),
        }

        report.buckets_tracked = self.limiter.prune_idle_buckets().await;

        match self.limiter.purge_store().await {
            Ok(n) => report.store_entries_purged = n,
            Err(e) => tracing::warn!(error = %e, "Limiter store purge failed"),
        }

        tracing::debug!(?report, "Maintenance pass finished");
        report
    }

    /// Run every `interval` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            "Maintenance task started"
        );
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.config.interval) => {}
                () = cancel.cancelled() => break,
            }
            self.run_once().await;
        }
        tracing::info!("Maintenance task stopped");
    }

    pub fn spawn(self, tracker: &TaskTracker, cancel: &CancellationToken) {
        tracker.spawn(self.run(cancel.clone()));
    }
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}
