//! Runtime choice between in-memory and PostgreSQL implementations.
//!
//! The server and CLI pick a backend once at startup; everything downstream
//! stays monomorphic over these enums.

use std::time::Duration;

use chrono::{DateTime, Utc};
use skimmer_core::clock::SharedClock;
use skimmer_core::error::AppError;
use skimmer_core::job::{ExtractionJob, JobDefaults, JobProgress, JobResult, JobStatus, NewJob};
use skimmer_core::job_queue::JobQueue;
use skimmer_core::memory_queue::MemoryJobQueue;
use skimmer_core::models::{NewContent, NewMedia};
use skimmer_core::ratelimit::{LimiterStore, MemoryLimiterStore, WindowAdmission};
use skimmer_core::traits::{ContentStore, NullContentStore};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::database::Database;
use crate::job_repository::ExtractionJobRepository;
use crate::limiter_store::PgLimiterStore;
use crate::repository::ContentRepository;

/// Job queue selected at startup.
#[derive(Clone)]
pub enum QueueBackend {
    Memory(MemoryJobQueue),
    Postgres(ExtractionJobRepository),
}

/// Content store selected at startup. `Discard` keeps nothing.
#[derive(Clone)]
pub enum ContentBackend {
    Discard(NullContentStore),
    Postgres(ContentRepository),
}

/// Limiter store selected at startup.
#[derive(Clone)]
pub enum StoreBackend {
    Memory(MemoryLimiterStore),
    Postgres(PgLimiterStore),
}

macro_rules! dispatch {
    ($self:ident, $enum:ident { $($variant:ident),+ }, $inner:ident => $body:expr) => {
        match $self {
            $($enum::$variant($inner) => $body,)+
        }
    };
}

impl QueueBackend {
    pub fn name(&self) -> &'static str {
        match self {
            QueueBackend::Memory(_) => "memory",
            QueueBackend::Postgres(_) => "postgres",
        }
    }
}

impl JobQueue for QueueBackend {
    async fn enqueue(&self, request: NewJob) -> Result<ExtractionJob, AppError> {
        dispatch!(self, QueueBackend { Memory, Postgres }, q => q.enqueue(request).await)
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<ExtractionJob>, AppError> {
        dispatch!(self, QueueBackend { Memory, Postgres }, q => q.claim(worker_id).await)
    }

    async fn defer(
        &self,
        job_id: Uuid,
        worker_id: &str,
        not_before: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        dispatch!(self, QueueBackend { Memory, Postgres }, q => q.defer(job_id, worker_id, not_before).await)
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        progress: JobProgress,
    ) -> Result<(), AppError> {
        dispatch!(self, QueueBackend { Memory, Postgres }, q => {
            q.update_progress(job_id, worker_id, progress).await
        })
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: JobResult,
    ) -> Result<bool, AppError> {
        dispatch!(self, QueueBackend { Memory, Postgres }, q => q.complete(job_id, worker_id, result).await)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool, AppError> {
        dispatch!(self, QueueBackend { Memory, Postgres }, q => {
            q.fail(job_id, worker_id, error, retry_at).await
        })
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool, AppError> {
        dispatch!(self, QueueBackend { Memory, Postgres }, q => q.cancel(job_id).await)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<ExtractionJob>, AppError> {
        dispatch!(self, QueueBackend { Memory, Postgres }, q => q.get(job_id).await)
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<ExtractionJob>, AppError> {
        dispatch!(self, QueueBackend { Memory, Postgres }, q => q.list(status, limit).await)
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64, AppError> {
        dispatch!(self, QueueBackend { Memory, Postgres }, q => q.count_by_status(status).await)
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        dispatch!(self, QueueBackend { Memory, Postgres }, q => q.release_worker_jobs(worker_id).await)
    }

    async fn requeue_orphaned(&self, stale_before: DateTime<Utc>) -> Result<u64, AppError> {
        dispatch!(self, QueueBackend { Memory, Postgres }, q => q.requeue_orphaned(stale_before).await)
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        dispatch!(self, QueueBackend { Memory, Postgres }, q => q.purge_terminal(older_than).await)
    }
}

impl ContentStore for ContentBackend {
    async fn save_content(&self, content: NewContent) -> Result<Uuid, AppError> {
        dispatch!(self, ContentBackend { Discard, Postgres }, c => c.save_content(content).await)
    }

    async fn save_media(&self, media: NewMedia) -> Result<(), AppError> {
        dispatch!(self, ContentBackend { Discard, Postgres }, c => c.save_media(media).await)
    }
}

impl LimiterStore for StoreBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        dispatch!(self, StoreBackend { Memory, Postgres }, s => s.get(key).await)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        dispatch!(self, StoreBackend { Memory, Postgres }, s => s.set(key, value, ttl).await)
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        dispatch!(self, StoreBackend { Memory, Postgres }, s => s.delete(key).await)
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), AppError> {
        dispatch!(self, StoreBackend { Memory, Postgres }, s => s.zadd(key, score, member).await)
    }

    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<u64, AppError> {
        dispatch!(self, StoreBackend { Memory, Postgres }, s => s.zremrangebyscore(key, min, max).await)
    }

    async fn zcard(&self, key: &str) -> Result<u64, AppError> {
        dispatch!(self, StoreBackend { Memory, Postgres }, s => s.zcard(key).await)
    }

    async fn zoldest(&self, key: &str) -> Result<Option<i64>, AppError> {
        dispatch!(self, StoreBackend { Memory, Postgres }, s => s.zoldest(key).await)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), AppError> {
        dispatch!(self, StoreBackend { Memory, Postgres }, s => s.expire(key, ttl).await)
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
        dispatch!(self, StoreBackend { Memory, Postgres }, s => {
            s.zadd_within_limit(key, prune_before, limit, score, member, ttl).await
        })
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        dispatch!(self, StoreBackend { Memory, Postgres }, s => s.purge_expired().await)
    }
}

/// One queue, content store and limiter store over the same backing.
#[derive(Clone)]
pub struct Backends {
    pub queue: QueueBackend,
    pub content: ContentBackend,
    pub store: StoreBackend,
    /// Set when backed by PostgreSQL.
    pub db: Option<Database>,
}

impl Backends {
    /// Single-process backends. Extracted content is discarded.
    pub fn memory(clock: SharedClock, defaults: JobDefaults) -> Self {
        Self {
            queue: QueueBackend::Memory(
                MemoryJobQueue::new(clock.clone()).with_defaults(defaults),
            ),
            content: ContentBackend::Discard(NullContentStore),
            store: StoreBackend::Memory(MemoryLimiterStore::new(clock)),
            db: None,
        }
    }

    pub fn postgres(db: Database, defaults: JobDefaults) -> Self {
        Self {
            queue: QueueBackend::Postgres(db.job_repo(defaults)),
            content: ContentBackend::Postgres(db.content_repo()),
            store: StoreBackend::Postgres(db.limiter_store()),
            db: Some(db),
        }
    }

    /// PostgreSQL (migrated) when `DATABASE_URL` is set, in-memory otherwise.
    pub async fn from_env(clock: SharedClock, defaults: JobDefaults) -> Result<Self, AppError> {
        let configured = std::env::var("DATABASE_URL").is_ok_and(|url| !url.trim().is_empty());
        if !configured {
            tracing::warn!("DATABASE_URL not set, using in-memory backends");
            return Ok(Self::memory(clock, defaults));
        }

        let db = Database::connect(&DatabaseConfig::from_env()?).await?;
        db.migrate().await?;
        Ok(Self::postgres(db, defaults))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skimmer_core::clock::ManualClock;

    #[tokio::test]
    async fn memory_queue_backend_delegates() {
        let clock = ManualClock::starting_now();
        let queue = QueueBackend::Memory(MemoryJobQueue::new(clock.shared()));
        assert_eq!(queue.name(), "memory");

        let job = queue.enqueue(NewJob::new("https://example.com")).await.unwrap();
        let claimed = queue.claim("w").await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(queue.count_by_status(JobStatus::Active).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn memory_store_backend_delegates() {
        let clock = ManualClock::starting_now();
        let store = StoreBackend::Memory(MemoryLimiterStore::new(clock.shared()));
        store.set("k", "v", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        clock.advance(Duration::from_secs(6));
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_backends_share_the_clock() {
        let clock = ManualClock::starting_now();
        let defaults = JobDefaults {
            max_attempts: 7,
            ..JobDefaults::default()
        };
        let backends = Backends::memory(clock.shared(), defaults);
        assert!(backends.db.is_none());
        assert!(matches!(backends.content, ContentBackend::Discard(_)));

        let job = backends
            .queue
            .enqueue(NewJob::new("https://example.com"))
            .await
            .unwrap();
        assert_eq!(job.max_attempts, 7);
    }
}
