use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{ExtractionJob, JobProgress, JobResult, JobStatus, NewJob};

/// Job queue for extraction jobs.
///
/// Implementations must claim atomically (`SELECT FOR UPDATE SKIP LOCKED`
/// or a process-wide lock) so no job is ever owned by two workers.
pub trait JobQueue: Send + Sync + Clone {
    /// Validate and enqueue. Invalid requests never enter the queue.
    fn enqueue(
        &self,
        request: NewJob,
    ) -> impl Future<Output = Result<ExtractionJob, AppError>> + Send;

    /// Atomically claim the ready job with the highest priority, oldest first
    /// within a priority level.
    ///
    /// Returns `None` if no jobs are ready.
    fn claim(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<Option<ExtractionJob>, AppError>> + Send;

    /// Hand an active job owned by `worker_id` back as `delayed` until
    /// `not_before`. Attempts are not touched.
    ///
    /// This and the other owner-scoped updates return `false`, changing
    /// nothing, when the job is no longer active under `worker_id`.
    fn defer(
        &self,
        job_id: Uuid,
        worker_id: &str,
        not_before: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn update_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        progress: JobProgress,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: JobResult,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Record a failed attempt. With `retry_at` the job becomes `delayed`;
    /// otherwise it is marked permanently `failed`.
    fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Cancel a queued or delayed job. Returns false if the job is active or
    /// already terminal, `NotFound` if it does not exist.
    fn cancel(&self, job_id: Uuid) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn get(
        &self,
        job_id: Uuid,
    ) -> impl Future<Output = Result<Option<ExtractionJob>, AppError>> + Send;

    /// Newest first.
    fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ExtractionJob>, AppError>> + Send;

    fn count_by_status(
        &self,
        status: JobStatus,
    ) -> impl Future<Output = Result<i64, AppError>> + Send;

    /// Release all jobs held by a specific worker (for graceful shutdown).
    fn release_worker_jobs(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Return active jobs started before `stale_before` to the queue.
    fn requeue_orphaned(
        &self,
        stale_before: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Delete terminal jobs last updated before `older_than`.
    fn purge_terminal(
        &self,
        older_than: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;
}
