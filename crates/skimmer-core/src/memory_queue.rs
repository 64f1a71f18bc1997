//! Single-process [`JobQueue`].
//!
//! All state sits behind one mutex, which makes `claim` atomic across the
//! worker pool. State changes to an active job (`defer`, `complete`, `fail`)
//! only apply while the job is still active under the calling worker,
//! matching the conditional updates of the Postgres queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::{SharedClock, system_clock};
use crate::error::AppError;
use crate::job::{ExtractionJob, JobDefaults, JobProgress, JobResult, JobStatus, NewJob};
use crate::job_queue::JobQueue;

#[derive(Debug, Default)]
struct QueueInner {
    jobs: HashMap<Uuid, QueuedJob>,
    next_seq: u64,
}

#[derive(Debug)]
struct QueuedJob {
    // Insertion order, breaks ties between equal `created_at` values.
    seq: u64,
    job: ExtractionJob,
}

#[derive(Debug, Clone)]
pub struct MemoryJobQueue {
    inner: Arc<Mutex<QueueInner>>,
    clock: SharedClock,
    defaults: JobDefaults,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(system_clock())
    }
}

impl MemoryJobQueue {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner::default())),
            clock,
            defaults: JobDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: JobDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned job queue mutex");
            poisoned.into_inner()
        })
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Apply `f` to `job_id` if it is active and owned by `worker_id`.
    fn update_owned(
        &self,
        job_id: Uuid,
        worker_id: &str,
        f: impl FnOnce(&mut ExtractionJob, DateTime<Utc>),
    ) -> bool {
        let now = self.now();
        let mut inner = self.lock_inner();
        match inner.jobs.get_mut(&job_id) {
            Some(entry)
                if entry.job.status == JobStatus::Active
                    && entry.job.worker_id.as_deref() == Some(worker_id) =>
            {
                f(&mut entry.job, now);
                entry.job.updated_at = now;
                true
            }
            Some(entry) => {
                tracing::debug!(
                    %job_id,
                    %worker_id,
                    status = %entry.job.status,
                    owner = ?entry.job.worker_id,
                    "Ignoring update from non-owner"
                );
                false
            }
            None => {
                tracing::debug!(%job_id, "Ignoring update to unknown job");
                false
            }
        }
    }

    fn requeue(job: &mut ExtractionJob, now: DateTime<Utc>) {
        job.status = JobStatus::Queued;
        job.worker_id = None;
        job.started_at = None;
        job.updated_at = now;
    }
}

impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, request: NewJob) -> Result<ExtractionJob, AppError> {
        request.validate()?;
        let job = ExtractionJob::from_request(request.with_defaults(&self.defaults), self.now());

        let mut inner = self.lock_inner();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(
            job.id,
            QueuedJob {
                seq,
                job: job.clone(),
            },
        );
        Ok(job)
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<ExtractionJob>, AppError> {
        let now = self.now();
        let mut inner = self.lock_inner();

        let next = inner
            .jobs
            .values()
            .filter(|entry| entry.job.is_ready(now))
            .min_by(|a, b| {
                b.job
                    .priority
                    .cmp(&a.job.priority)
                    .then(a.job.created_at.cmp(&b.job.created_at))
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|entry| entry.job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(entry) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        let job = &mut entry.job;
        job.status = JobStatus::Active;
        job.worker_id = Some(worker_id.to_string());
        job.started_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn defer(
        &self,
        job_id: Uuid,
        worker_id: &str,
        not_before: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        Ok(self.update_owned(job_id, worker_id, |job, _| {
            job.status = JobStatus::Delayed;
            job.not_before = not_before;
            job.worker_id = None;
            job.started_at = None;
        }))
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        progress: JobProgress,
    ) -> Result<(), AppError> {
        self.update_owned(job_id, worker_id, |job, _| job.progress = progress);
        Ok(())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: JobResult,
    ) -> Result<bool, AppError> {
        Ok(self.update_owned(job_id, worker_id, |job, now| {
            job.status = JobStatus::Completed;
            job.progress = JobProgress::new("completed", 100);
            job.result = Some(result);
            job.error = None;
            job.completed_at = Some(now);
            job.worker_id = None;
        }))
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool, AppError> {
        Ok(self.update_owned(job_id, worker_id, |job, now| {
            job.attempts += 1;
            job.error = Some(error.to_string());
            job.worker_id = None;
            match retry_at {
                Some(at) => {
                    job.status = JobStatus::Delayed;
                    job.not_before = at;
                    job.started_at = None;
                }
                None => {
                    job.status = JobStatus::Failed;
                    job.progress = JobProgress::new("failed", job.progress.percentage);
                    job.completed_at = Some(now);
                }
            }
        }))
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool, AppError> {
        let now = self.now();
        let mut inner = self.lock_inner();
        let entry = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))?;
        if !entry.job.status.is_waiting() {
            return Ok(false);
        }
        entry.job.status = JobStatus::Cancelled;
        entry.job.completed_at = Some(now);
        entry.job.updated_at = now;
        Ok(true)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<ExtractionJob>, AppError> {
        Ok(self.lock_inner().jobs.get(&job_id).map(|e| e.job.clone()))
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<ExtractionJob>, AppError> {
        let inner = self.lock_inner();
        let mut entries: Vec<&QueuedJob> = inner
            .jobs
            .values()
            .filter(|e| status.is_none_or(|s| e.job.status == s))
            .collect();
        entries.sort_by(|a, b| {
            b.job
                .created_at
                .cmp(&a.job.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        Ok(entries
            .into_iter()
            .take(limit)
            .map(|e| e.job.clone())
            .collect())
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64, AppError> {
        let inner = self.lock_inner();
        Ok(inner.jobs.values().filter(|e| e.job.status == status).count() as i64)
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let now = self.now();
        let mut inner = self.lock_inner();
        let mut released = 0;
        for entry in inner.jobs.values_mut() {
            if entry.job.status == JobStatus::Active
                && entry.job.worker_id.as_deref() == Some(worker_id)
            {
                Self::requeue(&mut entry.job, now);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn requeue_orphaned(&self, stale_before: DateTime<Utc>) -> Result<u64, AppError> {
        let now = self.now();
        let mut inner = self.lock_inner();
        let mut requeued = 0;
        for entry in inner.jobs.values_mut() {
            let stale = entry.job.status == JobStatus::Active
                && entry.job.started_at.is_some_and(|s| s < stale_before);
            if stale {
                tracing::warn!(job_id = %entry.job.id, worker_id = ?entry.job.worker_id, "Requeueing orphaned job");
                Self::requeue(&mut entry.job, now);
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let mut inner = self.lock_inner();
        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, e| !(e.job.status.is_terminal() && e.job.updated_at < older_than));
        Ok((before - inner.jobs.len()) as u64)
    }
}
