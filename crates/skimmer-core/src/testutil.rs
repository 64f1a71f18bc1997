//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{ExtractionJob, JobProgress, JobResult, JobStatus, NewJob};
use crate::job_queue::JobQueue;
use crate::models::{ExtractedContent, NewContent, NewMedia};
use crate::ratelimit::store::{LimiterStore, WindowAdmission};
use crate::ratelimit::types::{AdmissionCheck, LimitPolicy, RateLimitDecision};
use crate::traits::{ContentStore, Extractor};
use crate::worker::{WorkerEvent, WorkerReporter};

// ---------------------------------------------------------------------------
// Limiter stores
// ---------------------------------------------------------------------------

/// Store whose every operation fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingLimiterStore;

fn store_down<T>() -> Result<T, AppError> {
    Err(AppError::StoreError("store unavailable".into()))
}

impl LimiterStore for FailingLimiterStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, AppError> {
        store_down()
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), AppError> {
        store_down()
    }

    async fn delete(&self, _key: &str) -> Result<(), AppError> {
        store_down()
    }

    async fn zadd(&self, _key: &str, _score: i64, _member: &str) -> Result<(), AppError> {
        store_down()
    }

    async fn zremrangebyscore(&self, _key: &str, _min: i64, _max: i64) -> Result<u64, AppError> {
        store_down()
    }

    async fn zcard(&self, _key: &str) -> Result<u64, AppError> {
        store_down()
    }

    async fn zoldest(&self, _key: &str) -> Result<Option<i64>, AppError> {
        store_down()
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), AppError> {
        store_down()
    }

    async fn zadd_within_limit(
        &self,
        _key: &str,
        _prune_before: i64,
        _limit: u64,
        _score: i64,
        _member: &str,
        _ttl: Duration,
    ) -> Result<WindowAdmission, AppError> {
        store_down()
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        store_down()
    }
}

/// Store whose every operation hangs forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct StallingLimiterStore;

impl LimiterStore for StallingLimiterStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, AppError> {
        std::future::pending().await
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), AppError> {
        std::future::pending().await
    }

    async fn delete(&self, _key: &str) -> Result<(), AppError> {
        std::future::pending().await
    }

    async fn zadd(&self, _key: &str, _score: i64, _member: &str) -> Result<(), AppError> {
        std::future::pending().await
    }

    async fn zremrangebyscore(&self, _key: &str, _min: i64, _max: i64) -> Result<u64, AppError> {
        std::future::pending().await
    }

    async fn zcard(&self, _key: &str) -> Result<u64, AppError> {
        std::future::pending().await
    }

    async fn zoldest(&self, _key: &str) -> Result<Option<i64>, AppError> {
        std::future::pending().await
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), AppError> {
        std::future::pending().await
    }

    async fn zadd_within_limit(
        &self,
        _key: &str,
        _prune_before: i64,
        _limit: u64,
        _score: i64,
        _member: &str,
        _ttl: Duration,
    ) -> Result<WindowAdmission, AppError> {
        std::future::pending().await
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        std::future::pending().await
    }
}

/// Store that yields to the scheduler before every operation, the way a
/// networked store would between round-trips.
#[derive(Debug, Clone)]
pub struct YieldingLimiterStore<S: LimiterStore> {
    inner: S,
}

impl<S: LimiterStore> YieldingLimiterStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: LimiterStore> LimiterStore for YieldingLimiterStore<S> {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        tokio::task::yield_now().await;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        tokio::task::yield_now().await;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        tokio::task::yield_now().await;
        self.inner.delete(key).await
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), AppError> {
        tokio::task::yield_now().await;
        self.inner.zadd(key, score, member).await
    }

    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<u64, AppError> {
        tokio::task::yield_now().await;
        self.inner.zremrangebyscore(key, min, max).await
    }

    async fn zcard(&self, key: &str) -> Result<u64, AppError> {
        tokio::task::yield_now().await;
        self.inner.zcard(key).await
    }

    async fn zoldest(&self, key: &str) -> Result<Option<i64>, AppError> {
        tokio::task::yield_now().await;
        self.inner.zoldest(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), AppError> {
        tokio::task::yield_now().await;
        self.inner.expire(key, ttl).await
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
        tokio::task::yield_now().await;
        self.inner
            .zadd_within_limit(key, prune_before, limit, score, member, ttl)
            .await
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        tokio::task::yield_now().await;
        self.inner.purge_expired().await
    }
}

// ---------------------------------------------------------------------------
// RecordingAdmission
// ---------------------------------------------------------------------------

/// Admission check that records every call and denies a fixed set of keys.
#[derive(Clone, Default)]
pub struct RecordingAdmission {
    deny: Arc<HashSet<String>>,
    calls: Arc<Mutex<Vec<(String, LimitPolicy)>>>,
}

impl RecordingAdmission {
    pub fn denying(keys: &[&str]) -> Self {
        Self {
            deny: Arc::new(keys.iter().map(|k| k.to_string()).collect()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn checked_keys(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn checked_policies(&self) -> Vec<LimitPolicy> {
        self.calls.lock().unwrap().iter().map(|(_, p)| *p).collect()
    }
}

impl AdmissionCheck for RecordingAdmission {
    async fn check(&self, key: &str, policy: &LimitPolicy) -> RateLimitDecision {
        self.calls
            .lock()
            .unwrap()
            .push((key.to_string(), *policy));
        if self.deny.contains(key) {
            RateLimitDecision::deny(policy.capacity, policy.window, Duration::from_secs(1))
        } else {
            RateLimitDecision::allow(policy.capacity, policy.capacity.saturating_sub(1), Duration::ZERO)
        }
    }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

type ErrorFactory = Arc<dyn Fn() -> AppError + Send + Sync>;

#[derive(Clone)]
enum ExtractorBehavior {
    Succeed(ExtractedContent),
    Fail(ErrorFactory),
    Stall,
}

/// Mock extractor with a fixed behavior and a call counter.
#[derive(Clone)]
pub struct MockExtractor {
    behavior: ExtractorBehavior,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl MockExtractor {
    fn with_behavior(behavior: ExtractorBehavior) -> Self {
        Self {
            behavior,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Always returns `content`.
    pub fn new(content: ExtractedContent) -> Self {
        Self::with_behavior(ExtractorBehavior::Succeed(content))
    }

    /// Always fails with a fresh error from `make`.
    pub fn always_err(make: impl Fn() -> AppError + Send + Sync + 'static) -> Self {
        Self::with_behavior(ExtractorBehavior::Fail(Arc::new(make)))
    }

    /// Never returns.
    pub fn stalling() -> Self {
        Self::with_behavior(ExtractorBehavior::Stall)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Extractor for MockExtractor {
    async fn extract(&self, _url: &str) -> Result<ExtractedContent, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.behavior {
            ExtractorBehavior::Succeed(content) => Ok(content.clone()),
            ExtractorBehavior::Fail(make) => Err(make()),
            ExtractorBehavior::Stall => std::future::pending().await,
        }
    }
}

// ---------------------------------------------------------------------------
// MockContentStore
// ---------------------------------------------------------------------------

/// Mock content store that records saves. Like the real store, a save for a
/// job already saved replaces it and keeps its id.
#[derive(Clone, Default)]
pub struct MockContentStore {
    content: Arc<Mutex<Vec<(Uuid, NewContent)>>>,
    media: Arc<Mutex<Vec<NewMedia>>>,
    save_error: Arc<Mutex<Option<AppError>>>,
    media_error: Arc<Mutex<Option<AppError>>>,
}

impl MockContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `save_content` call fails with `error`.
    pub fn fail_next_save(&self, error: AppError) {
        *self.save_error.lock().unwrap() = Some(error);
    }

    /// The next `save_media` call fails with `error`.
    pub fn fail_next_media(&self, error: AppError) {
        *self.media_error.lock().unwrap() = Some(error);
    }

    pub fn saved_content(&self) -> Vec<NewContent> {
        self.content
            .lock()
            .unwrap()
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn saved_media(&self) -> Vec<NewMedia> {
        self.media.lock().unwrap().clone()
    }
}

impl ContentStore for MockContentStore {
    async fn save_content(&self, content: NewContent) -> Result<Uuid, AppError> {
        if let Some(e) = self.save_error.lock().unwrap().take() {
            return Err(e);
        }
        let mut saved = self.content.lock().unwrap();
        if let Some(existing) = saved.iter_mut().find(|(_, c)| c.job_id == content.job_id) {
            existing.1 = content;
            return Ok(existing.0);
        }
        let id = Uuid::new_v4();
        saved.push((id, content));
        Ok(id)
    }

    async fn save_media(&self, media: NewMedia) -> Result<(), AppError> {
        if let Some(e) = self.media_error.lock().unwrap().take() {
            return Err(e);
        }
        let mut saved = self.media.lock().unwrap();
        match saved
            .iter_mut()
            .find(|m| m.content_id == media.content_id && m.url == media.url)
        {
            Some(existing) => *existing = media,
            None => saved.push(media),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockJobQueue
// ---------------------------------------------------------------------------

/// Mock job queue backed by an in-memory Vec. Claims ignore priority.
#[derive(Clone, Default)]
pub struct MockJobQueue {
    jobs: Arc<Mutex<Vec<ExtractionJob>>>,
    claim_error: Option<String>,
    claim_calls: Arc<AtomicUsize>,
    released_workers: Arc<Mutex<Vec<String>>>,
    complete_error: Arc<Mutex<Option<String>>>,
}

impl MockJobQueue {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Queue with one job ready to be claimed.
    pub fn with_job(job: ExtractionJob) -> Self {
        let queue = Self::default();
        queue.jobs.lock().unwrap().push(job);
        queue
    }

    /// Every claim fails with a `QueueError` carrying `message`.
    pub fn with_claim_error(message: &str) -> Self {
        Self {
            claim_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// The next `complete` fails with a `QueueError` carrying `message`.
    pub fn fail_next_complete(&self, message: &str) {
        *self.complete_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn claim_calls(&self) -> usize {
        self.claim_calls.load(Ordering::SeqCst)
    }

    pub fn released_workers(&self) -> Vec<String> {
        self.released_workers.lock().unwrap().clone()
    }

    fn update(&self, job_id: Uuid, worker_id: &str, f: impl FnOnce(&mut ExtractionJob)) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        let owned = jobs.iter_mut().find(|j| {
            j.id == job_id
                && j.status == JobStatus::Active
                && j.worker_id.as_deref() == Some(worker_id)
        });
        match owned {
            Some(job) => {
                f(job);
                true
            }
            None => false,
        }
    }
}

impl JobQueue for MockJobQueue {
    async fn enqueue(&self, request: NewJob) -> Result<ExtractionJob, AppError> {
        request.validate()?;
        let job = ExtractionJob::from_request(request, Utc::now());
        self.jobs.lock().unwrap().push(job.clone());
        Ok(job)
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<ExtractionJob>, AppError> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.claim_error {
            return Err(AppError::QueueError(message.clone()));
        }
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.iter_mut().find(|j| j.is_ready(now)) else {
            return Ok(None);
        };
        job.status = JobStatus::Active;
        job.worker_id = Some(worker_id.to_string());
        job.started_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn defer(
        &self,
        job_id: Uuid,
        worker_id: &str,
        not_before: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        Ok(self.update(job_id, worker_id, |job| {
            job.status = JobStatus::Delayed;
            job.not_before = not_before;
            job.worker_id = None;
        }))
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        progress: JobProgress,
    ) -> Result<(), AppError> {
        self.update(job_id, worker_id, |job| job.progress = progress);
        Ok(())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: JobResult,
    ) -> Result<bool, AppError> {
        if let Some(message) = self.complete_error.lock().unwrap().take() {
            return Err(AppError::QueueError(message));
        }
        Ok(self.update(job_id, worker_id, |job| {
            job.status = JobStatus::Completed;
            job.result = Some(result);
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
        Ok(self.update(job_id, worker_id, |job| {
            job.attempts += 1;
            job.error = Some(error.to_string());
            job.worker_id = None;
            match retry_at {
                Some(at) => {
                    job.status = JobStatus::Delayed;
                    job.not_before = at;
                }
                None => job.status = JobStatus::Failed,
            }
        }))
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool, AppError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))?;
        if !job.status.is_waiting() {
            return Ok(false);
        }
        job.status = JobStatus::Cancelled;
        Ok(true)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<ExtractionJob>, AppError> {
        Ok(self.jobs.lock().unwrap().iter().find(|j| j.id == job_id).cloned())
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<ExtractionJob>, AppError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64, AppError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.status == status)
            .count() as i64)
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        self.released_workers
            .lock()
            .unwrap()
            .push(worker_id.to_string());
        let mut released = 0;
        for job in self.jobs.lock().unwrap().iter_mut() {
            if job.status == JobStatus::Active && job.worker_id.as_deref() == Some(worker_id) {
                job.status = JobStatus::Queued;
                job.worker_id = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn requeue_orphaned(&self, _stale_before: DateTime<Utc>) -> Result<u64, AppError> {
        Ok(0)
    }

    async fn purge_terminal(&self, _older_than: DateTime<Utc>) -> Result<u64, AppError> {
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock worker reporter that records event labels.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn rate_limited(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == "JobRateLimited")
            .count()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let label = match &event {
            WorkerEvent::Started { .. } => "Started",
            WorkerEvent::Polling => "Polling",
            WorkerEvent::JobClaimed { .. } => "JobClaimed",
            WorkerEvent::JobRateLimited { .. } => "JobRateLimited",
            WorkerEvent::JobStarted { .. } => "JobStarted",
            WorkerEvent::JobCompleted { .. } => "JobCompleted",
            WorkerEvent::JobFailed { .. } => "JobFailed",
            WorkerEvent::JobReleased { .. } => "JobReleased",
            WorkerEvent::JobLost { .. } => "JobLost",
            WorkerEvent::ShuttingDown { .. } => "ShuttingDown",
            WorkerEvent::Stopped { .. } => "Stopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Successful extraction output titled `title`.
pub fn make_extracted(title: &str) -> ExtractedContent {
    ExtractedContent {
        kind: "article".to_string(),
        title: Some(title.to_string()),
        content: format!("# {title}\n\nBody text."),
        media: Vec::new(),
        success: true,
        errors: Vec::new(),
    }
}

/// A queued job for `https://example.com`.
pub fn make_test_job() -> ExtractionJob {
    ExtractionJob::from_request(NewJob::new("https://example.com"), Utc::now())
}
