use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AppError, FailureClass};
use crate::events::{EventBus, JobEvent};
use crate::job::{ExtractionJob, JobProgress, JobResult, WorkerConfig};
use crate::job_queue::JobQueue;
use crate::models::{ExtractedContent, NewContent, NewMedia};
use crate::pool::PoolLoad;
use crate::ratelimit::service::RateLimiterService;
use crate::ratelimit::store::LimiterStore;
use crate::traits::{ContentStore, Extractor};

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    Polling,
    JobClaimed {
        job: &'a ExtractionJob,
    },
    JobRateLimited {
        job_id: Uuid,
        retry_after: Duration,
    },
    JobStarted {
        job_id: Uuid,
        url: &'a str,
    },
    JobCompleted {
        job_id: Uuid,
        content_id: Uuid,
    },
    JobFailed {
        job_id: Uuid,
        error: &'a str,
        will_retry: bool,
    },
    JobReleased {
        job_id: Uuid,
        error: &'a str,
    },
    JobLost {
        job_id: Uuid,
    },
    ShuttingDown {
        worker_id: &'a str,
        jobs_released: u64,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::Polling => {
                tracing::trace!("Polling for jobs");
            }
            WorkerEvent::JobClaimed { job } => {
                tracing::info!(job_id = %job.id, url = %job.url, attempts = job.attempts, "Job claimed");
            }
            WorkerEvent::JobRateLimited {
                job_id,
                retry_after,
            } => {
                tracing::info!(%job_id, retry_after_ms = retry_after.as_millis() as u64, "Job rate limited, deferred");
            }
            WorkerEvent::JobStarted { job_id, url } => {
                tracing::info!(%job_id, %url, "Processing job");
            }
            WorkerEvent::JobCompleted { job_id, content_id } => {
                tracing::info!(%job_id, %content_id, "Job completed");
            }
            WorkerEvent::JobFailed {
                job_id,
                error,
                will_retry,
            } => {
                tracing::warn!(%job_id, %error, %will_retry, "Job failed");
            }
            WorkerEvent::JobReleased { job_id, error } => {
                tracing::error!(%job_id, %error, "Infrastructure failure, job released");
            }
            WorkerEvent::JobLost { job_id } => {
                tracing::warn!(%job_id, "Claim lost to another worker, result discarded");
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                jobs_released,
            } => {
                tracing::info!(%worker_id, %jobs_released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { content_id: Uuid },
    /// Denied by the domain limiter; back in the queue, attempts untouched.
    Deferred { until: DateTime<Utc> },
    /// Transient failure with attempts left.
    Retrying { at: DateTime<Utc> },
    Failed,
    /// Our own queue or store failed; back in the queue, attempts untouched.
    Released,
    /// The claim was taken over by another worker; nothing was recorded.
    Lost,
}

/// Claims jobs, gates them on the domain limiter, extracts and persists.
#[derive(Clone)]
pub struct Worker<Q, E, C, S>
where
    Q: JobQueue,
    E: Extractor,
    C: ContentStore,
    S: LimiterStore,
{
    queue: Q,
    extractor: E,
    content: C,
    limiter: RateLimiterService<S>,
    events: EventBus,
    config: WorkerConfig,
    load: PoolLoad,
}

impl<Q, E, C, S> Worker<Q, E, C, S>
where
    Q: JobQueue,
    E: Extractor,
    C: ContentStore,
    S: LimiterStore,
{
    pub fn new(
        queue: Q,
        extractor: E,
        content: C,
        limiter: RateLimiterService<S>,
        events: EventBus,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            extractor,
            content,
            limiter,
            events,
            config,
            load: PoolLoad::new(1),
        }
    }

    /// Share a pool-wide load gauge instead of a private one.
    pub fn with_load(mut self, load: PoolLoad) -> Self {
        self.load = load;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    fn now(&self) -> DateTime<Utc> {
        self.limiter.clock().now()
    }

    /// Run the worker loop until cancellation.
    pub async fn run<WR: WorkerReporter>(
        &self,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) -> Result<(), AppError> {
        reporter.report(WorkerEvent::Started {
            worker_id: &self.config.worker_id,
        });

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            reporter.report(WorkerEvent::Polling);

            match self.process_next(reporter).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(worker_id = %self.config.worker_id, error = %e, "Failed to claim job");
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
            }
        }

        // Graceful shutdown: release all claimed jobs
        let released = match self.queue.release_worker_jobs(&self.config.worker_id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(worker_id = %self.config.worker_id, error = %e, "Failed to release jobs");
                0
            }
        };

        reporter.report(WorkerEvent::ShuttingDown {
            worker_id: &self.config.worker_id,
            jobs_released: released,
        });
        reporter.report(WorkerEvent::Stopped {
            worker_id: &self.config.worker_id,
        });

        Ok(())
    }

    /// Claim and process one job. `Ok(None)` when nothing is ready.
    pub async fn process_next<WR: WorkerReporter>(
        &self,
        reporter: &WR,
    ) -> Result<Option<JobOutcome>, AppError> {
        let Some(job) = self.queue.claim(&self.config.worker_id).await? else {
            return Ok(None);
        };
        reporter.report(WorkerEvent::JobClaimed { job: &job });

        Ok(Some(self.process_job(&job, reporter).await))
    }

    async fn process_job<WR: WorkerReporter>(
        &self,
        job: &ExtractionJob,
        reporter: &WR,
    ) -> JobOutcome {
        let decision = self.limiter.admit_job(job).await;
        if !decision.allowed {
            let retry_after = decision.wait();
            let until = self.now() + TimeDelta::from_std(retry_after).unwrap_or(TimeDelta::MAX);
            reporter.report(WorkerEvent::JobRateLimited {
                job_id: job.id,
                retry_after,
            });
            self.progress(job, "rate_limited", job.progress.percentage).await;
            return match self.queue.defer(job.id, &self.config.worker_id, until).await {
                Ok(true) => JobOutcome::Deferred { until },
                Ok(false) => self.lost(job, reporter),
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to defer job");
                    JobOutcome::Released
                }
            };
        }

        // Counted as busy only once admitted.
        let _busy = self.load.enter();
        reporter.report(WorkerEvent::JobStarted {
            job_id: job.id,
            url: &job.url,
        });

        match self.execute(job).await {
            Ok(result) => {
                let content_id = result.content_id;
                match self
                    .queue
                    .complete(job.id, &self.config.worker_id, result.clone())
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => return self.lost(job, reporter),
                    Err(e) => return self.handle_failure(job, e, reporter).await,
                }
                reporter.report(WorkerEvent::JobCompleted {
                    job_id: job.id,
                    content_id,
                });
                self.events
                    .publish(job.id, JobEvent::progress("completed", 100));
                self.events.publish(job.id, JobEvent::Completed { result });
                JobOutcome::Completed { content_id }
            }
            Err(e) => self.handle_failure(job, e, reporter).await,
        }
    }

    async fn execute(&self, job: &ExtractionJob) -> Result<JobResult, AppError> {
        self.progress(job, "extracting", 10).await;

        let extracted = self.extract(&job.url).await?;

        self.progress(job, "processing", 50).await;

        let content_id = self
            .content
            .save_content(NewContent::from_extracted(job.id, &job.url, &extracted))
            .await?;
        for item in &extracted.media {
            self.content
                .save_media(NewMedia::from_item(content_id, item))
                .await?;
        }

        Ok(JobResult {
            content_id,
            title: extracted.title,
        })
    }

    async fn extract(&self, url: &str) -> Result<ExtractedContent, AppError> {
        let timeout = self.config.extract_timeout;
        let extracted = tokio::time::timeout(timeout, self.extractor.extract(url))
            .await
            .map_err(|_| AppError::Timeout(timeout.as_secs()))??;

        if !extracted.success {
            let message = if extracted.errors.is_empty() {
                "extractor reported failure".to_string()
            } else {
                extracted.errors.join("; ")
            };
            return Err(AppError::ExtractionError {
                message,
                retryable: false,
            });
        }
        Ok(extracted)
    }

    async fn handle_failure<WR: WorkerReporter>(
        &self,
        job: &ExtractionJob,
        error: AppError,
        reporter: &WR,
    ) -> JobOutcome {
        let message = error.to_string();
        tracing::debug!(job_id = %job.id, error = ?error, "Job attempt failed");

        let class = error.failure_class();
        if class == FailureClass::Infrastructure {
            reporter.report(WorkerEvent::JobReleased {
                job_id: job.id,
                error: &message,
            });
            let retry_at = self.now() + TimeDelta::from_std(self.config.poll_interval).unwrap_or(TimeDelta::zero());
            return match self.queue.defer(job.id, &self.config.worker_id, retry_at).await {
                Ok(false) => self.lost(job, reporter),
                Ok(true) => JobOutcome::Released,
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to release job");
                    JobOutcome::Released
                }
            };
        }

        let will_retry = class == FailureClass::Transient && job.can_retry();
        reporter.report(WorkerEvent::JobFailed {
            job_id: job.id,
            error: &message,
            will_retry,
        });

        let retry_at = will_retry.then(|| job.next_retry_at(self.now()));
        match self
            .queue
            .fail(job.id, &self.config.worker_id, &message, retry_at)
            .await
        {
            Ok(true) => {}
            Ok(false) => return self.lost(job, reporter),
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to record job failure");
                return JobOutcome::Released;
            }
        }

        match retry_at {
            Some(at) => {
                self.events
                    .publish(job.id, JobEvent::progress("retrying", 0));
                JobOutcome::Retrying { at }
            }
            None => {
                self.events
                    .publish(job.id, JobEvent::Failed { error: message });
                JobOutcome::Failed
            }
        }
    }

    fn lost<WR: WorkerReporter>(&self, job: &ExtractionJob, reporter: &WR) -> JobOutcome {
        reporter.report(WorkerEvent::JobLost { job_id: job.id });
        JobOutcome::Lost
    }

    async fn progress(&self, job: &ExtractionJob, status: &str, percentage: u8) {
        if let Err(e) = self
            .queue
            .update_progress(
                job.id,
                &self.config.worker_id,
                JobProgress::new(status, percentage),
            )
            .await
        {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to record progress");
        }
        self.events
            .publish(job.id, JobEvent::progress(status, percentage));
    }
}
