use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::AppError;
use crate::events::EventBus;
use crate::job::PoolConfig;
use crate::job_queue::JobQueue;
use crate::ratelimit::adaptive::LoadSource;
use crate::ratelimit::service::RateLimiterService;
use crate::ratelimit::store::LimiterStore;
use crate::traits::{ContentStore, Extractor};
use crate::worker::{Worker, WorkerReporter};

/// Busy-worker gauge. `load_factor` is `busy / size` in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct PoolLoad {
    busy: Arc<AtomicUsize>,
    size: usize,
}

impl PoolLoad {
    pub fn new(size: usize) -> Self {
        Self {
            busy: Arc::new(AtomicUsize::new(0)),
            size: size.max(1),
        }
    }

    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Mark one worker busy until the guard drops.
    pub fn enter(&self) -> BusyGuard {
        self.busy.fetch_add(1, Ordering::SeqCst);
        BusyGuard {
            busy: self.busy.clone(),
        }
    }
}

impl LoadSource for PoolLoad {
    fn load_factor(&self) -> f64 {
        (self.busy() as f64 / self.size as f64).clamp(0.0, 1.0)
    }
}

#[derive(Debug)]
pub struct BusyGuard {
    busy: Arc<AtomicUsize>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A fixed number of [`Worker`]s sharing one queue, limiter and event bus.
pub struct WorkerPool<Q, E, C, S>
where
    Q: JobQueue,
    E: Extractor,
    C: ContentStore,
    S: LimiterStore,
{
    workers: Vec<Worker<Q, E, C, S>>,
    load: PoolLoad,
}

impl<Q, E, C, S> WorkerPool<Q, E, C, S>
where
    Q: JobQueue + 'static,
    E: Extractor + 'static,
    C: ContentStore + 'static,
    S: LimiterStore,
{
    /// Build the pool. Pass the same `load` to the limiter's adaptive stage
    /// so denials tighten as workers get busy.
    pub fn new(
        queue: Q,
        extractor: E,
        content: C,
        limiter: RateLimiterService<S>,
        events: EventBus,
        config: &PoolConfig,
        load: PoolLoad,
    ) -> Self {
        let workers = (0..config.workers.max(1))
            .map(|i| {
                Worker::new(
                    queue.clone(),
                    extractor.clone(),
                    content.clone(),
                    limiter.clone(),
                    events.clone(),
                    config.worker_config(i),
                )
                .with_load(load.clone())
            })
            .collect();
        Self { workers, load }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn load(&self) -> &PoolLoad {
        &self.load
    }

    /// Spawn every worker onto `tracker`. Workers stop when `cancel` fires.
    pub fn spawn<R>(self, tracker: &TaskTracker, cancel: &CancellationToken, reporter: R)
    where
        R: WorkerReporter + Clone + 'static,
    {
        for worker in self.workers {
            let cancel = cancel.clone();
            let reporter = reporter.clone();
            tracker.spawn(async move {
                if let Err(e) = worker.run(cancel, &reporter).await {
                    tracing::error!(worker_id = %worker.worker_id(), error = %e, "Worker exited with error");
                }
            });
        }
    }

    /// Run until `cancel` fires and every worker has released its jobs.
    pub async fn run<R>(self, cancel: CancellationToken, reporter: R) -> Result<(), AppError>
    where
        R: WorkerReporter + Clone + 'static,
    {
        let tracker = TaskTracker::new();
        let size = self.size();
        self.spawn(&tracker, &cancel, reporter);
        tracker.close();
        tracing::info!(workers = size, "Worker pool running");
        tracker.wait().await;
        tracing::info!("Worker pool stopped");
        Ok(())
    }
}
