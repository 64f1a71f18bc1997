pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod job_queue;
pub mod maintenance;
pub mod memory_queue;
pub mod models;
pub mod pool;
pub mod ratelimit;
pub mod traits;
pub mod util;
pub mod worker;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use error::{AppError, FailureClass};
pub use events::{EventBus, JobEvent, JobSubscription};
pub use job::{
    BackoffPolicy, ExtractionJob, JobDefaults, JobProgress, JobResult, JobStatus, NewJob,
    PoolConfig, WorkerConfig,
};
pub use job_queue::JobQueue;
pub use maintenance::{MaintenanceConfig, MaintenanceReport, MaintenanceTask};
pub use memory_queue::MemoryJobQueue;
pub use models::{ExtractedContent, MediaItem, NewContent, NewMedia, StoredContent, compute_hash};
pub use pool::{PoolLoad, WorkerPool};
pub use ratelimit::{
    ClientIdentity, DomainPolicy, DomainPolicyTable, LimitPolicy, LimiterConfig, LimiterStore,
    MemoryLimiterStore, RateLimitDecision, RateLimiterService,
};
pub use traits::{ContentStore, Extractor, NullContentStore};
pub use worker::{JobOutcome, TracingWorkerReporter, Worker, WorkerEvent, WorkerReporter};
