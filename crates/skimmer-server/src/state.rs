use std::time::Duration;

use skimmer_core::config::{env_list, env_parse, env_positive};
use skimmer_core::error::AppError;
use skimmer_core::events::EventBus;
use skimmer_core::ratelimit::RateLimiterService;
use skimmer_db::{Database, QueueBackend, StoreBackend};

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub queue: QueueBackend,
    pub limiter: RateLimiterService<StoreBackend>,
    pub events: EventBus,
    /// Accepted bearer tokens. Empty disables authentication.
    pub api_keys: Vec<String>,
    /// Present when running against PostgreSQL; checked by `/health`.
    pub db: Option<Database>,
    /// How often an open event stream re-reads the job, for workers in
    /// other processes that cannot reach this process's event bus.
    pub sse_poll_interval: Duration,
    /// Take the client address from `X-Forwarded-For` instead of the peer.
    pub trust_forwarded_for: bool,
}

impl AppState {
    pub fn new(
        queue: QueueBackend,
        limiter: RateLimiterService<StoreBackend>,
        events: EventBus,
    ) -> Self {
        Self {
            queue,
            limiter,
            events,
            api_keys: Vec::new(),
            db: None,
            sse_poll_interval: Duration::from_secs(1),
            trust_forwarded_for: false,
        }
    }

    pub fn with_api_keys(mut self, api_keys: Vec<String>) -> Self {
        self.api_keys = api_keys;
        self
    }

    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_sse_poll_interval(mut self, interval: Duration) -> Self {
        self.sse_poll_interval = interval;
        self
    }

    pub fn with_trusted_proxy(mut self, trusted: bool) -> Self {
        self.trust_forwarded_for = trusted;
        self
    }
}

/// Process-level server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub api_keys: Vec<String>,
    /// Run the worker pool and maintenance in this process.
    pub run_workers: bool,
    pub sse_poll_interval: Duration,
    /// Set only behind a reverse proxy that rewrites `X-Forwarded-For`.
    pub trust_proxy: bool,
}

impl ServerConfig {
    /// - `SKIMMER_SERVER_PORT` (default 3000)
    /// - `SKIMMER_API_KEYS` (comma-separated, default none)
    /// - `SKIMMER_RUN_WORKERS` (default true)
    /// - `SKIMMER_SSE_POLL_MS` (default 1000)
    /// - `SKIMMER_TRUST_PROXY` (default false)
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self {
            port: env_parse("SKIMMER_SERVER_PORT", 3000)?,
            api_keys: env_list("SKIMMER_API_KEYS"),
            run_workers: env_parse("SKIMMER_RUN_WORKERS", true)?,
            sse_poll_interval: Duration::from_millis(env_positive("SKIMMER_SSE_POLL_MS", 1_000)?),
            trust_proxy: env_parse("SKIMMER_TRUST_PROXY", false)?,
        })
    }
}
