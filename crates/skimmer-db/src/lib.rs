pub mod backend;
pub mod config;
pub mod database;
pub mod job_repository;
pub mod limiter_store;
pub mod repository;

pub use backend::{Backends, ContentBackend, QueueBackend, StoreBackend};
pub use config::DatabaseConfig;
pub use database::Database;
pub use job_repository::ExtractionJobRepository;
pub use limiter_store::PgLimiterStore;
pub use repository::ContentRepository;
