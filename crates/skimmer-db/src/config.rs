use std::time::Duration;

use skimmer_core::AppError;
use skimmer_core::config::env_positive;

/// Configuration for the database connection pool.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
        }
    }

    /// Read configuration from environment variables.
    ///
    /// - `DATABASE_URL` (required)
    /// - `DATABASE_MAX_CONNECTIONS` (optional, defaults to 5)
    /// - `DATABASE_ACQUIRE_TIMEOUT_SECS` (optional, defaults to 5)
    pub fn from_env() -> Result<Self, AppError> {
        let url = std::env::var("DATABASE_URL").map_err(|_| {
            AppError::ConfigError("DATABASE_URL not set. Required for database operations.".into())
        })?;

        let max_connections = env_positive("DATABASE_MAX_CONNECTIONS", 5)?;
        let max_connections = u32::try_from(max_connections).map_err(|_| {
            AppError::ConfigError(format!(
                "DATABASE_MAX_CONNECTIONS '{max_connections}' is too large"
            ))
        })?;

        Ok(Self {
            url,
            max_connections,
            acquire_timeout: Duration::from_secs(env_positive("DATABASE_ACQUIRE_TIMEOUT_SECS", 5)?),
        })
    }
}
