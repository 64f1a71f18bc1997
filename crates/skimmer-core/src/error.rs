use thiserror::Error;

/// Application-wide error types for Skimmer.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed (fetching a page).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// The extractor ran but could not produce content.
    #[error("Extraction error: {message}")]
    ExtractionError { message: String, retryable: bool },

    /// The job URL can never be extracted (bad scheme, no host, blocked address).
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Request input rejected before it reached the queue.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Rate-limiter persistence store failed or timed out.
    #[error("Limiter store error: {0}")]
    StoreError(String),

    /// Job queue bookkeeping failed.
    #[error("Queue error: {0}")]
    QueueError(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

/// How the worker treats a failure before touching job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry with backoff; consumes one attempt.
    Transient,
    /// Fail the job now, whatever attempts remain.
    Terminal,
    /// Queue/store trouble. Logged and surfaced, never charged to the job.
    Infrastructure,
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => true,
            AppError::ExtractionError { retryable, .. } => *retryable,
            AppError::HttpError(msg) => is_transient_http(msg),
            _ => false,
        }
    }

    /// Returns true for failures of our own queue or stores.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            AppError::DatabaseError(_) | AppError::StoreError(_) | AppError::QueueError(_)
        )
    }

    pub fn failure_class(&self) -> FailureClass {
        if self.is_infrastructure() {
            FailureClass::Infrastructure
        } else if self.is_retryable() {
            FailureClass::Transient
        } else {
            FailureClass::Terminal
        }
    }
}

fn is_transient_http(msg: &str) -> bool {
    const MARKERS: &[&str] = &[
        "timeout",
        "connect",
        "reset",
        "HTTP 429",
        "HTTP 500",
        "HTTP 502",
        "HTTP 503",
        "HTTP 504",
    ];
    MARKERS.iter().any(|m| msg.contains(m))
}
