use std::future::Future;

use uuid::Uuid;

use crate::error::AppError;
use crate::models::{ExtractedContent, NewContent, NewMedia};

/// Turns a URL into content. The worker bounds each call with a timeout.
pub trait Extractor: Send + Sync + Clone {
    fn extract(&self, url: &str) -> impl Future<Output = Result<ExtractedContent, AppError>> + Send;
}

/// Persists extraction output.
pub trait ContentStore: Send + Sync + Clone {
    /// Save content. Returns its UUID.
    ///
    /// Idempotent per `job_id`: saving again for the same job replaces the
    /// row and returns the same UUID, so a retried job never duplicates it.
    fn save_content(
        &self,
        content: NewContent,
    ) -> impl Future<Output = Result<Uuid, AppError>> + Send;

    /// Idempotent per `(content_id, url)`.
    fn save_media(&self, media: NewMedia) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// A no-op ContentStore for use when persistence is not needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullContentStore;

impl ContentStore for NullContentStore {
    async fn save_content(&self, content: NewContent) -> Result<Uuid, AppError> {
        Ok(content.job_id)
    }

    async fn save_media(&self, _media: NewMedia) -> Result<(), AppError> {
        Ok(())
    }
}
