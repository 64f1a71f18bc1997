use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A media attachment found on an extracted page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    /// "image", "video", "audio", ...
    pub kind: String,
    pub url: String,
    pub alt: Option<String>,
}

/// What an [`Extractor`](crate::traits::Extractor) produced for a URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedContent {
    /// Content type label, e.g. "article" or "post".
    pub kind: String,
    pub title: Option<String>,
    /// Main content as Markdown.
    pub content: String,
    pub media: Vec<MediaItem>,
    pub success: bool,
    /// Non-fatal problems met while extracting.
    pub errors: Vec<String>,
}

/// Content row to persist.
#[derive(Debug, Clone, Serialize)]
pub struct NewContent {
    pub job_id: Uuid,
    pub url: String,
    pub kind: String,
    pub title: Option<String>,
    pub content: String,
    /// SHA-256 of `content`
    pub content_hash: String,
}

impl NewContent {
    pub fn from_extracted(job_id: Uuid, url: &str, extracted: &ExtractedContent) -> Self {
        Self {
            job_id,
            url: url.to_string(),
            kind: extracted.kind.clone(),
            title: extracted.title.clone(),
            content: extracted.content.clone(),
            content_hash: compute_hash(&extracted.content),
        }
    }
}

/// Media row to persist, attached to saved content.
#[derive(Debug, Clone, Serialize)]
pub struct NewMedia {
    pub content_id: Uuid,
    pub kind: String,
    pub url: String,
    pub alt: Option<String>,
}

impl NewMedia {
    pub fn from_item(content_id: Uuid, item: &MediaItem) -> Self {
        Self {
            content_id,
            kind: item.kind.clone(),
            url: item.url.clone(),
            alt: item.alt.clone(),
        }
    }
}

/// Persisted content.
#[derive(Debug, Clone, Serialize)]
pub struct StoredContent {
    pub id: Uuid,
    pub job_id: Uuid,
    pub url: String,
    pub kind: String,
    pub title: Option<String>,
    pub content: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
