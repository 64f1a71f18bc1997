use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use skimmer_core::job::{ExtractionJob, JobProgress, JobResult};

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateJobRequest {
    /// Page to extract. Required; `http` or `https` only.
    pub url: Option<String>,
    /// Job kind, defaults to `extract`.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Policy sub-scope used when resolving domain limits.
    pub scope: Option<String>,
    pub priority: Option<i32>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub status: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ProgressResponse {
    pub status: String,
    pub percentage: u8,
}

impl From<JobProgress> for ProgressResponse {
    fn from(p: JobProgress) -> Self {
        Self {
            status: p.status,
            percentage: p.percentage,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobResultResponse {
    pub content_id: Uuid,
    pub title: Option<String>,
}

impl From<JobResult> for JobResultResponse {
    fn from(r: JobResult) -> Self {
        Self {
            content_id: r.content_id,
            title: r.title,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobResponse {
    pub job_id: Uuid,
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub state: String,
    pub progress: ProgressResponse,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResultResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<ExtractionJob> for JobResponse {
    fn from(job: ExtractionJob) -> Self {
        Self {
            job_id: job.id,
            url: job.url,
            kind: job.kind,
            state: job.status.to_string(),
            progress: job.progress.into(),
            priority: job.priority,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            result: job.result.map(Into::into),
            error: job.error,
            created_at: job.created_at,
            updated_at: job.updated_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub backend: &'static str,
    pub database: &'static str,
    /// Fraction of workers busy, as seen by the adaptive limiter.
    pub load: f64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct RateLimitedResponse {
    pub error: String,
    pub message: String,
    /// Denying level (`ip`, `user`, `api_key`); absent for submission limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    pub retry_after_secs: u64,
}
