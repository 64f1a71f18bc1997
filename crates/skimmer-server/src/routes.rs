use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Router};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use skimmer_core::error::AppError;
use skimmer_core::events::JobEvent;
use skimmer_core::job::{JobStatus, NewJob};
use skimmer_core::job_queue::JobQueue;
use skimmer_core::ratelimit::ClientIdentity;

use crate::auth::require_api_key;
use crate::dto::{
    CreateJobRequest, CreateJobResponse, HealthResponse, JobListResponse, JobResponse,
    ListJobsQuery,
};
use crate::error::{ApiError, error_response};
use crate::openapi::ApiDoc;
use crate::ratelimit::{rate_limit, rate_limited_response};
use crate::sse::job_events;
use crate::state::AppState;

/// Build the full router with all routes and middleware.
///
/// `/v1` routes pass the rate limiter first, then authentication.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/v1/jobs", post(create_job).get(list_jobs))
        .route("/v1/jobs/{id}", get(get_job).delete(cancel_job))
        .route("/v1/jobs/{id}/events", get(job_events))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    let public = Router::new()
        .route("/health", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(api).with_state(state)
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/jobs",
    request_body = CreateJobRequest,
    responses(
        (status = 202, description = "Job queued", body = CreateJobResponse),
        (status = 400, description = "Bad request", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
        (status = 429, description = "Rate limited", body = crate::dto::RateLimitedResponse),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<ClientIdentity>,
    axum::Json(body): axum::Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let url = body
        .url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| AppError::ValidationError("url is required".into()))?;

    let decision = state.limiter.check_submission(&identity).await;
    if !decision.allowed {
        return Ok(rate_limited_response(&decision, None));
    }

    let mut request = NewJob::new(url).with_identity(identity);
    if let Some(kind) = body.kind {
        request = request.with_kind(kind);
    }
    if let Some(scope) = body.scope {
        request = request.with_scope(scope);
    }
    if let Some(priority) = body.priority {
        request = request.with_priority(priority);
    }
    if let Some(max) = body.max_attempts {
        request = request.with_max_attempts(max);
    }

    let job = state.queue.enqueue(request).await?;
    tracing::info!(job_id = %job.id, url = %job.url, "Job queued");

    let response = CreateJobResponse {
        job_id: job.id,
        status: job.status.to_string(),
    };

    Ok((StatusCode::ACCEPTED, axum::Json(response)).into_response())
}

#[utoipa::path(
    get,
    path = "/v1/jobs",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "List of jobs", body = JobListResponse),
        (status = 400, description = "Unknown status", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status_filter = query
        .status
        .map(|s| s.parse::<JobStatus>().map_err(AppError::ValidationError))
        .transpose()?;

    let limit = query.limit.unwrap_or(20).min(100);
    let jobs = state.queue.list(status_filter, limit).await?;
    let total = jobs.len();

    let response = JobListResponse {
        jobs: jobs.into_iter().map(JobResponse::from).collect(),
        total,
    };

    Ok(axum::Json(response))
}

#[utoipa::path(
    get,
    path = "/v1/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job details", body = JobResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .queue
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job not found: {id}")))?;

    Ok(axum::Json(JobResponse::from(job)))
}

#[utoipa::path(
    delete,
    path = "/v1/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 204, description = "Job cancelled"),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 409, description = "Job is active or finished", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if state.queue.cancel(id).await? {
        state.events.publish(
            id,
            JobEvent::Failed {
                error: "job cancelled".into(),
            },
        );
        tracing::info!(job_id = %id, "Job cancelled");
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let current = state
        .queue
        .get(id)
        .await?
        .map(|job| job.status.to_string())
        .unwrap_or_else(|| "unknown".into());
    Ok(error_response(
        StatusCode::CONFLICT,
        "conflict",
        format!("Job {id} cannot be cancelled in state {current}"),
    ))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db_status = match &state.db {
        Some(db) => match db.health_check().await {
            Ok(()) => "ok",
            Err(_) => "error",
        },
        None => "disabled",
    };

    let healthy = db_status != "error";
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        backend: state.queue.name(),
        database: db_status,
        load: state.limiter.current_load(),
    };

    (status, axum::Json(response))
}
