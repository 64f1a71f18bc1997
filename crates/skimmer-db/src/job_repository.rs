use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use skimmer_core::error::AppError;
use skimmer_core::job::{
    BackoffPolicy, ExtractionJob, JobDefaults, JobProgress, JobResult, JobStatus, NewJob,
};
use skimmer_core::job_queue::JobQueue;
use skimmer_core::ratelimit::ClientIdentity;

/// PostgreSQL-backed job queue using `SELECT FOR UPDATE SKIP LOCKED`.
#[derive(Clone)]
pub struct ExtractionJobRepository {
    pool: Pool<Postgres>,
    defaults: JobDefaults,
}

impl ExtractionJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            defaults: JobDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: JobDefaults) -> Self {
        self.defaults = defaults;
        self
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct ExtractionJobRow {
    id: Uuid,
    url: String,
    kind: String,
    scope: Option<String>,
    identity: Json<ClientIdentity>,
    priority: i32,
    attempts: i32,
    max_attempts: i32,
    backoff: Json<BackoffPolicy>,
    status: String,
    progress_status: String,
    progress_percentage: i16,
    result: Option<Json<JobResult>>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    not_before: DateTime<Utc>,
    worker_id: Option<String>,
}

impl From<ExtractionJobRow> for ExtractionJob {
    fn from(row: ExtractionJobRow) -> Self {
        ExtractionJob {
            id: row.id,
            url: row.url,
            kind: row.kind,
            scope: row.scope,
            identity: row.identity.0,
            priority: row.priority,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            backoff: row.backoff.0,
            status: row.status.parse().unwrap_or(JobStatus::Queued),
            progress: JobProgress::new(
                row.progress_status,
                row.progress_percentage.clamp(0, 100) as u8,
            ),
            result: row.result.map(|r| r.0),
            error: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            not_before: row.not_before,
            worker_id: row.worker_id,
        }
    }
}

impl JobQueue for ExtractionJobRepository {
    async fn enqueue(&self, request: NewJob) -> Result<ExtractionJob, AppError> {
        request.validate()?;
        let job = ExtractionJob::from_request(request.with_defaults(&self.defaults), Utc::now());

        let row = sqlx::query_as::<_, ExtractionJobRow>(
            r#"
            INSERT INTO extraction_jobs
                (id, url, kind, scope, identity, priority, max_attempts, backoff)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(&job.url)
        .bind(&job.kind)
        .bind(&job.scope)
        .bind(Json(&job.identity))
        .bind(job.priority)
        .bind(job.max_attempts as i32)
        .bind(Json(&job.backoff))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.into())
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<ExtractionJob>, AppError> {
        let row = sqlx::query_as::<_, ExtractionJobRow>(
            r#"
            UPDATE extraction_jobs
            SET status = 'active', worker_id = $1, started_at = NOW(), updated_at = NOW()
            WHERE id = (
                SELECT id FROM extraction_jobs
                WHERE status IN ('queued', 'delayed')
                  AND not_before <= NOW()
                ORDER BY priority DESC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn defer(
        &self,
        job_id: Uuid,
        worker_id: &str,
        not_before: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE extraction_jobs
            SET status = 'delayed', not_before = $3, worker_id = NULL, started_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'active' AND worker_id = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(not_before)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        progress: JobProgress,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE extraction_jobs
            SET progress_status = $3, progress_percentage = $4, updated_at = NOW()
            WHERE id = $1 AND status = 'active' AND worker_id = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(&progress.status)
        .bind(i16::from(progress.percentage.min(100)))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: JobResult,
    ) -> Result<bool, AppError> {
        let updated = sqlx::query(
            r#"
            UPDATE extraction_jobs
            SET status = 'completed', completed_at = NOW(), updated_at = NOW(),
                progress_status = 'completed', progress_percentage = 100,
                result = $3, error_message = NULL, worker_id = NULL
            WHERE id = $1 AND status = 'active' AND worker_id = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(Json(&result))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(updated.rows_affected() > 0)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool, AppError> {
        // With retry_at the job goes back to waiting as 'delayed';
        // otherwise it is marked permanently failed.
        let result = sqlx::query(
            r#"
            UPDATE extraction_jobs
            SET
                attempts = attempts + 1,
                status = CASE WHEN $3::timestamptz IS NOT NULL THEN 'delayed' ELSE 'failed' END,
                not_before = COALESCE($3, not_before),
                progress_status = CASE WHEN $3::timestamptz IS NOT NULL THEN progress_status ELSE 'failed' END,
                completed_at = CASE WHEN $3::timestamptz IS NOT NULL THEN NULL ELSE NOW() END,
                started_at = CASE WHEN $3::timestamptz IS NOT NULL THEN NULL ELSE started_at END,
                error_message = $2,
                worker_id = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'active' AND worker_id = $4
            "#,
        )
        .bind(job_id)
        .bind(error)
        .bind(retry_at)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool, AppError> {
        let cancelled = sqlx::query(
            r#"
            UPDATE extraction_jobs
            SET status = 'cancelled', completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'delayed')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?
        .rows_affected()
            > 0;

        if cancelled {
            return Ok(true);
        }
        match self.get(job_id).await? {
            Some(_) => Ok(false),
            None => Err(AppError::NotFound(format!("job {job_id}"))),
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<ExtractionJob>, AppError> {
        let row =
            sqlx::query_as::<_, ExtractionJobRow>(r#"SELECT * FROM extraction_jobs WHERE id = $1"#)
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<ExtractionJob>, AppError> {
        let rows = if let Some(status) = status {
            sqlx::query_as::<_, ExtractionJobRow>(
                r#"
                SELECT * FROM extraction_jobs
                WHERE status = $1
                ORDER BY created_at DESC
                LIMIT $2
                "#,
            )
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, ExtractionJobRow>(
                r#"
                SELECT * FROM extraction_jobs
                ORDER BY created_at DESC
                LIMIT $1
                "#,
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM extraction_jobs WHERE status = $1"#)
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(count)
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE extraction_jobs
            SET status = 'queued', worker_id = NULL, started_at = NULL, updated_at = NOW()
            WHERE worker_id = $1 AND status = 'active'
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn requeue_orphaned(&self, stale_before: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE extraction_jobs
            SET status = 'queued', worker_id = NULL, started_at = NULL, updated_at = NOW()
            WHERE status = 'active' AND started_at < $1
            "#,
        )
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            tracing::warn!(requeued, "Requeued orphaned jobs");
        }
        Ok(requeued)
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM extraction_jobs
            WHERE status IN ('completed', 'failed', 'cancelled') AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }
}
