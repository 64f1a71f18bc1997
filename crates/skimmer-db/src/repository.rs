use chrono::{DateTime, Utc};
use skimmer_core::error::AppError;
use skimmer_core::models::{MediaItem, NewContent, NewMedia, StoredContent};
use skimmer_core::traits::ContentStore;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

/// Repository for extracted content and its media in PostgreSQL.
#[derive(Clone)]
pub struct ContentRepository {
    pool: Pool<Postgres>,
}

impl ContentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Save extracted content, replacing any earlier row for the same job.
    /// Returns the row's UUID, which is stable per job.
    pub async fn save(&self, content: &NewContent) -> Result<Uuid, AppError> {
        let row: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO contents (job_id, url, kind, title, content, content_hash)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (job_id) DO UPDATE SET
                url = EXCLUDED.url, kind = EXCLUDED.kind, title = EXCLUDED.title,
                content = EXCLUDED.content, content_hash = EXCLUDED.content_hash
            RETURNING id
            "#,
        )
        .bind(content.job_id)
        .bind(&content.url)
        .bind(&content.kind)
        .bind(&content.title)
        .bind(&content.content)
        .bind(&content.content_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.0)
    }

    pub async fn save_media_item(&self, media: &NewMedia) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO media (content_id, kind, url, alt)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (content_id, url) DO UPDATE SET kind = EXCLUDED.kind, alt = EXCLUDED.alt
            "#,
        )
        .bind(media.content_id)
        .bind(&media.kind)
        .bind(&media.url)
        .bind(&media.alt)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<StoredContent>, AppError> {
        let row = sqlx::query_as::<_, ContentRow>(
            r#"
            SELECT id, job_id, url, kind, title, content, content_hash, created_at
            FROM contents
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    /// Most recent content saved for a URL.
    pub async fn get_latest(&self, url: &str) -> Result<Option<StoredContent>, AppError> {
        let row = sqlx::query_as::<_, ContentRow>(
            r#"
            SELECT id, job_id, url, kind, title, content, content_hash, created_at
            FROM contents
            WHERE url = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    /// Media attached to a content row, in insertion order.
    pub async fn list_media(&self, content_id: Uuid) -> Result<Vec<MediaItem>, AppError> {
        let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT kind, url, alt FROM media
            WHERE content_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(content_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(kind, url, alt)| MediaItem { kind, url, alt })
            .collect())
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct ContentRow {
    id: Uuid,
    job_id: Uuid,
    url: String,
    kind: String,
    title: Option<String>,
    content: String,
    content_hash: String,
    created_at: DateTime<Utc>,
}

impl From<ContentRow> for StoredContent {
    fn from(row: ContentRow) -> Self {
        StoredContent {
            id: row.id,
            job_id: row.job_id,
            url: row.url,
            kind: row.kind,
            title: row.title,
            content: row.content,
            content_hash: row.content_hash,
            created_at: row.created_at,
        }
    }
}

// -- Trait implementation --

impl ContentStore for ContentRepository {
    async fn save_content(&self, content: NewContent) -> Result<Uuid, AppError> {
        self.save(&content).await
    }

    async fn save_media(&self, media: NewMedia) -> Result<(), AppError> {
        self.save_media_item(&media).await
    }
}
