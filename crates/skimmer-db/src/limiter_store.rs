use std::time::Duration;

use skimmer_core::error::AppError;
use skimmer_core::ratelimit::{LimiterStore, WindowAdmission};
use sqlx::{PgPool, Pool, Postgres};

/// Shared limiter state in PostgreSQL, for sliding windows and penalty
/// records that must be visible to every server instance.
///
/// Two clocks are in play and never compared with each other. TTLs are set
/// and checked against the database `NOW()` only. Set scores are caller
/// timestamps, compared only with other caller timestamps (`prune_before`).
/// Expired rows are deleted lazily by writers and in bulk by
/// [`purge_expired`](LimiterStore::purge_expired).
#[derive(Clone)]
pub struct PgLimiterStore {
    pool: Pool<Postgres>,
}

impl PgLimiterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Drop the members of a scored set whose TTL has passed.
    async fn clear_if_expired(&self, key: &str) -> Result<(), AppError> {
        sqlx::query(CLEAR_EXPIRED_SET)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

fn store_err(e: sqlx::Error) -> AppError {
    AppError::StoreError(e.to_string())
}

fn ttl_secs(ttl: Duration) -> f64 {
    ttl.as_secs_f64()
}

const CLEAR_EXPIRED_SET: &str = r#"
    WITH expired AS (
        DELETE FROM limiter_set_ttls
        WHERE key = $1 AND expires_at <= NOW()
        RETURNING key
    )
    DELETE FROM limiter_sets WHERE key IN (SELECT key FROM expired)
"#;

impl LimiterStore for PgLimiterStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"SELECT value FROM limiter_values WHERE key = $1 AND expires_at > NOW()"#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row.map(|(value,)| value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO limiter_values (key, value, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl_secs(ttl))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            WITH v AS (DELETE FROM limiter_values WHERE key = $1),
                 t AS (DELETE FROM limiter_set_ttls WHERE key = $1)
            DELETE FROM limiter_sets WHERE key = $1
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), AppError> {
        self.clear_if_expired(key).await?;
        sqlx::query(
            r#"
            INSERT INTO limiter_sets (key, member, score)
            VALUES ($1, $2, $3)
            ON CONFLICT (key, member) DO UPDATE SET score = EXCLUDED.score
            "#,
        )
        .bind(key)
        .bind(member)
        .bind(score)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<u64, AppError> {
        self.clear_if_expired(key).await?;
        let result = sqlx::query(
            r#"DELETE FROM limiter_sets WHERE key = $1 AND score >= $2 AND score <= $3"#,
        )
        .bind(key)
        .bind(min)
        .bind(max)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected())
    }

    async fn zcard(&self, key: &str) -> Result<u64, AppError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM limiter_sets s
            WHERE s.key = $1
              AND NOT EXISTS (
                  SELECT 1 FROM limiter_set_ttls t WHERE t.key = s.key AND t.expires_at <= NOW()
              )
            "#,
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(count.max(0) as u64)
    }

    async fn zoldest(&self, key: &str) -> Result<Option<i64>, AppError> {
        let (oldest,): (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT MIN(s.score) FROM limiter_sets s
            WHERE s.key = $1
              AND NOT EXISTS (
                  SELECT 1 FROM limiter_set_ttls t WHERE t.key = s.key AND t.expires_at <= NOW()
              )
            "#,
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(oldest)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), AppError> {
        sqlx::query(
            r#"
            WITH v AS (
                UPDATE limiter_values SET expires_at = NOW() + make_interval(secs => $2)
                WHERE key = $1
            )
            INSERT INTO limiter_set_ttls (key, expires_at)
            SELECT $1, NOW() + make_interval(secs => $2)
            WHERE EXISTS (SELECT 1 FROM limiter_sets WHERE key = $1)
            ON CONFLICT (key) DO UPDATE SET expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(ttl_secs(ttl))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn zadd_within_limit(
        &self,
        key: &str,
        prune_before: i64,
        limit: u64,
        score: i64,
        member: &str,
        ttl: Duration,
    ) -> Result<WindowAdmission, AppError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        // Serializes every writer of this key until commit.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        sqlx::query(CLEAR_EXPIRED_SET)
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        sqlx::query("DELETE FROM limiter_sets WHERE key = $1 AND score < $2")
            .bind(key)
            .bind(prune_before)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        let (count, oldest): (i64, Option<i64>) =
            sqlx::query_as("SELECT COUNT(*), MIN(score) FROM limiter_sets WHERE key = $1")
                .bind(key)
                .fetch_one(&mut *tx)
                .await
                .map_err(store_err)?;
        let count = count.max(0) as u64;

        if count >= limit {
            tx.commit().await.map_err(store_err)?;
            return Ok(WindowAdmission::Full { count, oldest });
        }

        sqlx::query(
            r#"
            INSERT INTO limiter_sets (key, member, score)
            VALUES ($1, $2, $3)
            ON CONFLICT (key, member) DO UPDATE SET score = EXCLUDED.score
            "#,
        )
        .bind(key)
        .bind(member)
        .bind(score)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        sqlx::query(
            r#"
            INSERT INTO limiter_set_ttls (key, expires_at)
            VALUES ($1, NOW() + make_interval(secs => $2))
            ON CONFLICT (key) DO UPDATE SET expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(ttl_secs(ttl))
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        Ok(WindowAdmission::Recorded { count })
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        let (removed,): (i64,) = sqlx::query_as(
            r#"
            WITH v AS (
                DELETE FROM limiter_values WHERE expires_at <= NOW() RETURNING key
            ),
            t AS (
                DELETE FROM limiter_set_ttls WHERE expires_at <= NOW() RETURNING key
            ),
            s AS (
                DELETE FROM limiter_sets WHERE key IN (SELECT key FROM t)
            )
            SELECT (SELECT COUNT(*) FROM v) + (SELECT COUNT(*) FROM t)
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(removed.max(0) as u64)
    }
}
