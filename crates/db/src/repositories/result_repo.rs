//! Repository for the `job_results` table.

use sqlx::PgPool;

use crate::models::result::{ResultRecord, UpsertResult};

/// Column list for `job_results` queries.
const COLUMNS: &str = "\
    job_id, status, status_message, progress, error, blob_key, \
    created_at, updated_at";

/// Upsert and lookup for per-job results.
pub struct ResultRepo;

impl ResultRepo {
    // ── Mutations ────────────────────────────────────────────────────

    /// Record the latest observed state of a job.
    ///
    /// Uses `ON CONFLICT (job_id) DO UPDATE` so repeated ticks keep one row
    /// per job. `blob_key` is left untouched on both paths.
    pub async fn upsert(
        pool: &PgPool,
        input: &UpsertResult,
    ) -> Result<ResultRecord, sqlx::Error> {
        let query = format!(
            "INSERT INTO job_results (job_id, status, status_message, progress, error) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (job_id) DO UPDATE \
             SET status = EXCLUDED.status, \
                 status_message = EXCLUDED.status_message, \
                 progress = EXCLUDED.progress, \
                 error = EXCLUDED.error, \
                 updated_at = NOW() \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ResultRecord>(&query)
            .bind(&input.job_id)
            .bind(&input.status)
            .bind(&input.status_message)
            .bind(input.progress)
            .bind(&input.error)
            .fetch_one(pool)
            .await
    }

    /// Attach the uploaded artifact's key. Returns `false` if the job has
    /// no result row yet.
    pub async fn set_blob_key(
        pool: &PgPool,
        job_id: &str,
        blob_key: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE job_results SET blob_key = $2, updated_at = NOW() WHERE job_id = $1",
        )
        .bind(job_id)
        .bind(blob_key)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub async fn find(pool: &PgPool, job_id: &str) -> Result<Option<ResultRecord>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM job_results WHERE job_id = $1");
        sqlx::query_as::<_, ResultRecord>(&query)
            .bind(job_id)
            .fetch_optional(pool)
            .await
    }

    /// Most recently updated results first.
    pub async fn list_recent(pool: &PgPool, limit: i64) -> Result<Vec<ResultRecord>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM job_results ORDER BY updated_at DESC, job_id LIMIT $1"
        );
        sqlx::query_as::<_, ResultRecord>(&query)
            .bind(limit)
            .fetch_all(pool)
            .await
    }
}
