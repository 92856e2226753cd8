//! Repository for the `jobs` table.

use sqlx::PgPool;

use crate::models::job::{JobRecord, NewJob};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    job_id, client_id, prompt_text, enhanced_text, \
    preset, layout, seed, created_at";

/// Insert for submitted jobs. Rows are never updated.
pub struct JobRepo;

impl JobRepo {
    /// Insert a job record, returning the stored row.
    pub async fn create(pool: &PgPool, input: &NewJob) -> Result<JobRecord, sqlx::Error> {
        let query = format!(
            "INSERT INTO jobs (job_id, client_id, prompt_text, enhanced_text, preset, layout, seed) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRecord>(&query)
            .bind(&input.job_id)
            .bind(input.client_id)
            .bind(&input.prompt_text)
            .bind(&input.enhanced_text)
            .bind(&input.preset)
            .bind(&input.layout)
            .bind(input.seed)
            .fetch_one(pool)
            .await
    }
}
