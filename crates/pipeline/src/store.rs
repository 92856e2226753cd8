//! Persistence seams for the pipeline.
//!
//! The reconciler and service depend on these traits rather than on a
//! pool, so they can be exercised without a database. [`PgStore`] is the
//! production adapter over the `atelier-db` repositories.

use async_trait::async_trait;
use sqlx::PgPool;

use atelier_db::models::job::NewJob;
use atelier_db::models::result::{ResultRecord, UpsertResult};
use atelier_db::repositories::{JobRepo, ResultRepo};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Write-once job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &NewJob) -> Result<(), StoreError>;
}

/// Per-job result records.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert or update the observed state. Must not clear `blob_key`.
    async fn upsert_result(&self, result: &UpsertResult) -> Result<(), StoreError>;

    async fn set_blob_key(&self, job_id: &str, blob_key: &str) -> Result<(), StoreError>;

    async fn find_result(&self, job_id: &str) -> Result<Option<ResultRecord>, StoreError>;

    /// Most recently updated results first, at most `limit`.
    async fn list_recent(&self, limit: u32) -> Result<Vec<ResultRecord>, StoreError>;
}

/// PostgreSQL-backed [`JobStore`] and [`ResultStore`].
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert_job(&self, job: &NewJob) -> Result<(), StoreError> {
        JobRepo::create(&self.pool, job).await?;
        Ok(())
    }
}

#[async_trait]
impl ResultStore for PgStore {
    async fn upsert_result(&self, result: &UpsertResult) -> Result<(), StoreError> {
        ResultRepo::upsert(&self.pool, result).await?;
        Ok(())
    }

    async fn set_blob_key(&self, job_id: &str, blob_key: &str) -> Result<(), StoreError> {
        if !ResultRepo::set_blob_key(&self.pool, job_id, blob_key).await? {
            tracing::warn!(job_id, blob_key, "No result row to attach blob key to");
        }
        Ok(())
    }

    async fn find_result(&self, job_id: &str) -> Result<Option<ResultRecord>, StoreError> {
        Ok(ResultRepo::find(&self.pool, job_id).await?)
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<ResultRecord>, StoreError> {
        Ok(ResultRepo::list_recent(&self.pool, i64::from(limit)).await?)
    }
}
