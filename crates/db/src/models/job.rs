//! Job record models.

use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use atelier_core::types::Timestamp;

/// A row from the `jobs` table. Written once at submission.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub client_id: Uuid,
    pub prompt_text: String,
    pub enhanced_text: Option<String>,
    pub preset: String,
    pub layout: String,
    pub seed: i64,
    pub created_at: Timestamp,
}

/// Insert payload for [`JobRepo::create`](crate::repositories::JobRepo::create).
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: String,
    pub client_id: Uuid,
    pub prompt_text: String,
    pub enhanced_text: Option<String>,
    pub preset: String,
    pub layout: String,
    pub seed: i64,
}
