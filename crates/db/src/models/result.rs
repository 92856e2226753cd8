//! Result record models.

use serde::Serialize;
use sqlx::FromRow;

use atelier_core::types::Timestamp;

/// A row from the `job_results` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ResultRecord {
    pub job_id: String,
    pub status: String,
    pub status_message: String,
    pub progress: f64,
    pub error: Option<String>,
    /// Set once, after the artifact is uploaded.
    pub blob_key: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Observed state written on every reconciliation tick.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertResult {
    pub job_id: String,
    pub status: String,
    pub status_message: String,
    pub progress: f64,
    pub error: Option<String>,
}
