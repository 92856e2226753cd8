//! Job submission and status lookups.
//!
//! [`JobService`] is the entry point callers use to start a job and follow
//! it. It owns nothing long-lived itself: the registry, stores and backend
//! are shared with the reconciler.

use std::sync::Arc;

use serde::Serialize;

use atelier_comfyui::backend::ComputeBackend;
use atelier_comfyui::handle::{JobError, JobHandle};
use atelier_comfyui::workflow::{JobParams, WorkflowBuilder, WorkflowError};
use atelier_core::layout::Layout;
use atelier_core::preset::Preset;
use atelier_core::progress::{JobStatus, Progress};
use atelier_core::seed::resolve_seed;
use atelier_core::types::{ConnectionId, JobId};
use atelier_db::models::job::NewJob;
use atelier_db::models::result::ResultRecord;
use atelier_storage::{BlobStore, StorageError};

use crate::registry::JobRegistry;
use crate::store::{JobStore, ResultStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {0} has no stored artifact")]
    NotCompleted(JobId),
}

/// A request to generate one image.
#[derive(Debug, Clone)]
pub struct QueueRequest {
    /// The text as the user wrote it. Always persisted.
    pub prompt: String,
    /// Rewritten text to submit instead of `prompt`, if any.
    pub enhanced_prompt: Option<String>,
    pub preset: Preset,
    /// Defaults to square.
    pub layout: Option<Layout>,
    /// Random when absent.
    pub seed: Option<u32>,
}

/// A job accepted by the backend and registered for reconciliation.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub connection_id: ConnectionId,
    pub preset: Preset,
    pub layout: Layout,
    pub seed: u32,
}

/// Where a status answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    /// The job's handle is still registered.
    Live,
    /// The job has left the registry; this is its last stored state.
    Stored,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub message: String,
    pub progress: f64,
    pub error: Option<String>,
    pub blob_key: Option<String>,
    pub source: StatusSource,
}

impl JobStatusView {
    fn live(job_id: JobId, progress: Progress) -> Self {
        let error =
            (progress.status() == JobStatus::Failed).then(|| progress.message().to_string());
        Self {
            job_id,
            status: progress.status(),
            message: progress.message().to_string(),
            progress: progress.value(),
            error,
            blob_key: None,
            source: StatusSource::Live,
        }
    }

    fn stored(job_id: JobId, record: ResultRecord) -> Self {
        let status = JobStatus::from_name(&record.status).unwrap_or_else(|| {
            tracing::warn!(job_id = %job_id, status = %record.status, "Unknown stored job status");
            JobStatus::Failed
        });
        Self {
            job_id,
            status,
            message: record.status_message,
            progress: record.progress,
            error: record.error,
            blob_key: record.blob_key,
            source: StatusSource::Stored,
        }
    }
}

pub struct JobService {
    builder: Arc<dyn WorkflowBuilder>,
    backend: Arc<dyn ComputeBackend>,
    registry: Arc<JobRegistry>,
    jobs: Arc<dyn JobStore>,
    results: Arc<dyn ResultStore>,
    blobs: Arc<dyn BlobStore>,
}

impl JobService {
    pub fn new(
        builder: Arc<dyn WorkflowBuilder>,
        backend: Arc<dyn ComputeBackend>,
        registry: Arc<JobRegistry>,
        jobs: Arc<dyn JobStore>,
        results: Arc<dyn ResultStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            builder,
            backend,
            registry,
            jobs,
            results,
            blobs,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Build, submit, persist and register a job.
    ///
    /// A submission failure is returned before anything is persisted or
    /// registered. If the job record cannot be written the handle is
    /// dropped, abandoning its connection, and the error is returned.
    pub async fn queue(&self, request: QueueRequest) -> Result<QueuedJob, ServiceError> {
        let QueueRequest {
            prompt,
            enhanced_prompt,
            preset,
            layout,
            seed,
        } = request;
        let seed = resolve_seed(seed);
        let layout = layout.unwrap_or_default();

        let params = JobParams {
            preset,
            text: enhanced_prompt.clone().unwrap_or_else(|| prompt.clone()),
            seed,
            layout,
        };
        let payload = self.builder.build(&params)?;

        let handle = Arc::new(JobHandle::new(
            Arc::clone(&self.backend),
            preset.schedule(),
            payload,
        ));
        let job_id = handle.submit().await?;

        let record = NewJob {
            job_id: job_id.to_string(),
            client_id: handle.connection_id().as_uuid(),
            prompt_text: prompt,
            enhanced_text: enhanced_prompt,
            preset: preset.name().to_string(),
            layout: layout.name().to_string(),
            seed: i64::from(seed),
        };
        if let Err(e) = self.jobs.insert_job(&record).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to persist job, abandoning it");
            return Err(e.into());
        }

        let connection_id = handle.connection_id();
        if self.registry.insert(job_id.clone(), handle).await.is_some() {
            tracing::warn!(job_id = %job_id, "Replaced an existing registry entry");
        }

        tracing::info!(job_id = %job_id, preset = %preset, layout = %layout, seed, "Job queued");
        Ok(QueuedJob {
            job_id,
            connection_id,
            preset,
            layout,
            seed,
        })
    }

    /// Live progress while the job is registered, its stored result after.
    pub async fn status(&self, job_id: &JobId) -> Result<JobStatusView, ServiceError> {
        if let Some(handle) = self.registry.get(job_id).await {
            let progress = handle.progress().unwrap_or_else(Progress::queued);
            return Ok(JobStatusView::live(job_id.clone(), progress));
        }

        match self.results.find_result(job_id.as_str()).await? {
            Some(record) => Ok(JobStatusView::stored(job_id.clone(), record)),
            None => Err(ServiceError::NotFound(job_id.clone())),
        }
    }

    /// Stored results of the most recently updated jobs.
    pub async fn recent(&self, limit: u32) -> Result<Vec<JobStatusView>, ServiceError> {
        let records = self.results.list_recent(limit).await?;
        Ok(records
            .into_iter()
            .map(|record| JobStatusView::stored(JobId::new(record.job_id.clone()), record))
            .collect())
    }

    /// Bytes of the stored artifact.
    pub async fn artifact(&self, job_id: &JobId) -> Result<Vec<u8>, ServiceError> {
        let record = self
            .results
            .find_result(job_id.as_str())
            .await?
            .ok_or_else(|| ServiceError::NotFound(job_id.clone()))?;

        let key = record
            .blob_key
            .ok_or_else(|| ServiceError::NotCompleted(job_id.clone()))?;
        Ok(self.blobs.get(&key).await?)
    }
}
