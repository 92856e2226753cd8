//! Periodic reconciliation of live jobs into durable storage.
//!
//! Every tick snapshots the [`JobRegistry`], upserts one result record per
//! job, uploads the artifacts of completed jobs and removes terminal jobs
//! from the registry. This loop is the only place terminal side effects
//! happen; job handles never touch storage themselves.
//!
//! Failures are isolated per job. A job whose upsert fails stays registered
//! and is retried on the next tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use atelier_comfyui::handle::JobHandle;
use atelier_core::progress::{JobStatus, Progress};
use atelier_core::types::JobId;
use atelier_db::models::result::UpsertResult;
use atelier_storage::{BlobStore, CONTENT_TYPE_PNG};

use crate::registry::JobRegistry;
use crate::store::ResultStore;

/// Default time between ticks.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Blob key of a job's artifact.
pub fn artifact_key(job_id: &JobId) -> String {
    format!("{job_id}.png")
}

/// What to do when a completed job's artifact cannot be stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UploadPolicy {
    /// One attempt; the job is marked failed and removed on error.
    #[default]
    Once,
    /// Keep the job registered and retry on later ticks, up to `n`
    /// attempts in total.
    Attempts(u32),
}

impl UploadPolicy {
    /// Build from an attempt count; `1` (or `0`) is [`UploadPolicy::Once`].
    pub fn from_attempts(n: u32) -> Self {
        if n <= 1 {
            Self::Once
        } else {
            Self::Attempts(n)
        }
    }

    pub fn max_attempts(self) -> u32 {
        match self {
            Self::Once => 1,
            Self::Attempts(n) => n.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileConfig {
    pub interval: Duration,
    pub upload_policy: UploadPolicy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            upload_policy: UploadPolicy::Once,
        }
    }
}

/// Counts from one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Jobs in the registry snapshot.
    pub observed: usize,
    /// Still running; left registered.
    pub pending: usize,
    /// Completed and stored; removed.
    pub uploaded: usize,
    /// Failed, or completed but not storable; removed.
    pub failed: usize,
    /// Left registered for a later tick after a storage error.
    pub deferred: usize,
}

impl TickSummary {
    /// Jobs removed from the registry during the tick.
    pub fn removed(&self) -> usize {
        self.uploaded + self.failed
    }
}

enum Outcome {
    Pending,
    Uploaded,
    Failed,
    Deferred,
}

struct UploadFailure {
    attempts: u32,
    reason: String,
}

pub struct Reconciler {
    registry: Arc<JobRegistry>,
    results: Arc<dyn ResultStore>,
    blobs: Arc<dyn BlobStore>,
    config: ReconcileConfig,
    /// Failed uploads per job still registered.
    upload_failures: Mutex<HashMap<JobId, UploadFailure>>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<JobRegistry>,
        results: Arc<dyn ResultStore>,
        blobs: Arc<dyn BlobStore>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            registry,
            results,
            blobs,
            config,
            upload_failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Run ticks on the configured interval until `cancel` is triggered.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            max_upload_attempts = self.config.upload_policy.max_attempts(),
            "Reconciliation loop started"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Reconciliation loop stopping");
                    break;
                }
                _ = interval.tick() => {
                    let summary = self.tick().await;
                    if summary.removed() > 0 || summary.deferred > 0 {
                        tracing::info!(
                            observed = summary.observed,
                            pending = summary.pending,
                            uploaded = summary.uploaded,
                            failed = summary.failed,
                            deferred = summary.deferred,
                            "Reconciliation tick"
                        );
                    } else {
                        tracing::debug!(
                            observed = summary.observed,
                            pending = summary.pending,
                            "Reconciliation tick"
                        );
                    }
                }
            }
        }
    }

    /// Reconcile every registered job once.
    pub async fn tick(&self) -> TickSummary {
        let entries = self.registry.snapshot().await;
        let mut summary = TickSummary {
            observed: entries.len(),
            ..TickSummary::default()
        };

        for (job_id, handle) in entries {
            match self.reconcile_job(&job_id, &handle).await {
                Outcome::Pending => summary.pending += 1,
                Outcome::Uploaded => summary.uploaded += 1,
                Outcome::Failed => summary.failed += 1,
                Outcome::Deferred => summary.deferred += 1,
            }
        }
        summary
    }

    async fn reconcile_job(&self, job_id: &JobId, handle: &JobHandle) -> Outcome {
        let progress = handle.progress().unwrap_or_else(Progress::queued);

        if let Err(e) = self.results.upsert_result(&observed_result(job_id, &progress)).await {
            tracing::warn!(job_id = %job_id, error = %e, "Result upsert failed, retrying next tick");
            return Outcome::Deferred;
        }

        match progress.status() {
            JobStatus::Pending => Outcome::Pending,
            JobStatus::Failed => {
                tracing::info!(job_id = %job_id, message = %progress.message(), "Job failed");
                self.release(job_id).await;
                Outcome::Failed
            }
            JobStatus::Completed => self.store_artifact(job_id, handle).await,
        }
    }

    async fn store_artifact(&self, job_id: &JobId, handle: &JobHandle) -> Outcome {
        let max_attempts = self.config.upload_policy.max_attempts();

        // Attempts already used up: only the failed record is still owed.
        let (attempts, reason) = match self.exhausted(job_id, max_attempts) {
            Some(reason) => (max_attempts, reason),
            None => match self.upload(job_id, handle).await {
                Ok(key) => {
                    tracing::info!(job_id = %job_id, blob_key = %key, "Job artifact stored");
                    self.release(job_id).await;
                    return Outcome::Uploaded;
                }
                Err(reason) => (self.record_attempt(job_id, &reason), reason),
            },
        };

        if attempts < max_attempts {
            tracing::warn!(
                job_id = %job_id,
                attempt = attempts,
                max_attempts,
                error = %reason,
                "Artifact upload failed, retrying next tick"
            );
            let pending_retry = UpsertResult {
                error: Some(reason),
                ..observed_result(job_id, &Progress::completed())
            };
            if let Err(e) = self.results.upsert_result(&pending_retry).await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to record upload error");
            }
            return Outcome::Deferred;
        }

        tracing::error!(job_id = %job_id, attempts, error = %reason, "Artifact upload failed");
        let failed = UpsertResult {
            job_id: job_id.to_string(),
            status: JobStatus::Failed.as_str().to_string(),
            status_message: reason.clone(),
            progress: 1.0,
            error: Some(reason),
        };
        if let Err(e) = self.results.upsert_result(&failed).await {
            tracing::warn!(
                job_id = %job_id,
                error = %e,
                "Failed to record upload failure, retrying next tick"
            );
            return Outcome::Deferred;
        }
        self.release(job_id).await;
        Outcome::Failed
    }

    /// Fetch, put and record the artifact. Errors are rendered for the
    /// result record.
    async fn upload(&self, job_id: &JobId, handle: &JobHandle) -> Result<String, String> {
        let bytes = handle
            .fetch_result()
            .await
            .map_err(|e| format!("artifact fetch failed: {e}"))?;

        let key = artifact_key(job_id);
        self.blobs
            .put(&key, bytes, CONTENT_TYPE_PNG)
            .await
            .map_err(|e| format!("artifact upload failed: {e}"))?;

        self.results
            .set_blob_key(job_id.as_str(), &key)
            .await
            .map_err(|e| format!("recording blob key failed: {e}"))?;

        Ok(key)
    }

    /// The last upload error, if `job_id` has no attempts left.
    fn exhausted(&self, job_id: &JobId, max_attempts: u32) -> Option<String> {
        self.upload_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(job_id)
            .filter(|failure| failure.attempts >= max_attempts)
            .map(|failure| failure.reason.clone())
    }

    fn record_attempt(&self, job_id: &JobId, reason: &str) -> u32 {
        let mut failures = self
            .upload_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let failure = failures.entry(job_id.clone()).or_insert(UploadFailure {
            attempts: 0,
            reason: String::new(),
        });
        failure.attempts += 1;
        failure.reason = reason.to_string();
        failure.attempts
    }

    async fn release(&self, job_id: &JobId) {
        self.registry.remove(job_id).await;
        self.upload_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(job_id);
    }
}

/// Result record for a job's current progress.
fn observed_result(job_id: &JobId, progress: &Progress) -> UpsertResult {
    let error = (progress.status() == JobStatus::Failed).then(|| progress.message().to_string());
    UpsertResult {
        job_id: job_id.to_string(),
        status: progress.status().as_str().to_string(),
        status_message: progress.message().to_string(),
        progress: progress.value(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_core::progress::MSG_CONNECTION_TERMINATED;

    #[test]
    fn artifact_key_is_job_id_png() {
        assert_eq!(artifact_key(&JobId::new("abc-123")), "abc-123.png");
    }

    #[test]
    fn upload_policy_from_attempts() {
        assert_eq!(UploadPolicy::from_attempts(0), UploadPolicy::Once);
        assert_eq!(UploadPolicy::from_attempts(1), UploadPolicy::Once);
        assert_eq!(UploadPolicy::from_attempts(3), UploadPolicy::Attempts(3));
        assert_eq!(UploadPolicy::Attempts(0).max_attempts(), 1);
        assert_eq!(UploadPolicy::default().max_attempts(), 1);
    }

    #[test]
    fn observed_result_sets_error_only_for_failures() {
        let id = JobId::new("j");
        let pending = observed_result(&id, &Progress::queued());
        assert_eq!(pending.status, "pending");
        assert_eq!(pending.status_message, "In queue");
        assert!(pending.error.is_none());

        let failed = Progress::pending("Sampling", 0.5)
            .unwrap()
            .into_failed(MSG_CONNECTION_TERMINATED);
        let record = observed_result(&id, &failed);
        assert_eq!(record.status, "failed");
        assert_eq!(record.progress, 0.5);
        assert_eq!(record.error.as_deref(), Some(MSG_CONNECTION_TERMINATED));
    }

    #[test]
    fn default_config() {
        let config = ReconcileConfig::default();
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.upload_policy, UploadPolicy::Once);
    }
}
