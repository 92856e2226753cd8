//! Per-job state machine.
//!
//! A [`JobHandle`] owns one submission to the compute backend:
//!
//! ```text
//! Submitting --submit()--> (job id assigned) --execution_start--> Pending
//!     Pending --execution_success--> Completed
//!     Pending --execution_error | interrupted | channel loss--> Failed
//! ```
//!
//! `submit` opens the realtime channel before queueing the payload, so no
//! event can be missed, and then hands the channel to a dedicated task.
//! That task is the only writer of the handle's progress and publishes
//! each new value through a `watch` channel. It closes the realtime
//! channel exactly once, on the first terminal progress.
//!
//! Dropping the last reference to a handle cancels its event task, which
//! abandons the channel. The registry relies on this to release resources
//! when a job is removed.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use atelier_core::preset::StepSchedule;
use atelier_core::progress::{JobStatus, Progress};
use atelier_core::types::{ConnectionId, JobId, Timestamp};

use crate::backend::{BackendError, ComputeBackend, RealtimeChannel};
use crate::history::first_image;
use crate::tracker::{Applied, ProgressTracker};

/// Errors surfaced by [`JobHandle`] operations.
///
/// A realtime channel that drops after submission is not an error value:
/// it is reported as a terminal `Failed` progress.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The backend did not accept the job. Never retried.
    #[error("Submission failed: {0}")]
    SubmissionFailed(String),

    /// `submit` was called on a handle that has already been submitted.
    #[error("Job handle was already submitted")]
    AlreadySubmitted,

    /// The result was requested before the job completed successfully.
    #[error("Job has not completed")]
    NotCompleted,

    /// The result was requested from a handle that never got a job id.
    #[error("Job handle has no backend job id")]
    MissingJobId,

    /// The backend's history for the job holds no image output.
    #[error("No image output recorded for job {0}")]
    ArtifactMissing(JobId),

    /// A history or artifact request failed.
    #[error("Backend request failed: {0}")]
    Backend(#[from] BackendError),
}

/// One job on the compute backend.
pub struct JobHandle {
    connection_id: ConnectionId,
    schedule: &'static StepSchedule,
    payload: serde_json::Value,
    backend: Arc<dyn ComputeBackend>,
    job_id: OnceLock<JobId>,
    submitted: AtomicBool,
    progress: Arc<watch::Sender<Option<Progress>>>,
    started_at: Timestamp,
    cancel: CancellationToken,
}

impl JobHandle {
    /// Create an unsubmitted handle with a fresh connection id.
    pub fn new(
        backend: Arc<dyn ComputeBackend>,
        schedule: &'static StepSchedule,
        payload: serde_json::Value,
    ) -> Self {
        let (progress, _) = watch::channel(None);
        Self {
            connection_id: ConnectionId::new(),
            schedule,
            payload,
            backend,
            job_id: OnceLock::new(),
            submitted: AtomicBool::new(false),
            progress: Arc::new(progress),
            started_at: chrono::Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Backend job id, once `submit` has succeeded.
    pub fn job_id(&self) -> Option<&JobId> {
        self.job_id.get()
    }

    pub fn schedule(&self) -> &'static StepSchedule {
        self.schedule
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// Latest known progress; `None` before any event for this job.
    pub fn progress(&self) -> Option<Progress> {
        self.progress.borrow().clone()
    }

    /// Receiver that observes every progress the handle publishes.
    pub fn subscribe(&self) -> watch::Receiver<Option<Progress>> {
        self.progress.subscribe()
    }

    /// Submit the payload and start tracking the job.
    ///
    /// Opens the realtime channel, queues the payload under this handle's
    /// connection id, stores the returned job id and spawns the event
    /// task. Any failure is returned as [`JobError::SubmissionFailed`] and
    /// the channel is closed; nothing is retried.
    pub async fn submit(&self) -> Result<JobId, JobError> {
        if self.submitted.swap(true, Ordering::SeqCst) {
            return Err(JobError::AlreadySubmitted);
        }

        let mut channel = self
            .backend
            .open_channel(self.connection_id)
            .await
            .map_err(|e| JobError::SubmissionFailed(format!("realtime channel: {e}")))?;

        let job_id = match self.backend.submit(&self.payload, self.connection_id).await {
            Ok(Some(job_id)) => job_id,
            Ok(None) => {
                channel.close().await;
                return Err(JobError::SubmissionFailed(
                    "backend response carried no job id".to_string(),
                ));
            }
            Err(e) => {
                channel.close().await;
                return Err(JobError::SubmissionFailed(e.to_string()));
            }
        };

        // `submitted` guarantees a single writer.
        let _ = self.job_id.set(job_id.clone());

        tracing::info!(
            job_id = %job_id,
            connection_id = %self.connection_id,
            preset = %self.schedule.preset,
            "Job submitted",
        );

        let tracker = ProgressTracker::new(job_id.clone(), self.schedule);
        tokio::spawn(run_event_loop(
            channel,
            tracker,
            Arc::clone(&self.progress),
            self.cancel.clone(),
        ));

        Ok(job_id)
    }

    /// Download the job's artifact.
    ///
    /// Only allowed once the job has completed. Looks up the first image
    /// output in the backend's history for the job and fetches its bytes.
    pub async fn fetch_result(&self) -> Result<Vec<u8>, JobError> {
        match self.progress() {
            Some(p) if p.status() == JobStatus::Completed => {}
            _ => return Err(JobError::NotCompleted),
        }
        let job_id = self.job_id.get().ok_or(JobError::MissingJobId)?;

        let history = self.backend.history(job_id).await?;
        let image = first_image(&history, job_id.as_str())
            .ok_or_else(|| JobError::ArtifactMissing(job_id.clone()))?;

        let bytes = self.backend.fetch_image(&image).await?;
        tracing::debug!(
            job_id = %job_id,
            filename = %image.filename,
            size = bytes.len(),
            "Fetched job artifact",
        );
        Ok(bytes)
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("connection_id", &self.connection_id)
            .field("job_id", &self.job_id.get())
            .field("preset", &self.schedule.preset)
            .field("progress", &*self.progress.borrow())
            .field("started_at", &self.started_at)
            .finish()
    }
}

/// Drive one job's realtime channel until a terminal progress or until
/// the owning handle is dropped.
async fn run_event_loop(
    mut channel: Box<dyn RealtimeChannel>,
    mut tracker: ProgressTracker,
    progress: Arc<watch::Sender<Option<Progress>>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(job_id = %tracker.job_id(), "Job handle dropped, abandoning channel");
                return;
            }
            frame = channel.recv() => frame,
        };

        let applied = match frame {
            Some(Ok(text)) => tracker.apply_text(&text),
            Some(Err(e)) => {
                tracing::warn!(job_id = %tracker.job_id(), error = %e, "Realtime channel failed");
                tracker.connection_lost()
            }
            None => {
                tracing::warn!(job_id = %tracker.job_id(), "Realtime channel ended before completion");
                tracker.connection_lost()
            }
        };

        if applied != Applied::Ignored {
            progress.send_replace(tracker.current().cloned());
        }

        if applied == Applied::Terminal {
            channel.close().await;
            if let Some(p) = tracker.current() {
                tracing::info!(
                    job_id = %tracker.job_id(),
                    status = p.status().as_str(),
                    message = %p.message(),
                    "Job reached terminal state",
                );
            }
            return;
        }
    }
}
