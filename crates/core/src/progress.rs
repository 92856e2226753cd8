//! Job progress value type.
//!
//! A [`Progress`] is the `(status, message, value)` triple a job handle
//! publishes as backend events arrive. Construction enforces the value
//! invariants: `value` lies in `[0, 1]`, and `value == 1` exactly when the
//! status is [`JobStatus::Completed`]. A failed job keeps whatever value it
//! had reached.

use serde::{Deserialize, Serialize};

/// Message used when a job has been submitted but no event arrived yet.
pub const MSG_IN_QUEUE: &str = "In queue";
/// Message published on `execution_start`.
pub const MSG_STARTING: &str = "Starting";
/// Message published on `execution_success`.
pub const MSG_COMPLETED: &str = "Completed";
/// Message published when the realtime channel drops before completion.
pub const MSG_CONNECTION_TERMINATED: &str = "connection terminated";
/// Message published when the backend reports the job was interrupted.
pub const MSG_INTERRUPTED: &str = "Interrupted";

/// Lifecycle status of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    /// Database / wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse from the database `status` column.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// `Completed` and `Failed` admit no further transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Reasons a [`Progress`] cannot be constructed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProgressError {
    #[error("progress value {0} is outside [0, 1]")]
    OutOfRange(f64),

    #[error("progress value {value} is inconsistent with status {status:?}")]
    StatusMismatch { status: JobStatus, value: f64 },
}

/// Snapshot of a job's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawProgress")]
pub struct Progress {
    status: JobStatus,
    message: String,
    value: f64,
}

/// Unchecked wire form; decoding goes through [`Progress::new`].
#[derive(Deserialize)]
struct RawProgress {
    status: JobStatus,
    message: String,
    value: f64,
}

impl TryFrom<RawProgress> for Progress {
    type Error = ProgressError;

    fn try_from(raw: RawProgress) -> Result<Self, Self::Error> {
        Self::new(raw.status, raw.message, raw.value)
    }
}

impl Progress {
    /// Build a progress value, rejecting anything that violates the
    /// `[0, 1]` range or the `value == 1 <=> Completed` rule.
    pub fn new(
        status: JobStatus,
        message: impl Into<String>,
        value: f64,
    ) -> Result<Self, ProgressError> {
        if !(0.0..=1.0).contains(&value) {
            return Err(ProgressError::OutOfRange(value));
        }
        let complete = value == 1.0;
        match status {
            JobStatus::Completed if !complete => {
                return Err(ProgressError::StatusMismatch { status, value })
            }
            JobStatus::Pending if complete => {
                return Err(ProgressError::StatusMismatch { status, value })
            }
            _ => {}
        }
        Ok(Self {
            status,
            message: message.into(),
            value,
        })
    }

    /// A running job at `value`.
    pub fn pending(message: impl Into<String>, value: f64) -> Result<Self, ProgressError> {
        Self::new(JobStatus::Pending, message, value)
    }

    /// The progress reported for a job that has not emitted any event.
    pub fn queued() -> Self {
        Self {
            status: JobStatus::Pending,
            message: MSG_IN_QUEUE.to_string(),
            value: 0.0,
        }
    }

    /// Successful completion. Always `value == 1`.
    pub fn completed() -> Self {
        Self {
            status: JobStatus::Completed,
            message: MSG_COMPLETED.to_string(),
            value: 1.0,
        }
    }

    /// Terminal failure at the value reached so far.
    ///
    /// A failed job may sit at any value, including 1 if the failure is
    /// recorded after the backend reported success.
    pub fn failed(message: impl Into<String>, value: f64) -> Result<Self, ProgressError> {
        Self::new(JobStatus::Failed, message, value)
    }

    /// The same value, now terminally failed.
    pub fn into_failed(self, message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            message: message.into(),
            value: self.value,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
