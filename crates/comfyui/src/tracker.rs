//! Translation of backend events into [`Progress`] for one job.
//!
//! [`ProgressTracker`] is the decoding half of a job handle. It is fed the
//! handle's realtime frames in receive order and keeps the latest
//! progress. It consults the preset's [`StepSchedule`] for every stage
//! event, so a single implementation serves every preset.
//!
//! Rules:
//! - frames for another prompt (or with no prompt scope) are discarded;
//! - running values never decrease and never exceed the schedule's
//!   running ceiling, so only `execution_success` reaches 1;
//! - once a terminal progress is recorded every further frame is ignored.

use atelier_core::preset::StepSchedule;
use atelier_core::progress::{Progress, MSG_CONNECTION_TERMINATED, MSG_INTERRUPTED, MSG_STARTING};
use atelier_core::types::JobId;

use crate::messages::{parse_message, ServerEvent};

/// What a frame did to the tracked progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Not for this job, not a tracked stage, or the job is already done.
    Ignored,
    /// A new running progress was recorded.
    Updated,
    /// A terminal progress was recorded; the channel should be closed.
    Terminal,
}

/// Progress state machine for one submitted job.
#[derive(Debug)]
pub struct ProgressTracker {
    job_id: JobId,
    schedule: &'static StepSchedule,
    current: Option<Progress>,
}

impl ProgressTracker {
    pub fn new(job_id: JobId, schedule: &'static StepSchedule) -> Self {
        Self {
            job_id,
            schedule,
            current: None,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Latest progress, `None` until the first event for this job.
    pub fn current(&self) -> Option<&Progress> {
        self.current.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.current.as_ref().is_some_and(Progress::is_terminal)
    }

    /// Parse and apply one text frame. Unparseable frames are logged and
    /// ignored.
    pub fn apply_text(&mut self, text: &str) -> Applied {
        match parse_message(text) {
            Ok(msg) => self.apply(&msg),
            Err(e) => {
                tracing::debug!(
                    job_id = %self.job_id,
                    error = %e,
                    raw_message = %text,
                    "Ignoring unrecognised ComfyUI message",
                );
                Applied::Ignored
            }
        }
    }

    /// Apply one decoded message.
    pub fn apply(&mut self, msg: &ServerEvent) -> Applied {
        if let ServerEvent::Status(info) = msg {
            if !self.is_terminal() {
                tracing::debug!(
                    job_id = %self.job_id,
                    queue_remaining = ?info.queue_remaining(),
                    "ComfyUI queue status",
                );
            }
            return Applied::Ignored;
        }
        if self.is_terminal() || msg.prompt_id() != Some(self.job_id.as_str()) {
            return Applied::Ignored;
        }

        match msg {
            ServerEvent::ExecutionStart(_) => self.advance(MSG_STARTING, 0.0),
            ServerEvent::Executing(data) => {
                let Some(node) = data.node.as_deref() else {
                    return Applied::Ignored;
                };
                match self.schedule.coarse_fraction(node) {
                    Some((label, fraction)) => self.advance(label, fraction),
                    None => Applied::Ignored,
                }
            }
            ServerEvent::Progress(data) => {
                let Some(node) = data.node.as_deref() else {
                    return Applied::Ignored;
                };
                match self.schedule.continuous_fraction(node, data.value) {
                    Some((label, fraction)) => self.advance(label, fraction),
                    None => Applied::Ignored,
                }
            }
            ServerEvent::ExecutionSuccess(_) => {
                self.current = Some(Progress::completed());
                Applied::Terminal
            }
            ServerEvent::ExecutionError(data) => {
                tracing::warn!(
                    job_id = %self.job_id,
                    node_id = ?data.node_id,
                    error_type = ?data.exception_type,
                    error_message = %data.exception_message,
                    "ComfyUI reported an execution error",
                );
                self.fail(data.exception_message.clone())
            }
            ServerEvent::ExecutionInterrupted(_) => self.fail(MSG_INTERRUPTED),
            ServerEvent::ExecutionCached(data) => {
                tracing::debug!(job_id = %self.job_id, cached = data.nodes.len(), "Execution used cache");
                Applied::Ignored
            }
            ServerEvent::Executed(_) | ServerEvent::Status(_) => Applied::Ignored,
        }
    }

    /// Record that the channel dropped before a terminal event.
    pub fn connection_lost(&mut self) -> Applied {
        if self.is_terminal() {
            return Applied::Ignored;
        }
        self.fail(MSG_CONNECTION_TERMINATED)
    }

    fn advance(&mut self, label: &str, fraction: f64) -> Applied {
        let floor = self.current.as_ref().map_or(0.0, Progress::value);
        let value = fraction.min(self.schedule.running_ceiling()).max(floor);
        match Progress::pending(label, value) {
            Ok(progress) => {
                self.current = Some(progress);
                Applied::Updated
            }
            Err(e) => {
                tracing::error!(
                    job_id = %self.job_id,
                    preset = %self.schedule.preset,
                    error = %e,
                    "Step schedule produced an invalid progress value",
                );
                Applied::Ignored
            }
        }
    }

    fn fail(&mut self, message: impl Into<String>) -> Applied {
        let base = self.current.take().unwrap_or_else(Progress::queued);
        self.current = Some(base.into_failed(message));
        Applied::Terminal
    }
}
