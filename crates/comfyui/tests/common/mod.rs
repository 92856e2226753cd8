//! Scripted compute backend for exercising job handles without a server.
//!
//! [`ScriptedBackend`] hands out a single in-memory realtime channel whose
//! frames are pushed by the test through an [`EventFeed`].

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use atelier_comfyui::backend::{BackendError, ChannelError, ComputeBackend, RealtimeChannel};
use atelier_comfyui::client::ComfyUIClientError;
use atelier_comfyui::handle::JobHandle;
use atelier_comfyui::history::ImageRef;
use atelier_core::progress::Progress;
use atelier_core::types::{ConnectionId, JobId};

pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake";

type Frame = Result<String, ChannelError>;

/// Realtime channel fed by an unbounded mpsc queue.
pub struct ScriptedChannel {
    rx: mpsc::UnboundedReceiver<Frame>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl RealtimeChannel for ScriptedChannel {
    async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Test-side sender for one job's frames.
#[derive(Clone)]
pub struct EventFeed {
    tx: mpsc::UnboundedSender<Frame>,
    job_id: String,
}

impl EventFeed {
    pub fn send(&self, kind: &str, mut data: serde_json::Value) {
        data["prompt_id"] = json!(self.job_id);
        let _ = self.tx.send(Ok(json!({ "type": kind, "data": data }).to_string()));
    }

    pub fn raw(&self, text: &str) {
        let _ = self.tx.send(Ok(text.to_string()));
    }

    pub fn started(&self) {
        self.send("execution_start", json!({}));
    }

    pub fn executing(&self, node: &str) {
        self.send("executing", json!({ "node": node }));
    }

    pub fn progress(&self, node: &str, value: f64) {
        self.send("progress", json!({ "node": node, "value": value, "max": 30 }));
    }

    pub fn succeeded(&self) {
        self.send("execution_success", json!({}));
    }

    pub fn channel_error(&self, message: &str) {
        let _ = self.tx.send(Err(ChannelError(message.to_string())));
    }
}

/// How the scripted backend answers `submit`.
pub enum SubmitOutcome {
    Accept(JobId),
    NoJobId,
    Reject,
}

pub struct ScriptedBackend {
    outcome: SubmitOutcome,
    channel: Mutex<Option<ScriptedChannel>>,
    pub closes: Arc<AtomicUsize>,
    pub submissions: Mutex<Vec<(serde_json::Value, ConnectionId)>>,
    pub history: Mutex<serde_json::Value>,
}

impl ScriptedBackend {
    /// A backend that accepts one submission as `job_id`.
    pub fn accepting(job_id: &str) -> (Arc<Self>, EventFeed) {
        Self::with_outcome(SubmitOutcome::Accept(JobId::new(job_id)), job_id)
    }

    pub fn with_outcome(outcome: SubmitOutcome, job_id: &str) -> (Arc<Self>, EventFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(Self {
            outcome,
            channel: Mutex::new(Some(ScriptedChannel {
                rx,
                closes: Arc::clone(&closes),
            })),
            closes,
            submissions: Mutex::new(Vec::new()),
            history: Mutex::new(history_for(job_id)),
        });
        let feed = EventFeed {
            tx,
            job_id: job_id.to_string(),
        };
        (backend, feed)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeBackend for ScriptedBackend {
    async fn open_channel(
        &self,
        _connection_id: ConnectionId,
    ) -> Result<Box<dyn RealtimeChannel>, BackendError> {
        let channel = self.channel.lock().unwrap().take().ok_or_else(|| {
            BackendError::Client(ComfyUIClientError::Connection("channel already taken".into()))
        })?;
        Ok(Box::new(channel))
    }

    async fn submit(
        &self,
        payload: &serde_json::Value,
        connection_id: ConnectionId,
    ) -> Result<Option<JobId>, BackendError> {
        self.submissions
            .lock()
            .unwrap()
            .push((payload.clone(), connection_id));
        match &self.outcome {
            SubmitOutcome::Accept(id) => Ok(Some(id.clone())),
            SubmitOutcome::NoJobId => Ok(None),
            SubmitOutcome::Reject => Err(BackendError::Client(ComfyUIClientError::Connection(
                "connection refused".into(),
            ))),
        }
    }

    async fn history(&self, _job_id: &JobId) -> Result<serde_json::Value, BackendError> {
        Ok(self.history.lock().unwrap().clone())
    }

    async fn fetch_image(&self, image: &ImageRef) -> Result<Vec<u8>, BackendError> {
        assert_eq!(image.folder_type, "output");
        Ok(PNG_BYTES.to_vec())
    }
}

/// A `/history` document with one saved image for `job_id`.
pub fn history_for(job_id: &str) -> serde_json::Value {
    let mut history = serde_json::Map::new();
    history.insert(
        job_id.to_string(),
        json!({ "outputs": { "9": { "images": [
            { "filename": "atelier_00001_.png", "subfolder": "", "type": "output" }
        ] } } }),
    );
    serde_json::Value::Object(history)
}

/// Wait until the handle publishes a progress matching `pred`.
pub async fn wait_for_progress(handle: &JobHandle, pred: impl Fn(&Progress) -> bool) -> Progress {
    let mut rx = handle.subscribe();
    let found = tokio::time::timeout(
        Duration::from_secs(2),
        rx.wait_for(|p| p.as_ref().is_some_and(&pred)),
    )
    .await
    .expect("timed out waiting for progress")
    .expect("progress channel closed");
    found.clone().expect("matched progress is present")
}

/// Wait until the backend has seen at least one channel close.
pub async fn wait_for_close(backend: &ScriptedBackend) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while backend.close_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for channel close");
}
