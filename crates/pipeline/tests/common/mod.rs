//! Shared doubles for pipeline integration tests.
//!
//! - [`FakeBackend`]: accepts any number of jobs, hands each its own
//!   in-memory realtime channel, and lets the test push events per job
//! - [`MemoryStore`]: job and result stores with injectable failures
//! - [`MemoryBlobStore`]: blob store that can be told to fail uploads

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use atelier_comfyui::backend::{BackendError, ChannelError, ComputeBackend, RealtimeChannel};
use atelier_comfyui::client::ComfyUIClientError;
use atelier_comfyui::handle::JobHandle;
use atelier_comfyui::history::ImageRef;
use atelier_core::preset::REALISTIC;
use atelier_core::progress::{JobStatus, Progress};
use atelier_core::types::{ConnectionId, JobId};
use atelier_db::models::job::NewJob;
use atelier_db::models::result::{ResultRecord, UpsertResult};
use atelier_pipeline::registry::JobRegistry;
use atelier_pipeline::store::{JobStore, ResultStore, StoreError};
use atelier_storage::{BlobStore, StorageError};

pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake";

type Frame = Result<String, ChannelError>;

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

struct FakeChannel {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl RealtimeChannel for FakeChannel {
    async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

#[derive(Default)]
pub struct FakeBackend {
    next_id: AtomicUsize,
    channels: Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<Frame>>>,
    jobs: Mutex<HashMap<String, ConnectionId>>,
    pub reject: AtomicBool,
    pub fail_fetch: AtomicBool,
    pub submissions: Mutex<Vec<(serde_json::Value, ConnectionId)>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn emit(&self, job_id: &JobId, kind: &str, mut data: serde_json::Value) {
        data["prompt_id"] = json!(job_id.as_str());
        self.send(job_id, Ok(json!({ "type": kind, "data": data }).to_string()));
    }

    pub fn succeed(&self, job_id: &JobId) {
        self.emit(job_id, "execution_success", json!({}));
    }

    pub fn start(&self, job_id: &JobId) {
        self.emit(job_id, "execution_start", json!({}));
    }

    pub fn drop_connection(&self, job_id: &JobId) {
        self.send(job_id, Err(ChannelError("connection reset".to_string())));
    }

    fn send(&self, job_id: &JobId, frame: Frame) {
        let conn = self.jobs.lock().unwrap()[job_id.as_str()];
        if let Some(tx) = self.channels.lock().unwrap().get(&conn) {
            let _ = tx.send(frame);
        }
    }
}

#[async_trait]
impl ComputeBackend for FakeBackend {
    async fn open_channel(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Box<dyn RealtimeChannel>, BackendError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.lock().unwrap().insert(connection_id, tx);
        Ok(Box::new(FakeChannel { rx }))
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
        if self.reject.load(Ordering::SeqCst) {
            return Err(BackendError::Client(ComfyUIClientError::Connection(
                "connection refused".into(),
            )));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let job_id = format!("job-{n}");
        self.jobs.lock().unwrap().insert(job_id.clone(), connection_id);
        Ok(Some(JobId::new(job_id)))
    }

    async fn history(&self, job_id: &JobId) -> Result<serde_json::Value, BackendError> {
        let mut history = serde_json::Map::new();
        history.insert(
            job_id.to_string(),
            json!({ "outputs": { "9": { "images": [
                { "filename": "out.png", "subfolder": "", "type": "output" }
            ] } } }),
        );
        Ok(serde_json::Value::Object(history))
    }

    async fn fetch_image(&self, _image: &ImageRef) -> Result<Vec<u8>, BackendError> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(BackendError::Client(ComfyUIClientError::Connection(
                "view endpoint unavailable".into(),
            )));
        }
        Ok(PNG_BYTES.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    pub jobs: Mutex<HashMap<String, NewJob>>,
    pub results: Mutex<HashMap<String, ResultRecord>>,
    pub upserts: Mutex<Vec<UpsertResult>>,
    pub fail_upserts_for: Mutex<HashSet<String>>,
    /// Reject upserts whose status is `failed`.
    pub reject_failed_status: AtomicBool,
    pub fail_job_inserts: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn result(&self, job_id: &JobId) -> Option<ResultRecord> {
        self.results.lock().unwrap().get(job_id.as_str()).cloned()
    }

    pub fn upsert_count(&self, job_id: &JobId) -> usize {
        self.upserts
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.job_id == job_id.as_str())
            .count()
    }

    fn injected_failure() -> StoreError {
        StoreError::Database(sqlx::Error::PoolTimedOut)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &NewJob) -> Result<(), StoreError> {
        if self.fail_job_inserts.load(Ordering::SeqCst) {
            return Err(Self::injected_failure());
        }
        self.jobs
            .lock()
            .unwrap()
            .insert(job.job_id.clone(), job.clone());
        Ok(())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn upsert_result(&self, result: &UpsertResult) -> Result<(), StoreError> {
        if self.fail_upserts_for.lock().unwrap().contains(&result.job_id) {
            return Err(Self::injected_failure());
        }
        if result.status == "failed" && self.reject_failed_status.load(Ordering::SeqCst) {
            return Err(Self::injected_failure());
        }
        self.upserts.lock().unwrap().push(result.clone());

        let now = chrono::Utc::now();
        let mut results = self.results.lock().unwrap();
        let (created_at, blob_key) = match results.get(&result.job_id) {
            Some(existing) => (existing.created_at, existing.blob_key.clone()),
            None => (now, None),
        };
        results.insert(
            result.job_id.clone(),
            ResultRecord {
                job_id: result.job_id.clone(),
                status: result.status.clone(),
                status_message: result.status_message.clone(),
                progress: result.progress,
                error: result.error.clone(),
                blob_key,
                created_at,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn set_blob_key(&self, job_id: &str, blob_key: &str) -> Result<(), StoreError> {
        if let Some(record) = self.results.lock().unwrap().get_mut(job_id) {
            record.blob_key = Some(blob_key.to_string());
        }
        Ok(())
    }

    async fn find_result(&self, job_id: &str) -> Result<Option<ResultRecord>, StoreError> {
        Ok(self.results.lock().unwrap().get(job_id).cloned())
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<ResultRecord>, StoreError> {
        let mut records: Vec<_> = self.results.lock().unwrap().values().cloned().collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.job_id.cmp(&b.job_id)));
        records.truncate(limit as usize);
        Ok(records)
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    pub blobs: Mutex<HashMap<String, (Vec<u8>, String)>>,
    /// Number of upcoming `put` calls that fail.
    pub failures_remaining: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A store whose every upload fails.
    pub fn failing() -> Arc<Self> {
        let store = Self::default();
        store.failures_remaining.store(usize::MAX, Ordering::SeqCst);
        Arc::new(store)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs.lock().unwrap().contains_key(key)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Backend("bucket unavailable".to_string()));
        }
        self.blobs
            .lock()
            .unwrap()
            .insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.blobs
            .lock()
            .unwrap()
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Submit a realistic job on `backend` and register it.
pub async fn submit_job(backend: &Arc<FakeBackend>, registry: &JobRegistry) -> Arc<JobHandle> {
    let handle = Arc::new(JobHandle::new(
        Arc::clone(backend) as Arc<dyn ComputeBackend>,
        &REALISTIC,
        json!({}),
    ));
    let job_id = handle.submit().await.unwrap();
    registry.insert(job_id, Arc::clone(&handle)).await;
    handle
}

/// Wait until the handle reports `status`.
pub async fn wait_for_status(handle: &JobHandle, status: JobStatus) -> Progress {
    let mut rx = handle.subscribe();
    let found = tokio::time::timeout(
        Duration::from_secs(2),
        rx.wait_for(|p| p.as_ref().is_some_and(|p| p.status() == status)),
    )
    .await
    .expect("timed out waiting for status")
    .expect("progress channel closed");
    found.clone().expect("matched progress is present")
}
