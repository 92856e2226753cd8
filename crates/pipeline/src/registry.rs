//! Live job registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use atelier_comfyui::handle::JobHandle;
use atelier_core::types::JobId;

/// Every job that has been submitted and not yet reconciled to a terminal
/// outcome.
///
/// Thread-safe via interior `RwLock`; shared through `Arc` between the
/// service that inserts jobs and the reconciler that removes them.
/// Removing a job drops the registry's reference to its handle, which is
/// what releases the handle's realtime connection.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Arc<JobHandle>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle. Returns the handle previously stored under `id`.
    pub async fn insert(&self, id: JobId, handle: Arc<JobHandle>) -> Option<Arc<JobHandle>> {
        self.jobs.write().await.insert(id, handle)
    }

    pub async fn get(&self, id: &JobId) -> Option<Arc<JobHandle>> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &JobId) -> Option<Arc<JobHandle>> {
        self.jobs.write().await.remove(id)
    }

    /// Point-in-time copy of all entries, in no particular order.
    pub async fn snapshot(&self) -> Vec<(JobId, Arc<JobHandle>)> {
        self.jobs
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Drop every handle. Used at shutdown.
    pub async fn clear(&self) -> usize {
        let mut jobs = self.jobs.write().await;
        let dropped = jobs.len();
        jobs.clear();
        dropped
    }
}
