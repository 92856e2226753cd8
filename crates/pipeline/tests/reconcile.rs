//! Integration tests for the reconciliation loop.
//!
//! Jobs run against the fake backend; durable and blob storage are the
//! in-memory doubles from `common`.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use atelier_core::progress::{JobStatus, MSG_CONNECTION_TERMINATED, MSG_IN_QUEUE};
use atelier_pipeline::reconcile::{
    artifact_key, ReconcileConfig, Reconciler, TickSummary, UploadPolicy,
};
use atelier_pipeline::registry::JobRegistry;
use atelier_storage::CONTENT_TYPE_PNG;

use common::{
    submit_job, wait_for_status, FakeBackend, MemoryBlobStore, MemoryStore, PNG_BYTES,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Fixture {
    backend: Arc<FakeBackend>,
    registry: Arc<JobRegistry>,
    store: Arc<MemoryStore>,
    blobs: Arc<MemoryBlobStore>,
    reconciler: Reconciler,
}

fn fixture_with(blobs: Arc<MemoryBlobStore>, upload_policy: UploadPolicy) -> Fixture {
    let backend = FakeBackend::new();
    let registry = Arc::new(JobRegistry::new());
    let store = MemoryStore::new();
    let reconciler = Reconciler::new(
        Arc::clone(&registry),
        store.clone(),
        blobs.clone(),
        ReconcileConfig {
            interval: Duration::from_millis(10),
            upload_policy,
        },
    );
    Fixture {
        backend,
        registry,
        store,
        blobs,
        reconciler,
    }
}

fn fixture() -> Fixture {
    fixture_with(MemoryBlobStore::new(), UploadPolicy::Once)
}

// ---------------------------------------------------------------------------
// Single tick
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tick_over_mixed_jobs() {
    let f = fixture();

    let queued = submit_job(&f.backend, &f.registry).await;
    let running = submit_job(&f.backend, &f.registry).await;
    let done = submit_job(&f.backend, &f.registry).await;
    let dropped = submit_job(&f.backend, &f.registry).await;

    let running_id = running.job_id().unwrap().clone();
    let done_id = done.job_id().unwrap().clone();
    let dropped_id = dropped.job_id().unwrap().clone();
    let queued_id = queued.job_id().unwrap().clone();

    f.backend.start(&running_id);
    f.backend.succeed(&done_id);
    f.backend.drop_connection(&dropped_id);
    wait_for_status(&running, JobStatus::Pending).await;
    wait_for_status(&done, JobStatus::Completed).await;
    wait_for_status(&dropped, JobStatus::Failed).await;

    let summary = f.reconciler.tick().await;

    assert_eq!(
        summary,
        TickSummary {
            observed: 4,
            pending: 2,
            uploaded: 1,
            failed: 1,
            deferred: 0,
        }
    );
    for id in [&queued_id, &running_id, &done_id, &dropped_id] {
        assert_eq!(f.store.upsert_count(id), 1, "{id}");
    }

    // Queued job with no events yet.
    let record = f.store.result(&queued_id).unwrap();
    assert_eq!(record.status, "pending");
    assert_eq!(record.status_message, MSG_IN_QUEUE);
    assert_eq!(record.progress, 0.0);

    // Completed job: stored and released.
    let record = f.store.result(&done_id).unwrap();
    assert_eq!(record.status, "completed");
    assert_eq!(record.blob_key.as_deref(), Some(artifact_key(&done_id).as_str()));
    let (bytes, content_type) = f.blobs.blobs.lock().unwrap()[&artifact_key(&done_id)].clone();
    assert_eq!(bytes, PNG_BYTES);
    assert_eq!(content_type, CONTENT_TYPE_PNG);

    // Dropped connection: failed and released.
    let record = f.store.result(&dropped_id).unwrap();
    assert_eq!(record.status, "failed");
    assert_eq!(record.error.as_deref(), Some(MSG_CONNECTION_TERMINATED));
    assert!(record.blob_key.is_none());

    assert!(f.registry.get(&done_id).await.is_none());
    assert!(f.registry.get(&dropped_id).await.is_none());
    assert!(f.registry.get(&queued_id).await.is_some());
    assert!(f.registry.get(&running_id).await.is_some());
}

#[tokio::test]
async fn pending_jobs_are_upserted_every_tick() {
    let f = fixture();
    let h = submit_job(&f.backend, &f.registry).await;
    let id = h.job_id().unwrap().clone();

    f.reconciler.tick().await;
    f.reconciler.tick().await;

    assert_eq!(f.store.upsert_count(&id), 2);
    assert_eq!(f.store.results.lock().unwrap().len(), 1);
    assert!(f.registry.get(&id).await.is_some());
}

#[tokio::test]
async fn empty_registry_is_a_no_op() {
    let f = fixture();
    assert_eq!(f.reconciler.tick().await, TickSummary::default());
    assert!(f.store.upserts.lock().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Upload failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_upload_marks_job_failed_and_removes_it() {
    let f = fixture_with(MemoryBlobStore::failing(), UploadPolicy::Once);
    let h = submit_job(&f.backend, &f.registry).await;
    let id = h.job_id().unwrap().clone();
    f.backend.succeed(&id);
    wait_for_status(&h, JobStatus::Completed).await;

    let summary = f.reconciler.tick().await;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.uploaded, 0);
    let record = f.store.result(&id).unwrap();
    assert_eq!(record.status, "failed");
    assert!(record.error.as_deref().unwrap().contains("upload failed"));
    assert!(record.blob_key.is_none());
    assert!(f.registry.is_empty().await);
    assert!(!f.blobs.contains(&artifact_key(&id)));
}

#[tokio::test]
async fn failing_fetch_marks_job_failed() {
    let f = fixture();
    f.backend.fail_fetch.store(true, Ordering::SeqCst);
    let h = submit_job(&f.backend, &f.registry).await;
    let id = h.job_id().unwrap().clone();
    f.backend.succeed(&id);
    wait_for_status(&h, JobStatus::Completed).await;

    f.reconciler.tick().await;

    let record = f.store.result(&id).unwrap();
    assert_eq!(record.status, "failed");
    assert!(record.error.as_deref().unwrap().contains("fetch failed"));
    assert!(f.registry.is_empty().await);
}

#[tokio::test]
async fn retry_policy_defers_then_uploads() {
    let blobs = MemoryBlobStore::new();
    blobs.failures_remaining.store(1, Ordering::SeqCst);
    let f = fixture_with(blobs, UploadPolicy::Attempts(3));
    let h = submit_job(&f.backend, &f.registry).await;
    let id = h.job_id().unwrap().clone();
    f.backend.succeed(&id);
    wait_for_status(&h, JobStatus::Completed).await;

    let first = f.reconciler.tick().await;
    assert_eq!(first.deferred, 1);
    let record = f.store.result(&id).unwrap();
    assert_eq!(record.status, "completed");
    assert!(record.error.is_some());
    assert!(f.registry.get(&id).await.is_some());

    let second = f.reconciler.tick().await;
    assert_eq!(second.uploaded, 1);
    let record = f.store.result(&id).unwrap();
    assert_eq!(record.status, "completed");
    assert!(record.error.is_none());
    assert_eq!(record.blob_key, Some(artifact_key(&id)));
    assert!(f.registry.is_empty().await);
}

#[tokio::test]
async fn retry_policy_gives_up_after_last_attempt() {
    let f = fixture_with(MemoryBlobStore::failing(), UploadPolicy::Attempts(2));
    let h = submit_job(&f.backend, &f.registry).await;
    let id = h.job_id().unwrap().clone();
    f.backend.succeed(&id);
    wait_for_status(&h, JobStatus::Completed).await;

    assert_eq!(f.reconciler.tick().await.deferred, 1);
    assert_eq!(f.reconciler.tick().await.failed, 1);

    assert_eq!(f.store.result(&id).unwrap().status, "failed");
    assert!(f.registry.is_empty().await);
}

#[tokio::test]
async fn unrecorded_upload_failure_keeps_job_until_written() {
    // One failing put: a second upload attempt would succeed.
    let blobs = MemoryBlobStore::new();
    blobs.failures_remaining.store(1, Ordering::SeqCst);
    let f = fixture_with(blobs, UploadPolicy::Once);
    f.store.reject_failed_status.store(true, Ordering::SeqCst);
    let h = submit_job(&f.backend, &f.registry).await;
    let id = h.job_id().unwrap().clone();
    f.backend.succeed(&id);
    wait_for_status(&h, JobStatus::Completed).await;

    let first = f.reconciler.tick().await;
    assert_eq!(first.deferred, 1);
    assert_eq!(first.failed, 0);
    assert!(f.registry.get(&id).await.is_some());

    f.store.reject_failed_status.store(false, Ordering::SeqCst);
    let second = f.reconciler.tick().await;

    assert_eq!(second.failed, 1);
    assert_eq!(second.uploaded, 0);
    let record = f.store.result(&id).unwrap();
    assert_eq!(record.status, "failed");
    assert!(record.error.as_deref().unwrap().contains("upload failed"));
    assert!(record.blob_key.is_none());
    assert!(!f.blobs.contains(&artifact_key(&id)));
    assert!(f.registry.is_empty().await);
}

// ---------------------------------------------------------------------------
// Isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upsert_failure_keeps_job_registered_without_affecting_others() {
    let f = fixture();
    let broken = submit_job(&f.backend, &f.registry).await;
    let healthy = submit_job(&f.backend, &f.registry).await;
    let broken_id = broken.job_id().unwrap().clone();
    let healthy_id = healthy.job_id().unwrap().clone();

    f.backend.succeed(&broken_id);
    f.backend.succeed(&healthy_id);
    wait_for_status(&broken, JobStatus::Completed).await;
    wait_for_status(&healthy, JobStatus::Completed).await;
    f.store
        .fail_upserts_for
        .lock()
        .unwrap()
        .insert(broken_id.to_string());

    let summary = f.reconciler.tick().await;

    assert_eq!(summary.deferred, 1);
    assert_eq!(summary.uploaded, 1);
    assert!(f.registry.get(&broken_id).await.is_some());
    assert!(!f.blobs.contains(&artifact_key(&broken_id)));
    assert!(f.store.result(&broken_id).is_none());
    assert!(f.registry.get(&healthy_id).await.is_none());

    // Storage recovers; the job is picked up on the next tick.
    f.store.fail_upserts_for.lock().unwrap().clear();
    let summary = f.reconciler.tick().await;
    assert_eq!(summary.uploaded, 1);
    assert!(f.registry.is_empty().await);
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_reconciles_until_cancelled() {
    let f = fixture();
    let h = submit_job(&f.backend, &f.registry).await;
    let id = h.job_id().unwrap().clone();
    drop(h);

    let reconciler = Arc::new(f.reconciler);
    let cancel = CancellationToken::new();
    let task = {
        let reconciler = Arc::clone(&reconciler);
        let cancel = cancel.clone();
        tokio::spawn(async move { reconciler.run(cancel).await })
    };

    f.backend.succeed(&id);
    tokio::time::timeout(Duration::from_secs(2), async {
        while !f.registry.is_empty().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job was not reconciled");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("loop did not stop")
        .unwrap();

    assert_eq!(f.store.result(&id).unwrap().blob_key, Some(artifact_key(&id)));
}
