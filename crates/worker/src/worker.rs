//! Startup and shutdown of the worker process.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use atelier_comfyui::backend::ComfyUIBackend;
use atelier_comfyui::workflow::TemplateWorkflowBuilder;
use atelier_pipeline::reconcile::Reconciler;
use atelier_pipeline::registry::JobRegistry;
use atelier_pipeline::service::JobService;
use atelier_pipeline::store::PgStore;
use atelier_storage::{BlobStore, LocalBlobStore, S3BlobStore};

use crate::config::{BlobBackend, WorkerConfig};

/// How long shutdown waits for the reconciliation loop to finish its tick.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("Database health check failed: {0}")]
    HealthCheck(#[source] sqlx::Error),

    #[error("Failed to run database migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Failed to prepare blob directory: {0}")]
    BlobDir(#[from] std::io::Error),
}

/// A running set of shared components: the job registry, the service
/// callers queue through, and the reconciler that drains the registry.
pub struct Worker {
    registry: Arc<JobRegistry>,
    service: Arc<JobService>,
    reconciler: Arc<Reconciler>,
}

impl Worker {
    /// Connect to the database and the configured blob store and build
    /// the pipeline.
    pub async fn connect(config: &WorkerConfig) -> Result<Self, StartupError> {
        let pool = atelier_db::create_pool(&config.database_url)
            .await
            .map_err(StartupError::Connect)?;
        tracing::info!("Database connection pool created");

        atelier_db::health_check(&pool)
            .await
            .map_err(StartupError::HealthCheck)?;
        tracing::info!("Database health check passed");

        atelier_db::run_migrations(&pool).await?;
        tracing::info!("Database migrations applied");

        let blobs: Arc<dyn BlobStore> = match &config.blob_backend {
            BlobBackend::Local { dir } => {
                tokio::fs::create_dir_all(dir).await?;
                tracing::info!(dir = %dir.display(), "Using local blob store");
                Arc::new(LocalBlobStore::new(dir.clone()))
            }
            BlobBackend::S3(s3) => Arc::new(S3BlobStore::connect(s3.clone()).await),
        };

        let backend =
            ComfyUIBackend::new(config.comfyui_api_url.clone(), config.comfyui_ws_url.clone())
                .shared();
        tracing::info!(
            api_url = %config.comfyui_api_url,
            ws_url = %config.comfyui_ws_url,
            "ComfyUI backend configured"
        );

        let store = Arc::new(PgStore::new(pool));
        let registry = Arc::new(JobRegistry::new());

        let service = Arc::new(JobService::new(
            Arc::new(TemplateWorkflowBuilder),
            backend,
            Arc::clone(&registry),
            store.clone(),
            store.clone(),
            Arc::clone(&blobs),
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&registry),
            store,
            blobs,
            config.reconcile,
        ));

        Ok(Self {
            registry,
            service,
            reconciler,
        })
    }

    /// Entry point for queueing jobs and reading their status.
    pub fn service(&self) -> Arc<JobService> {
        Arc::clone(&self.service)
    }

    /// Run the reconciliation loop until `shutdown` resolves, then stop it
    /// and release every live job.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let cancel = CancellationToken::new();
        let reconciler = Arc::clone(&self.reconciler);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            reconciler.run(loop_cancel).await;
        });

        shutdown.await;

        cancel.cancel();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
            tracing::warn!("Reconciliation loop did not stop in time");
        }
        tracing::info!("Reconciliation loop stopped");

        // Durable results keep their last written state.
        let dropped = self.registry.clear().await;
        tracing::info!(dropped, "Released live jobs");
    }
}
