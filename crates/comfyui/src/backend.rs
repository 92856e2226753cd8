//! The seam between job handles and the compute backend.
//!
//! A [`JobHandle`](crate::handle::JobHandle) talks to the backend through
//! [`ComputeBackend`] (HTTP calls plus opening a realtime channel) and
//! reads events through a [`RealtimeChannel`]. [`ComfyUIBackend`] is the
//! production implementation on top of [`ComfyUIApi`] and
//! [`ComfyUIClient`].

use std::sync::Arc;

use async_trait::async_trait;

use atelier_core::types::{ConnectionId, JobId};

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::client::{ComfyUIClient, ComfyUIClientError};
use crate::history::ImageRef;

/// A receive error on an established realtime channel.
#[derive(Debug, thiserror::Error)]
#[error("realtime channel error: {0}")]
pub struct ChannelError(pub String);

/// Errors from backend calls.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    #[error(transparent)]
    Client(#[from] ComfyUIClientError),
}

/// An event stream scoped to one connection id.
#[async_trait]
pub trait RealtimeChannel: Send {
    /// Next text frame; `None` once the channel has ended.
    async fn recv(&mut self) -> Option<Result<String, ChannelError>>;

    /// Close the channel.
    async fn close(&mut self);
}

/// Everything a job handle needs from the compute backend.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Open the realtime channel for `connection_id`.
    async fn open_channel(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Box<dyn RealtimeChannel>, BackendError>;

    /// Queue `payload`. `Ok(None)` means the backend answered without a
    /// job id.
    async fn submit(
        &self,
        payload: &serde_json::Value,
        connection_id: ConnectionId,
    ) -> Result<Option<JobId>, BackendError>;

    /// Raw history document for `job_id`.
    async fn history(&self, job_id: &JobId) -> Result<serde_json::Value, BackendError>;

    /// Raw bytes of an output file.
    async fn fetch_image(&self, image: &ImageRef) -> Result<Vec<u8>, BackendError>;
}

/// [`ComputeBackend`] backed by a ComfyUI server.
#[derive(Clone)]
pub struct ComfyUIBackend {
    api: ComfyUIApi,
    client: ComfyUIClient,
}

impl ComfyUIBackend {
    pub fn new(api_url: String, ws_url: String) -> Self {
        Self {
            api: ComfyUIApi::new(api_url),
            client: ComfyUIClient::new(ws_url),
        }
    }

    /// Wrap in an `Arc<dyn ComputeBackend>` for sharing across handles.
    pub fn shared(self) -> Arc<dyn ComputeBackend> {
        Arc::new(self)
    }
}

#[async_trait]
impl ComputeBackend for ComfyUIBackend {
    async fn open_channel(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Box<dyn RealtimeChannel>, BackendError> {
        let conn = self.client.connect(connection_id).await?;
        Ok(Box::new(conn))
    }

    async fn submit(
        &self,
        payload: &serde_json::Value,
        connection_id: ConnectionId,
    ) -> Result<Option<JobId>, BackendError> {
        let queued = self.api.queue_prompt(payload, connection_id).await?;
        if queued.node_errors.as_object().is_some_and(|errors| !errors.is_empty()) {
            tracing::warn!(
                connection_id = %connection_id,
                node_errors = %queued.node_errors,
                "ComfyUI reported node errors for the submitted workflow",
            );
        }
        tracing::debug!(
            connection_id = %connection_id,
            prompt_id = ?queued.prompt_id,
            queue_number = ?queued.number,
            "Workflow queued on ComfyUI",
        );
        Ok(queued.prompt_id.map(JobId::from))
    }

    async fn history(&self, job_id: &JobId) -> Result<serde_json::Value, BackendError> {
        Ok(self.api.history(job_id.as_str()).await?)
    }

    async fn fetch_image(&self, image: &ImageRef) -> Result<Vec<u8>, BackendError> {
        Ok(self.api.view(image).await?)
    }
}
