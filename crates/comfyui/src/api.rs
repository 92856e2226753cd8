//! ComfyUI HTTP endpoints: queue a prompt, read its history, download an
//! output file.

use serde::{Deserialize, Serialize};

use atelier_core::types::ConnectionId;

use crate::history::ImageRef;

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// Transport failure, or a body that did not decode.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("ComfyUI responded {status}: {body}")]
    Status { status: u16, body: String },
}

/// Body of `POST /prompt`.
#[derive(Debug, Serialize)]
struct PromptRequest<'a> {
    prompt: &'a serde_json::Value,
    client_id: ConnectionId,
}

/// Answer to `POST /prompt`.
#[derive(Debug, Deserialize)]
pub struct QueuedPrompt {
    /// Missing when the server accepted the request without queueing it.
    #[serde(default)]
    pub prompt_id: Option<String>,
    /// Queue position.
    #[serde(default)]
    pub number: Option<i64>,
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

/// REST client for one ComfyUI server.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    http: reqwest::Client,
    base_url: String,
}

impl ComfyUIApi {
    /// `base_url` is e.g. `http://host:8188`, without a trailing slash.
    pub fn new(base_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    /// Queue `payload` with events routed to `connection_id`.
    pub async fn queue_prompt(
        &self,
        payload: &serde_json::Value,
        connection_id: ConnectionId,
    ) -> Result<QueuedPrompt, ComfyUIApiError> {
        let request = PromptRequest {
            prompt: payload,
            client_id: connection_id,
        };
        let response = self.http.post(self.url("prompt")).json(&request).send().await?;
        Ok(check_status(response).await?.json().await?)
    }

    /// `GET /history/{prompt_id}` as raw JSON.
    pub async fn history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .http
            .get(self.url(&format!("history/{prompt_id}")))
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    /// Raw bytes of an output file.
    pub async fn view(&self, image: &ImageRef) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .http
            .get(self.url("view"))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.folder_type.as_str()),
            ])
            .send()
            .await?;
        let bytes = check_status(response).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

/// Turn a non-2xx response into [`ComfyUIApiError::Status`].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ComfyUIApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(ComfyUIApiError::Status {
        status: status.as_u16(),
        body,
    })
}
