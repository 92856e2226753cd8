//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the WebSocket base URL of a ComfyUI instance.
//! Call [`ComfyUIClient::connect`] to open a [`ComfyUIConnection`] scoped
//! to one connection id. A connection serves exactly one job handle and
//! is never reconnected.

use async_trait::async_trait;
use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use atelier_core::types::ConnectionId;

use crate::backend::{ChannelError, RealtimeChannel};

/// Configuration handle for a ComfyUI instance's WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
}

/// A live WebSocket connection to a ComfyUI instance.
pub struct ComfyUIConnection {
    /// Client ID sent during the WebSocket handshake.
    pub connection_id: ConnectionId,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl ComfyUIClient {
    /// Create a new client.
    ///
    /// * `ws_url` - WebSocket base URL, e.g. `ws://host:8188`.
    pub fn new(ws_url: String) -> Self {
        Self { ws_url }
    }

    /// WebSocket base URL (e.g. `ws://host:8188`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Connect to the ComfyUI WebSocket endpoint.
    ///
    /// The `connection_id` is appended as the `clientId` query parameter
    /// so that ComfyUI addresses the events of prompts submitted with the
    /// same client ID to this socket.
    pub async fn connect(
        &self,
        connection_id: ConnectionId,
    ) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, connection_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::debug!(
            connection_id = %connection_id,
            "Connected to ComfyUI at {}",
            self.ws_url,
        );

        Ok(ComfyUIConnection {
            connection_id,
            ws_stream,
        })
    }
}

#[async_trait]
impl RealtimeChannel for ComfyUIConnection {
    /// Next text frame.
    ///
    /// Binary frames (preview images) and control frames are skipped. A
    /// close frame or the end of the stream yields `None`.
    async fn recv(&mut self) -> Option<Result<String, ChannelError>> {
        while let Some(msg_result) = self.ws_stream.next().await {
            match msg_result {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Binary(_)) => {
                    tracing::trace!(
                        connection_id = %self.connection_id,
                        "Ignoring binary message (preview image)"
                    );
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Ok(Message::Close(frame)) => {
                    tracing::debug!(connection_id = %self.connection_id, ?frame, "ComfyUI WebSocket closed");
                    return None;
                }
                Err(e) => return Some(Err(ChannelError(e.to_string()))),
            }
        }
        None
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws_stream.close(None).await {
            tracing::debug!(
                connection_id = %self.connection_id,
                error = %e,
                "WebSocket close handshake failed"
            );
        }
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the initial WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}
