//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the push-channel URL for one ComfyUI
//! instance. Call [`ComfyUIClient::connect`] (or
//! [`connect_as`](ComfyUIClient::connect_as) with a known client ID) to
//! establish a live [`ComfyUIConnection`].

use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Raw WebSocket stream type for a ComfyUI push channel.
pub type ComfyUIStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for a ComfyUI push channel.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
}

/// A live WebSocket connection to a ComfyUI instance.
pub struct ComfyUIConnection {
    /// Client ID sent during the handshake. Prompts submitted with the
    /// same ID have their events routed to this connection.
    pub client_id: String,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: ComfyUIStream,
}

impl ComfyUIClient {
    /// * `ws_url` - WebSocket base URL, e.g. `ws://host:8188`.
    pub fn new(ws_url: String) -> Self {
        let ws_url = ws_url.trim_end_matches('/').to_string();
        Self { ws_url }
    }

    /// WebSocket base URL (e.g. `ws://host:8188`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Connect with a freshly generated `client_id` (UUID v4).
    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        self.connect_as(uuid::Uuid::new_v4().to_string()).await
    }

    /// Connect to the `/ws` endpoint under the given client ID.
    pub async fn connect_as(&self, client_id: String) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(client_id = %client_id, "Connected to ComfyUI at {}", self.ws_url);

        Ok(ComfyUIConnection {
            client_id,
            ws_stream,
        })
    }
}

/// Derive the push-channel base URL from an HTTP API base URL by
/// swapping the scheme (`http` to `ws`, `https` to `wss`).
pub fn ws_url_from_api_url(api_url: &str) -> String {
    let api_url = api_url.trim_end_matches('/');
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_url.to_string()
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the initial WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}
