//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (workflow submission, history retrieval,
//! reference image upload, output view URLs) using [`reqwest`]. The
//! [`ComfyBackend`] trait is the seam the job monitor and pipeline
//! depend on, so both can be driven by an in-memory fake in tests.

use async_trait::async_trait;
use easel_core::outputs::MediaLocator;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// HTTP client for a single ComfyUI instance.
#[derive(Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
    /// Per-node validation problems the server accepted anyway.
    #[serde(default)]
    pub node_errors: Value,
}

/// An image to place in the backend's input area.
#[derive(Debug, Clone)]
pub struct UploadImage {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    /// Replace an existing input file of the same name.
    pub overwrite: bool,
}

/// Response from `POST /upload/image`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    /// Name under which the backend stored the file.
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl UploadResponse {
    /// Value to place in a loader node's input: `subfolder/name`, or
    /// just `name` at the input root.
    pub fn handle(&self) -> String {
        if self.subfolder.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.subfolder, self.name)
        }
    }
}

/// One prompt's record from `GET /history/{prompt_id}`.
///
/// The backend only writes this record once execution has finished.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Output records keyed by node ID.
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

/// Execution status attached to a history record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryStatus {
    /// `"success"` or `"error"`.
    #[serde(default)]
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
    /// `[event_name, data]` pairs recorded during execution.
    #[serde(default)]
    pub messages: Vec<Value>,
}

impl HistoryStatus {
    pub fn is_error(&self) -> bool {
        self.status_str.eq_ignore_ascii_case("error")
    }
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// A 2xx response whose body did not have the expected shape.
    #[error("Unexpected ComfyUI response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Operations the orchestrator needs from a generation backend.
#[async_trait]
pub trait ComfyBackend: Send + Sync {
    /// Store an image in the backend's input area.
    async fn upload_image(&self, upload: UploadImage) -> Result<UploadResponse, ComfyUIApiError>;

    /// Queue a workflow graph for execution.
    async fn submit_workflow(
        &self,
        workflow: &Value,
        client_id: Option<&str>,
    ) -> Result<SubmitResponse, ComfyUIApiError>;

    /// Fetch a prompt's history record, or `None` while it is not yet
    /// available.
    async fn get_history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError>;
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        let api_url = api_url.trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    /// HTTP API base URL without a trailing slash.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request. `client_id` is included when the
    /// caller wants push events for this prompt routed to its WebSocket.
    pub async fn submit_workflow(
        &self,
        workflow: &Value,
        client_id: Option<&str>,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let mut body = serde_json::json!({ "prompt": workflow });
        if let Some(client_id) = client_id {
            body["client_id"] = Value::String(client_id.to_string());
        }

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieve the history record for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request. The backend answers
    /// with an object keyed by prompt ID that is empty until the prompt
    /// has finished; that case maps to `Ok(None)`.
    pub async fn get_history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        let mut records: Map<String, Value> = Self::parse_response(response).await?;
        match records.remove(prompt_id) {
            Some(record) => Ok(Some(serde_json::from_value(record)?)),
            None => Ok(None),
        }
    }

    /// Upload an image into the backend's input area.
    ///
    /// Sends a multipart `POST /upload/image` with the file under
    /// `image` and the `overwrite` flag. When the response body does not
    /// name the stored file, the submitted file name is assumed.
    pub async fn upload_image(&self, upload: UploadImage) -> Result<UploadResponse, ComfyUIApiError> {
        let part = reqwest::multipart::Part::bytes(upload.bytes)
            .file_name(upload.file_name.clone())
            .mime_str(&upload.content_type)?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("overwrite", upload.overwrite.to_string());

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .multipart(form)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        let body = response.text().await?;
        match serde_json::from_str::<UploadResponse>(&body) {
            Ok(parsed) if !parsed.name.is_empty() => Ok(parsed),
            _ => {
                tracing::debug!(
                    file_name = %upload.file_name,
                    "Upload response did not name the stored file, using submitted name",
                );
                Ok(UploadResponse {
                    name: upload.file_name,
                    subfolder: String::new(),
                    kind: "input".to_string(),
                })
            }
        }
    }

    /// Render a `/view` URL for an output artifact.
    pub fn view_url(&self, locator: &MediaLocator) -> Result<String, ComfyUIApiError> {
        view_url(&self.api_url, locator)
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

/// Render a `/view` URL for an output artifact under `api_url`.
pub fn view_url(api_url: &str, locator: &MediaLocator) -> Result<String, ComfyUIApiError> {
    let base = format!("{}/view", api_url.trim_end_matches('/'));
    reqwest::Url::parse_with_params(&base, locator.view_query())
        .map(|url| url.to_string())
        .map_err(|e| ComfyUIApiError::InvalidUrl(format!("{base}: {e}")))
}

#[async_trait]
impl ComfyBackend for ComfyUIApi {
    async fn upload_image(&self, upload: UploadImage) -> Result<UploadResponse, ComfyUIApiError> {
        ComfyUIApi::upload_image(self, upload).await
    }

    async fn submit_workflow(
        &self,
        workflow: &Value,
        client_id: Option<&str>,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        ComfyUIApi::submit_workflow(self, workflow, client_id).await
    }

    async fn get_history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        ComfyUIApi::get_history(self, prompt_id).await
    }
}
