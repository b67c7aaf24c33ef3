#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use easel_comfyui::api::{
    ComfyBackend, ComfyUIApiError, HistoryEntry, SubmitResponse, UploadImage, UploadResponse,
};
use easel_comfyui::backoff::BackoffConfig;
use easel_comfyui::monitor::MonitorConfig;
use easel_pipeline::config::PipelineConfig;
use easel_pipeline::runner::JobRunner;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use easel_api::config::ServerConfig;
use easel_api::routes;
use easel_api::state::AppState;

pub const BOUNDARY: &str = "easel-test-boundary";

// ---------------------------------------------------------------------------
// Fake backend
// ---------------------------------------------------------------------------

/// In-memory ComfyUI stand-in. Every job gets `prompt-1` and finishes
/// immediately with `history` (`Value::Null` means the job never finishes).
#[derive(Default)]
pub struct FakeBackend {
    pub uploads: Mutex<Vec<UploadImage>>,
    pub submissions: Mutex<Vec<Value>>,
    pub history: Value,
    pub reject_upload: bool,
    pub reject_submit: bool,
}

impl FakeBackend {
    pub fn finishing_with(history: Value) -> Self {
        Self {
            history,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ComfyBackend for FakeBackend {
    async fn upload_image(&self, upload: UploadImage) -> Result<UploadResponse, ComfyUIApiError> {
        if self.reject_upload {
            return Err(ComfyUIApiError::ApiError {
                status: 400,
                body: "Invalid image file".into(),
            });
        }
        let name = upload.file_name.clone();
        self.uploads.lock().unwrap().push(upload);
        Ok(UploadResponse {
            name,
            subfolder: String::new(),
            kind: "input".into(),
        })
    }

    async fn submit_workflow(
        &self,
        workflow: &Value,
        _client_id: Option<&str>,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        if self.reject_submit {
            return Err(ComfyUIApiError::ApiError {
                status: 400,
                body: "prompt_outputs_failed_validation".into(),
            });
        }
        self.submissions.lock().unwrap().push(workflow.clone());
        Ok(SubmitResponse {
            prompt_id: "prompt-1".into(),
            number: 0,
            node_errors: json!({}),
        })
    }

    async fn get_history(&self, _prompt_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        if self.history.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(self.history.clone()).unwrap()))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn fox_workflow() -> Value {
    json!({
        "3": {
            "class_type": "KSampler",
            "inputs": { "seed": 1, "steps": 20, "cfg": 7.0, "model": ["4", 0] }
        },
        "5": {
            "class_type": "EmptyLatentImage",
            "inputs": { "width": 512, "height": 512, "batch_size": 1 }
        },
        "6": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": "{{prompt}}", "clip": ["4", 1] }
        },
        "10": {
            "class_type": "LoadImage",
            "inputs": { "image": "{{reference_image}}" }
        }
    })
}

pub fn success_history() -> Value {
    json!({
        "outputs": {
            "9": { "images": [{ "filename": "fox_00001_.png", "subfolder": "", "type": "output" }] }
        },
        "status": { "status_str": "success", "completed": true, "messages": [] }
    })
}

pub fn write_template(dir: &Path, name: &str, workflow: &Value) {
    std::fs::write(dir.join(name), serde_json::to_string(workflow).unwrap()).unwrap();
}

/// Build a test `ServerConfig` whose pipeline reads templates from `dir`
/// and polls quickly.
pub fn test_config(dir: &Path) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        pipeline: PipelineConfig {
            workflows_dir: dir.to_path_buf(),
            assets_dir: dir.to_path_buf(),
            monitor: MonitorConfig {
                poll_interval: Duration::from_millis(5),
                backoff: BackoffConfig::fixed(Duration::from_millis(5)),
                max_wait: Some(Duration::from_millis(200)),
                ..Default::default()
            },
            ..Default::default()
        },
    }
}

/// Build the full application router with all middleware layers over
/// the given backend.
///
/// Mirrors the router construction in `main.rs` so integration tests
/// exercise the same middleware stack that production uses.
pub fn build_test_app(dir: &Path, backend: Arc<FakeBackend>) -> Router {
    let config = test_config(dir);
    let runner = JobRunner::with_backend(config.pipeline.clone(), backend);

    let state = AppState {
        config: Arc::new(config),
        runner: Arc::new(runner),
        shutdown: CancellationToken::new(),
    };

    let cors = CorsLayer::new()
        .allow_origin(["http://localhost:5173".parse().unwrap()])
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .allow_credentials(true)
        .max_age(Duration::from_secs(3600));

    let request_id_header = HeaderName::from_static("x-request-id");

    Router::new()
        .merge(routes::health::router())
        .nest("/api/v1", routes::api_routes())
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn get(app: Router, uri: &str) -> Response {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// One multipart form part.
pub enum Part<'a> {
    Text(&'a str, &'a str),
    /// Field name, file name, content type, bytes.
    File(&'a str, &'a str, &'a str, &'a [u8]),
}

pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File(name, file_name, content_type, bytes) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                         Content-Type: {content_type}\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(bytes);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub async fn post_multipart(app: Router, uri: &str, parts: &[Part<'_>]) -> Response {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap();
    app.oneshot(request).await.unwrap()
}
