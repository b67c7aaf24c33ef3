use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use easel_comfyui::monitor::MonitorError;
use easel_pipeline::error::PipelineError;
use serde_json::{json, Value};

/// Application-level error type for HTTP handlers.
///
/// Wraps [`PipelineError`] for job failures and adds HTTP-specific variants.
/// Implements [`IntoResponse`] to produce consistent JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            AppError::Pipeline(err) => classify_pipeline_error(err),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone(), None),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                internal()
            }
        };

        let mut body = json!({
            "error": message,
            "code": code,
        });
        if let Some(details) = details {
            body["details"] = details;
        }

        (status, axum::Json(body)).into_response()
    }
}

type Classified = (StatusCode, &'static str, String, Option<Value>);

/// Map a job failure to an HTTP status, error code, message and optional
/// diagnostic payload.
///
/// Backend rejections and execution failures are surfaced verbatim so
/// callers can display them directly.
fn classify_pipeline_error(err: &PipelineError) -> Classified {
    match err {
        PipelineError::TemplateNotFound(name) => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("Workflow '{name}' not found"),
            None,
        ),
        PipelineError::Validation(msg) => {
            (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone(), None)
        }
        PipelineError::UploadFailed { status, body } => (
            StatusCode::BAD_REQUEST,
            "UPLOAD_FAILED",
            "Failed to upload reference image".to_string(),
            Some(json!({ "status": status, "body": body })),
        ),
        PipelineError::SubmissionRejected { body, .. } => {
            (StatusCode::BAD_GATEWAY, "SUBMISSION_REJECTED", body.clone(), None)
        }
        PipelineError::ExecutionFailed(failure) => (
            StatusCode::BAD_GATEWAY,
            "EXECUTION_FAILED",
            failure.message.clone(),
            serde_json::to_value(failure).ok(),
        ),
        PipelineError::Monitor(MonitorError::Timeout { .. }) => {
            (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", err.to_string(), None)
        }
        other => {
            tracing::error!(error = %other, "Job error");
            internal()
        }
    }
}

fn internal() -> Classified {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
        None,
    )
}
