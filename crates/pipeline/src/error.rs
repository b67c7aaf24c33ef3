use easel_comfyui::api::ComfyUIApiError;
use easel_comfyui::client::ComfyUIClientError;
use easel_comfyui::monitor::{ExecutionFailure, MonitorError};
use easel_core::error::CoreError;

/// Failures of a job run.
///
/// Transient history failures never appear here; the monitor retries
/// them. A run that succeeds without media is not an error either (see
/// `RunStatus::NoOutputProduced`).
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Workflow template not found: {0}")]
    TemplateNotFound(String),

    #[error("Workflow template '{name}' is invalid: {source}")]
    InvalidTemplate {
        name: String,
        #[source]
        source: CoreError,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    /// Upload of caller-supplied reference media was rejected.
    #[error("Failed to upload reference image: {body}")]
    UploadFailed { status: Option<u16>, body: String },

    /// The backend refused the graph at submission.
    #[error("Workflow submission rejected ({status}): {body}")]
    SubmissionRejected { status: u16, body: String },

    /// The backend could not be reached or answered unexpectedly.
    #[error(transparent)]
    Backend(#[from] ComfyUIApiError),

    #[error(transparent)]
    Connection(#[from] ComfyUIClientError),

    #[error("Execution failed: {}", .0.message)]
    ExecutionFailed(ExecutionFailure),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error("Job cancelled before submission")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<CoreError> for PipelineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => Self::Validation(msg),
            CoreError::Internal(msg) => Self::Internal(msg),
        }
    }
}
