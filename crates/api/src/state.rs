use std::sync::Arc;

use easel_pipeline::runner::JobRunner;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; everything inside is behind `Arc` or already `Clone`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Runs generation jobs against the configured ComfyUI instance.
    pub runner: Arc<JobRunner>,
    /// Cancelled on shutdown so in-flight jobs stop waiting.
    pub shutdown: CancellationToken,
}
