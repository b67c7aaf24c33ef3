//! End-to-end job execution.
//!
//! [`JobRunner::run_job`] drives one job through the whole pipeline:
//! load template, resolve reference, inject parameters, submit, monitor
//! to a terminal state, extract media. Each call owns its graph; runners
//! are cheap to share across concurrent requests.

use std::sync::Arc;

use easel_comfyui::api::{view_url, ComfyBackend, ComfyUIApi, ComfyUIApiError};
use easel_comfyui::client::ComfyUIClient;
use easel_comfyui::events::JobEvent;
use easel_comfyui::monitor::{JobOutcome, MonitorStrategy};
use easel_comfyui::poll::poll_until_terminal;
use easel_comfyui::processor::watch_events;
use easel_core::graph::WorkflowGraph;
use easel_core::inject::{validate_prompt, InjectionParams, InjectionReport, Injector, NumericOverrides};
use easel_core::outputs::{extract_media, MediaLocator};
use easel_core::types::Timestamp;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::reference::{resolve_reference, ReferenceMedia, ResolvedReference};
use crate::templates::TemplateStore;

/// Broadcast channel capacity for job events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Inputs for one job.
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    /// Template name, with or without `.json`.
    pub template: String,
    pub prompt: String,
    pub overrides: NumericOverrides,
    /// Caller-supplied reference image. When absent, one is looked up
    /// in the asset directory.
    pub reference: Option<ReferenceMedia>,
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    /// The job finished but no media could be extracted.
    NoOutputProduced,
}

/// Result of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub prompt_id: String,
    pub template: String,
    pub status: RunStatus,
    /// Served entirely from the backend cache.
    pub cached: bool,
    pub media: Vec<MediaLocator>,
    pub reference: Option<ResolvedReference>,
    pub injection: InjectionReport,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
}

/// Runs jobs against one backend.
pub struct JobRunner {
    config: PipelineConfig,
    backend: Arc<dyn ComfyBackend>,
    templates: TemplateStore,
    injector: Injector,
    event_tx: broadcast::Sender<JobEvent>,
}

impl JobRunner {
    /// Create a runner talking to the configured ComfyUI instance over
    /// one pooled HTTP client.
    pub fn new(config: PipelineConfig) -> Self {
        let api = ComfyUIApi::new(config.comfyui_url.clone());
        Self::with_backend(config, Arc::new(api))
    }

    /// Create a runner over any backend implementation.
    pub fn with_backend(config: PipelineConfig, backend: Arc<dyn ComfyBackend>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            templates: TemplateStore::new(config.workflows_dir.clone()),
            config,
            backend,
            injector: Injector::default(),
            event_tx,
        }
    }

    /// Replace the override rule table.
    pub fn with_injector(mut self, injector: Injector) -> Self {
        self.injector = injector;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    /// Subscribe to progress events of every job this runner executes.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    /// Render a `/view` URL for an output artifact.
    pub fn view_url(&self, locator: &MediaLocator) -> Result<String, ComfyUIApiError> {
        view_url(&self.config.comfyui_url, locator)
    }

    /// Run a job from a stored template.
    pub async fn run_job(
        &self,
        request: JobRequest,
        cancel: &CancellationToken,
    ) -> Result<JobResult, PipelineError> {
        let graph = self.templates.load(&request.template).await?;
        self.run_graph(graph, request, cancel).await
    }

    /// Run a job from an already-loaded graph. `request.template` only
    /// labels the result and drives the reference lookup.
    pub async fn run_graph(
        &self,
        mut graph: WorkflowGraph,
        request: JobRequest,
        cancel: &CancellationToken,
    ) -> Result<JobResult, PipelineError> {
        let started_at = chrono::Utc::now();
        let JobRequest {
            template,
            prompt,
            overrides,
            reference,
        } = request;

        validate_prompt(&prompt)?;

        let reference = resolve_reference(
            self.backend.as_ref(),
            reference,
            &template,
            &self.config.assets_dir,
            self.config.upload_overwrite,
        )
        .await?;

        let params = InjectionParams::new(
            prompt,
            reference.as_ref().map(|r| r.handle.clone()),
            overrides,
        )?;
        let injection = self.injector.inject(&mut graph, &params);
        let workflow = graph.to_json()?;

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let (prompt_id, outcome) = match self.config.monitor.strategy {
            MonitorStrategy::Poll => {
                let client_id = uuid::Uuid::new_v4().to_string();
                let prompt_id = self.submit(&workflow, Some(&client_id)).await?;
                let outcome =
                    poll_until_terminal(self.backend.as_ref(), &prompt_id, &self.config.monitor, cancel).await;
                (prompt_id, outcome)
            }
            MonitorStrategy::Events => {
                // Connect before submitting so no event for this prompt is missed.
                let client = ComfyUIClient::new(self.config.comfyui_ws_url.clone());
                let mut conn = client.connect().await?;
                let prompt_id = self.submit(&workflow, Some(&conn.client_id)).await?;
                let outcome = watch_events(
                    &mut conn.ws_stream,
                    &prompt_id,
                    self.backend.as_ref(),
                    &self.config.monitor,
                    cancel,
                    Some(&self.event_tx),
                )
                .await;
                if let Err(e) = conn.ws_stream.close(None).await {
                    tracing::debug!(error = %e, "Failed to close ComfyUI WebSocket");
                }
                (prompt_id, outcome)
            }
        };

        let outcome = outcome?;
        let _ = self.event_tx.send(JobEvent::Finished {
            prompt_id: prompt_id.clone(),
            state: outcome.state(),
        });

        let (outputs, cached) = match outcome {
            JobOutcome::Succeeded { outputs } => (outputs, false),
            JobOutcome::Cached { outputs } => (outputs, true),
            JobOutcome::Failed(failure) => {
                tracing::error!(
                    prompt_id = %prompt_id,
                    node_id = ?failure.node_id,
                    error = %failure.message,
                    "Job failed",
                );
                return Err(PipelineError::ExecutionFailed(failure));
            }
        };

        let media = extract_media(&outputs);
        let status = if media.is_empty() {
            tracing::warn!(prompt_id = %prompt_id, "Job finished without producing media");
            RunStatus::NoOutputProduced
        } else {
            RunStatus::Succeeded
        };

        tracing::info!(
            prompt_id = %prompt_id,
            template = %template,
            media = media.len(),
            cached,
            "Job finished",
        );

        Ok(JobResult {
            prompt_id,
            template,
            status,
            cached,
            media,
            reference,
            injection,
            started_at,
            finished_at: chrono::Utc::now(),
        })
    }

    async fn submit(
        &self,
        workflow: &serde_json::Value,
        client_id: Option<&str>,
    ) -> Result<String, PipelineError> {
        let response = self
            .backend
            .submit_workflow(workflow, client_id)
            .await
            .map_err(|e| match e {
                ComfyUIApiError::ApiError { status, body } => {
                    PipelineError::SubmissionRejected { status, body }
                }
                other => PipelineError::Backend(other),
            })?;

        tracing::info!(
            prompt_id = %response.prompt_id,
            queue_position = response.number,
            "Workflow submitted",
        );
        let _ = self.event_tx.send(JobEvent::Queued {
            prompt_id: response.prompt_id.clone(),
        });
        Ok(response.prompt_id)
    }
}
