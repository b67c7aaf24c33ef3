//! Handler for running a single generation job.

use std::str::FromStr;

use axum::extract::{Multipart, State};
use axum::Json;
use easel_core::inject::NumericOverrides;
use easel_core::outputs::MediaLocator;
use easel_pipeline::reference::{ReferenceMedia, ReferenceSource};
use easel_pipeline::runner::{JobRequest, RunStatus};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// Outcome of a generate request.
#[derive(Debug, Serialize)]
pub struct GenerateResult {
    /// `success`, or `no_output` when the job finished without media.
    pub status: &'static str,
    /// Browser-loadable `/view` URLs, one per media item.
    pub images: Vec<String>,
    pub media: Vec<MediaLocator>,
    pub workflow: String,
    pub prompt: String,
    /// Backend handle of the reference image used, if any.
    pub reference_image: Option<String>,
    /// Whether the reference was supplied by the caller or found locally.
    pub reference_source: Option<ReferenceSource>,
    pub prompt_id: String,
    pub cached: bool,
}

/// POST /api/v1/generate
///
/// Multipart fields: `workflow_name`, `prompt`, the optional numeric
/// overrides (`width`, `height`, `frame_count`, `frame_rate`,
/// `sampler_steps`, `sampler_cfg`, `sampling_shift`) and an optional
/// `reference_image` file. Blocks until the job reaches a terminal state.
pub async fn generate(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<DataResponse<GenerateResult>>> {
    let mut workflow_name: Option<String> = None;
    let mut prompt: Option<String> = None;
    let mut overrides = NumericOverrides::default();
    let mut reference: Option<ReferenceMedia> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "reference_image" => {
                let file_name = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                // Browsers send an empty part when no file was chosen.
                if !bytes.is_empty() {
                    reference = Some(ReferenceMedia {
                        file_name,
                        content_type,
                        bytes: bytes.to_vec(),
                    });
                }
            }
            _ => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                match name.as_str() {
                    "workflow_name" => workflow_name = Some(text),
                    "prompt" => prompt = Some(text),
                    "width" => overrides.width = parse_field(&name, &text)?,
                    "height" => overrides.height = parse_field(&name, &text)?,
                    "frame_count" => overrides.frame_count = parse_field(&name, &text)?,
                    "frame_rate" => overrides.frame_rate = parse_field(&name, &text)?,
                    "sampler_steps" => overrides.sampler_steps = parse_field(&name, &text)?,
                    "sampler_cfg" => overrides.sampler_cfg = parse_field(&name, &text)?,
                    "sampling_shift" => overrides.sampling_shift = parse_field(&name, &text)?,
                    other => {
                        tracing::debug!(field = %other, "Ignoring unknown form field");
                    }
                }
            }
        }
    }

    let workflow_name = workflow_name
        .filter(|w| !w.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing required field 'workflow_name'".into()))?;
    let prompt =
        prompt.ok_or_else(|| AppError::BadRequest("Missing required field 'prompt'".into()))?;

    tracing::info!(
        workflow = %workflow_name,
        has_reference = reference.is_some(),
        "Generate request received",
    );

    let request = JobRequest {
        template: workflow_name.clone(),
        prompt: prompt.clone(),
        overrides,
        reference,
    };
    let cancel = state.shutdown.child_token();
    let result = state.runner.run_job(request, &cancel).await?;

    let images = result
        .media
        .iter()
        .map(|locator| state.runner.view_url(locator))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::InternalError(e.to_string()))?;

    let status = match result.status {
        RunStatus::Succeeded => "success",
        RunStatus::NoOutputProduced => "no_output",
    };
    let (reference_image, reference_source) = match result.reference {
        Some(r) => (Some(r.handle), Some(r.source)),
        None => (None, None),
    };

    Ok(Json(DataResponse {
        data: GenerateResult {
            status,
            images,
            media: result.media,
            workflow: workflow_name,
            prompt,
            reference_image,
            reference_source,
            prompt_id: result.prompt_id,
            cached: result.cached,
        },
    }))
}

/// Parse an optional numeric form field. Blank values mean "not set".
fn parse_field<T: FromStr>(name: &str, raw: &str) -> AppResult<Option<T>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| AppError::BadRequest(format!("Invalid value for '{name}': {raw}")))
}
