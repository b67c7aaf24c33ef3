//! Reference media resolution and upload.
//!
//! A job's reference image comes either from the caller (explicit) or
//! from a naming heuristic over the local asset directory (guessed).
//! Explicit media must upload successfully; a guessed file that fails to
//! upload is skipped with a warning.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use easel_comfyui::api::{ComfyBackend, ComfyUIApiError, UploadImage};
use regex::Regex;
use serde::Serialize;

use crate::error::PipelineError;
use crate::templates::template_stem;

/// Extensions tried after the template stem, in order.
pub const REFERENCE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Content type used when neither the caller nor the extension names one.
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

static REF_JPEG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)ref.*\.jpe?g$").expect("valid regex"));

static REFERENCE_PNG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)reference.*\.png$").expect("valid regex"));

/// Caller-supplied reference media.
#[derive(Debug, Clone, Default)]
pub struct ReferenceMedia {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Where a resolved reference came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum ReferenceSource {
    Explicit,
    Guessed(PathBuf),
}

/// An uploaded reference and the handle the backend knows it by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedReference {
    pub handle: String,
    pub source: ReferenceSource,
}

/// Resolve and upload the reference for a job.
///
/// Explicit media wins. Without it, the asset directory is searched for
/// a candidate matching `template_name`; no candidate yields `Ok(None)`.
pub async fn resolve_reference(
    backend: &dyn ComfyBackend,
    explicit: Option<ReferenceMedia>,
    template_name: &str,
    assets_dir: &Path,
    overwrite: bool,
) -> Result<Option<ResolvedReference>, PipelineError> {
    if let Some(media) = explicit {
        let handle = upload_explicit(backend, media, overwrite).await?;
        return Ok(Some(ResolvedReference {
            handle,
            source: ReferenceSource::Explicit,
        }));
    }

    let Some(path) = find_reference_candidate(assets_dir, template_name) else {
        tracing::debug!(template = %template_name, "No reference image found");
        return Ok(None);
    };

    match upload_guessed(backend, &path, overwrite).await {
        Ok(handle) => Ok(Some(ResolvedReference {
            handle,
            source: ReferenceSource::Guessed(path),
        })),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Guessed reference image could not be uploaded, continuing without it",
            );
            Ok(None)
        }
    }
}

async fn upload_explicit(
    backend: &dyn ComfyBackend,
    media: ReferenceMedia,
    overwrite: bool,
) -> Result<String, PipelineError> {
    let file_name = media
        .file_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| format!("reference_{}.png", uuid::Uuid::new_v4().simple()));
    let content_type = media
        .content_type
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string());

    let upload = UploadImage {
        file_name,
        content_type,
        bytes: media.bytes,
        overwrite,
    };

    match backend.upload_image(upload).await {
        Ok(stored) => {
            let handle = stored.handle();
            tracing::info!(handle = %handle, "Uploaded reference image");
            Ok(handle)
        }
        Err(ComfyUIApiError::ApiError { status, body }) => Err(PipelineError::UploadFailed {
            status: Some(status),
            body,
        }),
        Err(other) => Err(PipelineError::UploadFailed {
            status: None,
            body: other.to_string(),
        }),
    }
}

async fn upload_guessed(
    backend: &dyn ComfyBackend,
    path: &Path,
    overwrite: bool,
) -> Result<String, PipelineError> {
    let bytes = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| PipelineError::Validation(format!("Unusable file name: {}", path.display())))?;

    let upload = UploadImage {
        content_type: content_type_for(&file_name).to_string(),
        file_name,
        bytes,
        overwrite,
    };
    let stored = backend.upload_image(upload).await?;
    let handle = stored.handle();
    tracing::info!(handle = %handle, path = %path.display(), "Uploaded reference image");
    Ok(handle)
}

/// Find a local reference image for a template.
///
/// Tries `<stem>.jpg`, `.jpeg`, `.png`, `.webp`; then the first file
/// (by name) whose name contains `ref` and ends in `.jpg`/`.jpeg`; then
/// the first containing `reference` and ending in `.png`. Both fuzzy
/// patterns are case-insensitive substring matches (`*ref*.jpg`).
pub fn find_reference_candidate(dir: &Path, template_name: &str) -> Option<PathBuf> {
    let stem = template_stem(template_name);
    for ext in REFERENCE_EXTENSIONS {
        let path = dir.join(format!("{stem}.{ext}"));
        if path.is_file() {
            return Some(path);
        }
    }

    let mut names: Vec<String> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();

    [&*REF_JPEG, &*REFERENCE_PNG]
        .into_iter()
        .find_map(|pattern| names.iter().find(|name| pattern.is_match(name)))
        .map(|name| dir.join(name))
}

/// Content type implied by an image file's extension.
pub fn content_type_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        _ => FALLBACK_CONTENT_TYPE,
    }
}
