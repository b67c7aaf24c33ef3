//! Workflow template discovery and loading.
//!
//! Templates are API-format workflow JSON files kept flat in one
//! directory and addressed by file name (`portrait.json`) or by stem
//! (`portrait`).

use std::path::{Path, PathBuf};

use easel_core::graph::WorkflowGraph;

use crate::error::PipelineError;

/// File extension for workflow templates.
pub const TEMPLATE_EXTENSION: &str = "json";

/// A directory of workflow templates.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    dir: PathBuf,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File names of all templates, sorted.
    pub async fn list(&self) -> Result<Vec<String>, PipelineError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_template_file(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load and validate a template by name.
    ///
    /// `.json` is appended when missing. Names that would escape the
    /// template directory are reported as not found.
    pub async fn load(&self, name: &str) -> Result<WorkflowGraph, PipelineError> {
        let file_name = template_file_name(name)?;
        let path = self.dir.join(&file_name);

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::TemplateNotFound(file_name));
            }
            Err(e) => return Err(e.into()),
        };

        let graph = text
            .parse::<WorkflowGraph>()
            .map_err(|source| PipelineError::InvalidTemplate {
                name: file_name.clone(),
                source,
            })?;

        tracing::debug!(template = %file_name, nodes = graph.len(), "Loaded workflow template");
        Ok(graph)
    }
}

/// Normalize a template name to its file name.
pub fn template_file_name(name: &str) -> Result<String, PipelineError> {
    let name = name.trim();
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
    {
        return Err(PipelineError::TemplateNotFound(name.to_string()));
    }
    if is_template_file(name) {
        Ok(name.to_string())
    } else {
        Ok(format!("{name}.{TEMPLATE_EXTENSION}"))
    }
}

/// Template name without its `.json` extension.
pub fn template_stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, ext)) if ext.eq_ignore_ascii_case(TEMPLATE_EXTENSION) && !stem.is_empty() => stem,
        _ => name,
    }
}

fn is_template_file(name: &str) -> bool {
    matches!(
        name.rsplit_once('.'),
        Some((stem, ext)) if !stem.is_empty() && ext.eq_ignore_ascii_case(TEMPLATE_EXTENSION)
    )
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const MINIMAL: &str = r#"{"1":{"class_type":"SaveImage","inputs":{}}}"#;

    #[test]
    fn file_name_appends_extension() {
        assert_eq!(template_file_name("portrait").unwrap(), "portrait.json");
        assert_eq!(template_file_name("portrait.json").unwrap(), "portrait.json");
        assert_eq!(template_file_name("Portrait.JSON").unwrap(), "Portrait.JSON");
    }

    #[test]
    fn file_name_rejects_traversal() {
        for bad in ["../secret", "a/b", "a\\b", "", "  "] {
            assert_matches!(template_file_name(bad), Err(PipelineError::TemplateNotFound(_)));
        }
    }

    #[test]
    fn stem_strips_json_only() {
        assert_eq!(template_stem("fox.json"), "fox");
        assert_eq!(template_stem("fox"), "fox");
        assert_eq!(template_stem("fox.v2.json"), "fox.v2");
    }

    #[tokio::test]
    async fn list_returns_sorted_json_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.json", "a.JSON", "notes.txt", ".json"] {
            std::fs::write(dir.path().join(name), MINIMAL).unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.json")).unwrap();

        let names = TemplateStore::new(dir.path()).list().await.unwrap();
        assert_eq!(names, vec!["a.JSON", "b.json"]);
    }

    #[tokio::test]
    async fn list_missing_directory_is_io_error() {
        let store = TemplateStore::new("/definitely/not/here");
        assert_matches!(store.list().await, Err(PipelineError::Io(_)));
    }

    #[tokio::test]
    async fn load_by_stem_or_file_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fox.json"), MINIMAL).unwrap();
        let store = TemplateStore::new(dir.path());

        assert_eq!(store.load("fox").await.unwrap().len(), 1);
        assert_eq!(store.load("fox.json").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn load_missing_template_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::new(dir.path());
        assert_matches!(
            store.load("ghost").await,
            Err(PipelineError::TemplateNotFound(name)) if name == "ghost.json"
        );
    }

    #[tokio::test]
    async fn load_malformed_template_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), r#"{"1":{"inputs":{}}}"#).unwrap();
        let store = TemplateStore::new(dir.path());
        assert_matches!(
            store.load("bad").await,
            Err(PipelineError::InvalidTemplate { name, .. }) if name == "bad.json"
        );
    }
}
