//! Normalization of ComfyUI history outputs into media locators.
//!
//! Output nodes report their artifacts in several shapes:
//!
//! - `{"images": [{"filename": ..., "subfolder": ..., "type": ...}]}`
//! - `{"videos" | "video" | "files": item-or-list}`, where an item names
//!   its file under `filename` or `file`
//! - a bare `{"filename": "clip.mp4", ...}` record
//!
//! [`extract_media`] folds all of them into one flat list of
//! [`MediaLocator`]s. Rendering a locator into a URL is left to callers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Storage classification used when an item omits `type`.
pub const DEFAULT_MEDIA_TYPE: &str = "output";

/// Keys holding video/file items, checked in this order.
const VIDEO_KEYS: &[&str] = &["videos", "video", "files"];

/// Container extensions accepted for the bare-`filename` fallback.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "mkv", "avi", "gif"];

/// One resolvable output artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaLocator {
    pub filename: String,
    /// Subdirectory under the storage root; empty for the root itself.
    #[serde(default)]
    pub subfolder: String,
    /// Backend storage classification (`output`, `temp`, `input`).
    #[serde(rename = "type")]
    pub kind: String,
}

impl MediaLocator {
    /// Query pairs for the backend `/view` endpoint. `subfolder` is only
    /// included when non-empty.
    pub fn view_query(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = vec![("filename", self.filename.as_str())];
        if !self.subfolder.is_empty() {
            pairs.push(("subfolder", self.subfolder.as_str()));
        }
        pairs.push(("type", self.kind.as_str()));
        pairs
    }
}

/// Extract every media item from a history `outputs` mapping.
///
/// Nodes are visited in map order; per node, `images` items come first,
/// then items under `videos`, `video` and `files` in that order, and a
/// bare video `filename` only when none of those keys exist. Items
/// without a usable filename are skipped.
pub fn extract_media(outputs: &Map<String, Value>) -> Vec<MediaLocator> {
    let mut media = Vec::new();
    for (node_id, record) in outputs {
        let before = media.len();
        extract_node(record, &mut media);
        let found = media.len() - before;
        if found > 0 {
            tracing::trace!(node_id = %node_id, found, "Extracted node outputs");
        }
    }
    media
}

fn extract_node(node_output: &Value, media: &mut Vec<MediaLocator>) {
    let Some(record) = node_output.as_object() else {
        return;
    };

    let mut recognized = false;

    if let Some(images) = record.get("images") {
        recognized = true;
        for item in as_items(images) {
            if let Some(locator) = locator_from(item, &["filename"]) {
                media.push(locator);
            }
        }
    }

    for key in VIDEO_KEYS {
        if let Some(value) = record.get(*key) {
            recognized = true;
            for item in as_items(value) {
                if let Some(locator) = locator_from(item, &["filename", "file"]) {
                    media.push(locator);
                }
            }
        }
    }

    if recognized {
        return;
    }

    if let Some(filename) = record.get("filename").and_then(Value::as_str) {
        if is_video_file(filename) {
            if let Some(locator) = locator_from(node_output, &["filename"]) {
                media.push(locator);
            }
        }
    }
}

/// Normalize a single item or a list of items into a list.
fn as_items(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Build a locator from an item, taking the filename from the first of
/// `filename_keys` that holds a non-empty string. A bare string item is
/// treated as the filename itself.
fn locator_from(item: &Value, filename_keys: &[&str]) -> Option<MediaLocator> {
    if let Some(name) = item.as_str() {
        return non_empty(name).map(|filename| MediaLocator {
            filename,
            subfolder: String::new(),
            kind: DEFAULT_MEDIA_TYPE.to_string(),
        });
    }

    let obj = item.as_object()?;
    let filename = filename_keys
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str).and_then(non_empty))?;

    let subfolder = obj
        .get("subfolder")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .and_then(non_empty)
        .unwrap_or_else(|| DEFAULT_MEDIA_TYPE.to_string());

    Some(MediaLocator {
        filename,
        subfolder,
        kind,
    })
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Whether a filename carries a known video container extension.
pub fn is_video_file(filename: &str) -> bool {
    let Some((_, ext)) = filename.rsplit_once('.') else {
        return false;
    };
    let ext = ext.to_lowercase();
    VIDEO_EXTENSIONS.contains(&ext.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn locator(filename: &str, subfolder: &str, kind: &str) -> MediaLocator {
        MediaLocator {
            filename: filename.to_string(),
            subfolder: subfolder.to_string(),
            kind: kind.to_string(),
        }
    }

    #[test]
    fn images_with_defaults() {
        let media = extract_media(&outputs(json!({
            "9": { "images": [
                { "filename": "a.png", "subfolder": "run1", "type": "temp" },
                { "filename": "b.png" }
            ] }
        })));
        assert_eq!(
            media,
            vec![locator("a.png", "run1", "temp"), locator("b.png", "", "output")]
        );
    }

    #[test]
    fn video_keys_accept_single_item_or_list() {
        let media = extract_media(&outputs(json!({
            "1": { "videos": [{ "filename": "a.mp4" }, { "file": "b.mp4", "subfolder": "v" }] },
            "2": { "video": { "file": "c.webm", "type": "temp" } },
            "3": { "files": "d.mov" }
        })));
        assert_eq!(
            media,
            vec![
                locator("a.mp4", "", "output"),
                locator("b.mp4", "v", "output"),
                locator("c.webm", "", "temp"),
                locator("d.mov", "", "output"),
            ]
        );
    }

    #[test]
    fn images_precede_videos_within_a_node() {
        let media = extract_media(&outputs(json!({
            "5": {
                "videos": [{ "filename": "clip.mp4" }],
                "images": [{ "filename": "frame.png" }]
            }
        })));
        assert_eq!(
            media,
            vec![locator("frame.png", "", "output"), locator("clip.mp4", "", "output")]
        );
    }

    #[test]
    fn bare_video_filename_fallback() {
        let media = extract_media(&outputs(json!({
            "7": { "filename": "Clip.MP4", "subfolder": "vid" }
        })));
        assert_eq!(media, vec![locator("Clip.MP4", "vid", "output")]);
    }

    #[test]
    fn bare_non_video_filename_is_ignored() {
        let media = extract_media(&outputs(json!({
            "7": { "filename": "notes.txt" }
        })));
        assert!(media.is_empty());
    }

    #[test]
    fn bare_filename_ignored_when_recognized_key_present() {
        let media = extract_media(&outputs(json!({
            "7": { "images": [], "filename": "clip.mp4" }
        })));
        assert!(media.is_empty());
    }

    #[test]
    fn items_without_filename_are_skipped() {
        let media = extract_media(&outputs(json!({
            "1": { "images": [{ "subfolder": "x" }, { "filename": "" }, { "filename": "ok.png" }] },
            "2": { "videos": [{ "format": "mp4" }] },
            "3": { "text": ["hello"] }
        })));
        assert_eq!(media, vec![locator("ok.png", "", "output")]);
    }

    #[test]
    fn empty_outputs_yield_empty_list() {
        assert!(extract_media(&Map::new()).is_empty());
        assert!(extract_media(&outputs(json!({ "1": {}, "2": { "images": [] } }))).is_empty());
    }

    #[test]
    fn view_query_omits_empty_subfolder() {
        assert_eq!(
            locator("a.png", "", "output").view_query(),
            vec![("filename", "a.png"), ("type", "output")]
        );
        assert_eq!(
            locator("a.png", "s", "temp").view_query(),
            vec![("filename", "a.png"), ("subfolder", "s"), ("type", "temp")]
        );
    }

    #[test]
    fn locator_serializes_kind_as_type() {
        let json = serde_json::to_value(locator("a.png", "", "output")).unwrap();
        assert_eq!(json, json!({ "filename": "a.png", "subfolder": "", "type": "output" }));
    }

    #[test]
    fn video_extension_detection() {
        assert!(is_video_file("a.webm"));
        assert!(is_video_file("a.b.MKV"));
        assert!(!is_video_file("a.png"));
        assert!(!is_video_file("mp4"));
    }
}
