use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use easel_comfyui::backoff::BackoffConfig;
use easel_comfyui::client::ws_url_from_api_url;
use easel_comfyui::monitor::{MonitorConfig, MonitorStrategy, DEFAULT_MAX_WAIT};

/// Default ComfyUI HTTP base URL.
pub const DEFAULT_COMFYUI_URL: &str = "http://127.0.0.1:8188";

const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;

/// Pipeline configuration loaded from environment variables.
///
/// All fields have defaults suitable for a local ComfyUI install.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Backend HTTP base URL.
    pub comfyui_url: String,
    /// Backend push-channel base URL.
    pub comfyui_ws_url: String,
    /// Directory holding workflow templates (`*.json`).
    pub workflows_dir: PathBuf,
    /// Directory searched for reference images when none is supplied.
    pub assets_dir: PathBuf,
    /// Monitor strategy and timing.
    pub monitor: MonitorConfig,
    /// Replace same-named files on upload.
    pub upload_overwrite: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            comfyui_url: DEFAULT_COMFYUI_URL.to_string(),
            comfyui_ws_url: ws_url_from_api_url(DEFAULT_COMFYUI_URL),
            workflows_dir: PathBuf::from("."),
            assets_dir: PathBuf::from("."),
            monitor: MonitorConfig::default(),
            upload_overwrite: true,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                       |
    /// |------------------------|-------------------------------|
    /// | `COMFYUI_URL`          | `http://127.0.0.1:8188`       |
    /// | `COMFYUI_WS_URL`       | `COMFYUI_URL` with `ws` scheme |
    /// | `WORKFLOWS_DIR`        | `.`                           |
    /// | `ASSETS_DIR`           | `WORKFLOWS_DIR`               |
    /// | `MONITOR_STRATEGY`     | `poll`                        |
    /// | `POLL_INTERVAL_MS`     | `2000`                        |
    /// | `RETRY_BACKOFF_MS`     | `1000`                        |
    /// | `RETRY_BACKOFF_MAX_MS` | `RETRY_BACKOFF_MS`            |
    /// | `MAX_WAIT_SECS`        | `1800` (`0` = no limit)       |
    /// | `UPLOAD_OVERWRITE`     | `true`                        |
    ///
    /// Unparseable values fall back to the default with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let comfyui_url = lookup("COMFYUI_URL")
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_COMFYUI_URL.to_string());

        let comfyui_ws_url = lookup("COMFYUI_WS_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| ws_url_from_api_url(&comfyui_url));

        let workflows_dir = lookup("WORKFLOWS_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let assets_dir = lookup("ASSETS_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| workflows_dir.clone());

        let strategy: MonitorStrategy = parse_or(&lookup, "MONITOR_STRATEGY", MonitorStrategy::Poll);
        let poll_interval_ms: u64 = parse_or(&lookup, "POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS);
        let retry_ms: u64 = parse_or(&lookup, "RETRY_BACKOFF_MS", DEFAULT_RETRY_BACKOFF_MS);
        let retry_max_ms: u64 = parse_or(&lookup, "RETRY_BACKOFF_MAX_MS", retry_ms);
        let max_wait_secs: u64 = parse_or(&lookup, "MAX_WAIT_SECS", DEFAULT_MAX_WAIT.as_secs());
        let upload_overwrite: bool = parse_or(&lookup, "UPLOAD_OVERWRITE", true);

        let monitor = MonitorConfig {
            strategy,
            poll_interval: Duration::from_millis(poll_interval_ms),
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(retry_ms),
                max_delay: Duration::from_millis(retry_max_ms.max(retry_ms)),
                multiplier: 2.0,
            },
            max_wait: (max_wait_secs > 0).then(|| Duration::from_secs(max_wait_secs)),
        };

        Self {
            comfyui_url,
            comfyui_ws_url,
            workflows_dir,
            assets_dir,
            monitor,
            upload_overwrite,
        }
    }
}

/// Parse `key` from the lookup, warning and using `default` when the
/// value is present but invalid.
fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "Invalid configuration value, using default");
                default
            }
        },
        None => default,
    }
}
