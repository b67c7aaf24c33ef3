use std::str::FromStr;

use easel_pipeline::config::PipelineConfig;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_CORS_ORIGINS: &str = "http://localhost:5173,http://localhost:3000";
/// Longer than the default monitor wait so jobs time out in the monitor
/// rather than at the HTTP layer.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 1900;

/// Server configuration loaded from environment variables.
///
/// All fields have sensible defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `1900`).
    pub request_timeout_secs: u64,
    /// Backend, template and monitor settings.
    pub pipeline: PipelineConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                                       |
    /// |------------------------|-----------------------------------------------|
    /// | `HOST`                 | `0.0.0.0`                                     |
    /// | `PORT`                 | `8000`                                        |
    /// | `CORS_ORIGINS`         | `http://localhost:5173,http://localhost:3000` |
    /// | `REQUEST_TIMEOUT_SECS` | `1900`                                        |
    ///
    /// Pipeline variables are documented on [`PipelineConfig::from_env`].
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let host = lookup("HOST")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.into());

        let port = parse_or(&lookup, "PORT", DEFAULT_PORT);

        let cors_origins: Vec<String> = lookup("CORS_ORIGINS")
            .unwrap_or_else(|| DEFAULT_CORS_ORIGINS.into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs =
            parse_or(&lookup, "REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS);

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            pipeline: PipelineConfig::from_lookup(&lookup),
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Invalid configuration value, using default");
            default
        }),
        None => default,
    }
}
