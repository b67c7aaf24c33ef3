//! Job state model shared by the poll and event-stream monitors.
//!
//! A job moves `Queued -> Running -> {Succeeded | Cached | Failed}`.
//! Either monitor strategy resolves to exactly one [`JobOutcome`], or
//! to a [`MonitorError`] when the wait was abandoned (timeout,
//! cancellation, lost push channel).

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApiError, HistoryEntry, HistoryStatus};
use crate::backoff::BackoffConfig;

/// Lifecycle state of a submitted prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    /// Succeeded entirely from cached node outputs.
    Cached,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Cached | Self::Failed)
    }
}

/// Backend-reported execution failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionFailure {
    pub message: String,
    pub node_id: Option<String>,
    /// Raw backend diagnostic (error event data or history status).
    pub diagnostic: Value,
}

/// Terminal result of monitoring one prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded { outputs: Map<String, Value> },
    Cached { outputs: Map<String, Value> },
    Failed(ExecutionFailure),
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            Self::Succeeded { .. } => JobState::Succeeded,
            Self::Cached { .. } => JobState::Cached,
            Self::Failed(_) => JobState::Failed,
        }
    }
}

/// How completion is detected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStrategy {
    /// Repeatedly request the history record.
    #[default]
    Poll,
    /// Follow push events over the WebSocket channel.
    Events,
}

impl FromStr for MonitorStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poll" | "polling" => Ok(Self::Poll),
            "events" | "event" | "ws" | "websocket" => Ok(Self::Events),
            other => Err(format!(
                "unknown monitor strategy '{other}' (expected 'poll' or 'events')"
            )),
        }
    }
}

impl fmt::Display for MonitorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Poll => "poll",
            Self::Events => "events",
        })
    }
}

/// Timing policy for a monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub strategy: MonitorStrategy,
    /// Wait between history requests while the record is absent.
    pub poll_interval: Duration,
    /// Retry policy after a failed history request.
    pub backoff: BackoffConfig,
    /// Upper bound on the total wait; `None` waits indefinitely.
    pub max_wait: Option<Duration>,
}

/// Default total wait: 30 minutes.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30 * 60);

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            strategy: MonitorStrategy::Poll,
            poll_interval: Duration::from_secs(2),
            backoff: BackoffConfig::default(),
            max_wait: Some(DEFAULT_MAX_WAIT),
        }
    }
}

/// Reasons a monitor stopped without a terminal outcome.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Job {prompt_id} did not finish within {}s", waited.as_secs())]
    Timeout { prompt_id: String, waited: Duration },

    #[error("Monitoring of job {prompt_id} was cancelled")]
    Cancelled { prompt_id: String },

    /// The push channel failed or closed before a terminal event.
    #[error("Push channel error: {0}")]
    Connection(String),

    /// A history record could not be interpreted.
    #[error("History request failed: {0}")]
    History(#[from] ComfyUIApiError),
}

/// Classify a history record into a terminal outcome.
///
/// `cached` marks a success already known to be fully cached.
pub fn outcome_from_history(entry: HistoryEntry, cached: bool) -> JobOutcome {
    if let Some(status) = entry.status.as_ref().filter(|s| s.is_error()) {
        return JobOutcome::Failed(failure_from_status(status));
    }
    if cached {
        JobOutcome::Cached {
            outputs: entry.outputs,
        }
    } else {
        JobOutcome::Succeeded {
            outputs: entry.outputs,
        }
    }
}

/// Build a failure from the `execution_error` (or
/// `execution_interrupted`) message recorded in a history status.
fn failure_from_status(status: &HistoryStatus) -> ExecutionFailure {
    let recorded = status.messages.iter().find_map(|m| {
        let pair = m.as_array()?;
        let name = pair.first()?.as_str()?;
        match name {
            "execution_error" | "execution_interrupted" => Some((name, pair.get(1)?)),
            _ => None,
        }
    });

    match recorded {
        Some((name, data)) => {
            let message = data
                .get("exception_message")
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| {
                    if name == "execution_interrupted" {
                        "Execution interrupted".to_string()
                    } else {
                        "Execution failed".to_string()
                    }
                });
            ExecutionFailure {
                message,
                node_id: data.get("node_id").and_then(node_id_string),
                diagnostic: data.clone(),
            }
        }
        None => ExecutionFailure {
            message: "Execution failed".to_string(),
            node_id: None,
            diagnostic: serde_json::to_value(status).unwrap_or(Value::Null),
        },
    }
}

fn node_id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Deadline for a wait starting now.
pub(crate) fn deadline_from(config: &MonitorConfig) -> Option<Instant> {
    config.max_wait.map(|wait| Instant::now() + wait)
}

/// Run `fut` unless cancellation or the deadline comes first.
pub(crate) async fn guarded<F: Future>(
    fut: F,
    prompt_id: &str,
    config: &MonitorConfig,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Result<F::Output, MonitorError> {
    let expiry = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MonitorError::Cancelled {
            prompt_id: prompt_id.to_string(),
        }),
        _ = expiry => Err(MonitorError::Timeout {
            prompt_id: prompt_id.to_string(),
            waited: config.max_wait.unwrap_or_default(),
        }),
        out = fut => Ok(out),
    }
}
