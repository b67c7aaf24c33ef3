//! History polling monitor.
//!
//! Requests `GET /history/{prompt_id}` until the record appears. An
//! absent record means the prompt is still queued or running; a failed
//! request is treated as transient and retried under the configured
//! backoff. The whole wait is bounded by `max_wait` and the caller's
//! [`CancellationToken`].

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::ComfyBackend;
use crate::backoff::next_delay;
use crate::monitor::{deadline_from, guarded, outcome_from_history, JobOutcome, MonitorConfig, MonitorError};

/// Poll history until the prompt reaches a terminal state.
pub async fn poll_until_terminal(
    backend: &dyn ComfyBackend,
    prompt_id: &str,
    config: &MonitorConfig,
    cancel: &CancellationToken,
) -> Result<JobOutcome, MonitorError> {
    poll_history(backend, prompt_id, config, cancel, deadline_from(config), false).await
}

/// Poll loop shared with the event-stream monitor, which uses it to
/// fetch outputs after a terminal push event.
pub(crate) async fn poll_history(
    backend: &dyn ComfyBackend,
    prompt_id: &str,
    config: &MonitorConfig,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    cached: bool,
) -> Result<JobOutcome, MonitorError> {
    let mut retry_delay = config.backoff.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let response = guarded(backend.get_history(prompt_id), prompt_id, config, deadline, cancel).await?;

        let wait = match response {
            Ok(Some(entry)) => {
                let outcome = outcome_from_history(entry, cached);
                tracing::info!(
                    prompt_id = %prompt_id,
                    attempt,
                    state = ?outcome.state(),
                    "Job reached terminal state",
                );
                return Ok(outcome);
            }
            Ok(None) => {
                tracing::trace!(prompt_id = %prompt_id, attempt, "History not yet available");
                retry_delay = config.backoff.initial_delay;
                config.poll_interval
            }
            Err(e) => {
                tracing::warn!(
                    prompt_id = %prompt_id,
                    attempt,
                    error = %e,
                    retry_in_ms = retry_delay.as_millis() as u64,
                    "History request failed, retrying",
                );
                let wait = retry_delay;
                retry_delay = next_delay(retry_delay, &config.backoff);
                wait
            }
        };

        guarded(tokio::time::sleep(wait), prompt_id, config, deadline, cancel).await?;
    }
}
