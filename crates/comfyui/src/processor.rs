//! Push-channel monitor.
//!
//! Reads raw frames from a ComfyUI WebSocket connection, parses them
//! into typed [`ComfyUIMessage`] variants, forwards progress to an
//! optional [`JobEvent`] channel, and stops at the first terminal event
//! for the watched prompt. Outputs are not carried by push events, so a
//! terminal success is followed by a history fetch.

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::api::ComfyBackend;
use crate::events::JobEvent;
use crate::messages::{parse_message, ComfyUIMessage, ErrorData, InterruptedData, ProgressData};
use crate::monitor::{deadline_from, guarded, ExecutionFailure, JobOutcome, MonitorConfig, MonitorError};
use crate::poll::poll_history;

/// What a single frame means for the watched prompt.
#[derive(Debug)]
enum Signal {
    Continue,
    /// Some nodes will be served from cache; execution carries on.
    CachedNodes,
    Succeeded,
    Failed(ExecutionFailure),
}

/// Follow push events for `prompt_id` until it reaches a terminal state.
///
/// Messages for other prompts are ignored, as are frames that fail to
/// parse. The stream ending or erroring before a terminal event fails
/// with [`MonitorError::Connection`].
pub async fn watch_events<S, E>(
    stream: &mut S,
    prompt_id: &str,
    backend: &dyn ComfyBackend,
    config: &MonitorConfig,
    cancel: &CancellationToken,
    events: Option<&broadcast::Sender<JobEvent>>,
) -> Result<JobOutcome, MonitorError>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let deadline = deadline_from(config);
    let mut cached = false;

    loop {
        let frame = guarded(stream.next(), prompt_id, config, deadline, cancel).await?;

        let signal = match frame {
            Some(Ok(Message::Text(text))) => handle_text_message(&text, prompt_id, events),
            Some(Ok(Message::Binary(_))) => {
                // ComfyUI sends binary frames for preview images.
                tracing::trace!(prompt_id = %prompt_id, "Ignoring binary message (preview image)");
                Signal::Continue
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => Signal::Continue,
            Some(Ok(Message::Close(frame))) => {
                tracing::warn!(prompt_id = %prompt_id, ?frame, "ComfyUI WebSocket closed");
                return Err(MonitorError::Connection(format!(
                    "WebSocket closed before job {prompt_id} finished"
                )));
            }
            Some(Err(e)) => {
                tracing::error!(prompt_id = %prompt_id, error = %e, "WebSocket receive error");
                return Err(MonitorError::Connection(e.to_string()));
            }
            None => {
                return Err(MonitorError::Connection(format!(
                    "WebSocket stream ended before job {prompt_id} finished"
                )));
            }
        };

        match signal {
            Signal::Continue => {}
            Signal::CachedNodes => cached = true,
            Signal::Failed(failure) => return Ok(JobOutcome::Failed(failure)),
            Signal::Succeeded => {
                return poll_history(backend, prompt_id, config, cancel, deadline, cached).await;
            }
        }
    }
}

/// Dispatch a single text frame to the appropriate handler.
fn handle_text_message(
    text: &str,
    prompt_id: &str,
    events: Option<&broadcast::Sender<JobEvent>>,
) -> Signal {
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(
                error = %e,
                raw_message = %text,
                "Failed to parse ComfyUI message",
            );
            return Signal::Continue;
        }
    };

    if let Some(other) = msg.prompt_id().filter(|id| *id != prompt_id) {
        tracing::trace!(prompt_id = %prompt_id, other_prompt_id = %other, "Ignoring message for another prompt");
        return Signal::Continue;
    }

    match msg {
        ComfyUIMessage::Status(data) => {
            tracing::debug!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
            Signal::Continue
        }
        ComfyUIMessage::ExecutionStart(_) => {
            tracing::info!(prompt_id = %prompt_id, "Execution started");
            emit(events, JobEvent::Started {
                prompt_id: prompt_id.to_string(),
            });
            Signal::Continue
        }
        ComfyUIMessage::Progress(data) => {
            handle_progress(prompt_id, &data, events);
            Signal::Continue
        }
        ComfyUIMessage::Executing(data) => match data.node {
            Some(node) => {
                tracing::debug!(prompt_id = %prompt_id, node = %node, "Executing node");
                emit(events, JobEvent::Executing {
                    prompt_id: prompt_id.to_string(),
                    node,
                });
                Signal::Continue
            }
            None => {
                // node == None means execution is complete for this prompt.
                tracing::info!(prompt_id = %prompt_id, "Execution completed (all nodes done)");
                Signal::Succeeded
            }
        },
        ComfyUIMessage::Executed(data) => {
            tracing::debug!(prompt_id = %prompt_id, node = %data.node, "Node executed with output");
            Signal::Continue
        }
        ComfyUIMessage::ExecutionSuccess(_) => {
            tracing::info!(prompt_id = %prompt_id, "Execution succeeded");
            Signal::Succeeded
        }
        // Sent at the start of every prompt, listing nodes that will be
        // skipped. The prompt still ends with `execution_success`.
        ComfyUIMessage::ExecutionCached(data) if data.nodes.is_empty() => Signal::Continue,
        ComfyUIMessage::ExecutionCached(data) => {
            tracing::info!(prompt_id = %prompt_id, cached_nodes = data.nodes.len(), "Execution used cache");
            Signal::CachedNodes
        }
        ComfyUIMessage::ExecutionError(data) => Signal::Failed(handle_execution_error(prompt_id, data)),
        ComfyUIMessage::ExecutionInterrupted(data) => {
            Signal::Failed(handle_execution_interrupted(prompt_id, data))
        }
    }
}

// ---- individual message handlers ----

fn handle_progress(prompt_id: &str, data: &ProgressData, events: Option<&broadcast::Sender<JobEvent>>) {
    let percent = data.percent();
    tracing::debug!(
        prompt_id = %prompt_id,
        value = data.value,
        max = data.max,
        percent,
        "Generation progress",
    );
    emit(events, JobEvent::Progress {
        prompt_id: prompt_id.to_string(),
        value: data.value,
        max: data.max,
        percent,
    });
}

fn handle_execution_error(prompt_id: &str, data: ErrorData) -> ExecutionFailure {
    tracing::error!(
        prompt_id = %prompt_id,
        node_id = ?data.node_id,
        error_type = %data.exception_type,
        error_message = %data.exception_message,
        "Execution error",
    );
    let message = if data.exception_message.is_empty() {
        "Execution failed".to_string()
    } else {
        data.exception_message.clone()
    };
    ExecutionFailure {
        message,
        node_id: data.node_id.clone(),
        diagnostic: serde_json::to_value(&data).unwrap_or_default(),
    }
}

fn handle_execution_interrupted(prompt_id: &str, data: InterruptedData) -> ExecutionFailure {
    tracing::warn!(prompt_id = %prompt_id, node_id = ?data.node_id, "Execution interrupted");
    ExecutionFailure {
        message: "Execution interrupted".to_string(),
        node_id: data.node_id.clone(),
        diagnostic: serde_json::to_value(&data).unwrap_or_default(),
    }
}

fn emit(events: Option<&broadcast::Sender<JobEvent>>, event: JobEvent) {
    if let Some(tx) = events {
        // No receivers is fine.
        let _ = tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use futures::stream;
    use serde_json::{json, Value};

    use super::*;
    use crate::api::{ComfyUIApiError, HistoryEntry, SubmitResponse, UploadImage, UploadResponse};
    use crate::backoff::BackoffConfig;
    use crate::monitor::JobState;

    /// Backend whose history record is present from the first request.
    struct FinishedHistory {
        record: Value,
        calls: AtomicUsize,
    }

    impl FinishedHistory {
        fn new(record: Value) -> Self {
            Self {
                record,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ComfyBackend for FinishedHistory {
        async fn upload_image(&self, _upload: UploadImage) -> Result<UploadResponse, ComfyUIApiError> {
            unreachable!("event tests never upload")
        }

        async fn submit_workflow(
            &self,
            _workflow: &Value,
            _client_id: Option<&str>,
        ) -> Result<SubmitResponse, ComfyUIApiError> {
            unreachable!("event tests never submit")
        }

        async fn get_history(&self, _prompt_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(serde_json::from_value(self.record.clone()).unwrap()))
        }
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(5),
            backoff: BackoffConfig::fixed(Duration::from_millis(5)),
            max_wait: Some(Duration::from_secs(5)),
            ..Default::default()
        }
    }

    fn frames(texts: &[Value]) -> Vec<Result<Message, String>> {
        texts
            .iter()
            .map(|v| Ok(Message::Text(v.to_string())))
            .collect()
    }

    fn success_history() -> FinishedHistory {
        FinishedHistory::new(json!({
            "outputs": { "9": { "images": [{ "filename": "fox.png" }] } },
            "status": { "status_str": "success", "completed": true }
        }))
    }

    #[tokio::test]
    async fn success_event_fetches_outputs() {
        let backend = success_history();
        let (tx, mut rx) = broadcast::channel(16);
        let mut stream = stream::iter(frames(&[
            json!({ "type": "status", "data": { "status": { "exec_info": { "queue_remaining": 1 } } } }),
            json!({ "type": "execution_start", "data": { "prompt_id": "p1" } }),
            json!({ "type": "executing", "data": { "node": "3", "prompt_id": "p1" } }),
            json!({ "type": "progress", "data": { "value": 10, "max": 20, "prompt_id": "p1" } }),
            json!({ "type": "execution_success", "data": { "prompt_id": "p1" } }),
        ]));

        let outcome = watch_events(&mut stream, "p1", &backend, &config(), &CancellationToken::new(), Some(&tx))
            .await
            .unwrap();

        assert_matches!(outcome, JobOutcome::Succeeded { outputs } if outputs.contains_key("9"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                JobEvent::Started { prompt_id: "p1".into() },
                JobEvent::Executing { prompt_id: "p1".into(), node: "3".into() },
                JobEvent::Progress { prompt_id: "p1".into(), value: 10, max: 20, percent: 50 },
            ]
        );
    }

    #[tokio::test]
    async fn executing_null_node_counts_as_success() {
        let backend = success_history();
        let mut stream = stream::iter(frames(&[
            json!({ "type": "executing", "data": { "node": null, "prompt_id": "p1" } }),
        ]));
        let outcome = watch_events(&mut stream, "p1", &backend, &config(), &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome.state(), JobState::Succeeded);
    }

    #[tokio::test]
    async fn cached_event_yields_cached_outcome() {
        let backend = success_history();
        let mut stream = stream::iter(frames(&[
            json!({ "type": "execution_start", "data": { "prompt_id": "p1" } }),
            json!({ "type": "execution_cached", "data": { "prompt_id": "p1", "nodes": ["3", "9"] } }),
            json!({ "type": "execution_success", "data": { "prompt_id": "p1" } }),
        ]));
        let outcome = watch_events(&mut stream, "p1", &backend, &config(), &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome.state(), JobState::Cached);
    }

    #[tokio::test]
    async fn empty_cache_notice_does_not_end_the_watch() {
        let backend = success_history();
        let (tx, mut rx) = broadcast::channel(16);
        let mut stream = stream::iter(frames(&[
            json!({ "type": "execution_start", "data": { "prompt_id": "p1" } }),
            json!({ "type": "execution_cached", "data": { "prompt_id": "p1", "nodes": [] } }),
            json!({ "type": "executing", "data": { "node": "3", "prompt_id": "p1" } }),
            json!({ "type": "progress", "data": { "value": 1, "max": 20, "prompt_id": "p1" } }),
            json!({ "type": "execution_success", "data": { "prompt_id": "p1" } }),
        ]));

        let outcome = watch_events(&mut stream, "p1", &backend, &config(), &CancellationToken::new(), Some(&tx))
            .await
            .unwrap();
        assert_eq!(outcome.state(), JobState::Succeeded);

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                JobEvent::Started { prompt_id: "p1".into() },
                JobEvent::Executing { prompt_id: "p1".into(), node: "3".into() },
                JobEvent::Progress { prompt_id: "p1".into(), value: 1, max: 20, percent: 5 },
            ]
        );
    }

    #[tokio::test]
    async fn error_event_yields_failure_without_history() {
        let backend = success_history();
        let mut stream = stream::iter(frames(&[json!({
            "type": "execution_error",
            "data": {
                "prompt_id": "p1",
                "node_id": "5",
                "exception_message": "out of memory",
                "exception_type": "RuntimeError"
            }
        })]));
        let outcome = watch_events(&mut stream, "p1", &backend, &config(), &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_matches!(outcome, JobOutcome::Failed(failure) => {
            assert_eq!(failure.message, "out of memory");
            assert_eq!(failure.node_id.as_deref(), Some("5"));
            assert_eq!(failure.diagnostic["exception_type"], "RuntimeError");
        });
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn interrupted_event_is_failure() {
        let backend = success_history();
        let mut stream = stream::iter(frames(&[
            json!({ "type": "execution_interrupted", "data": { "prompt_id": "p1", "node_id": "3" } }),
        ]));
        let outcome = watch_events(&mut stream, "p1", &backend, &config(), &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_matches!(outcome, JobOutcome::Failed(failure) if failure.message == "Execution interrupted");
    }

    #[tokio::test]
    async fn events_for_other_prompts_are_ignored() {
        let backend = success_history();
        let mut stream = stream::iter(frames(&[
            json!({ "type": "execution_error", "data": { "prompt_id": "other", "exception_message": "x" } }),
            json!({ "type": "executing", "data": { "node": null, "prompt_id": "other" } }),
            json!({ "type": "execution_success", "data": { "prompt_id": "p1" } }),
        ]));
        let outcome = watch_events(&mut stream, "p1", &backend, &config(), &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome.state(), JobState::Succeeded);
    }

    #[tokio::test]
    async fn unparseable_frames_are_skipped() {
        let backend = success_history();
        let mut stream = stream::iter(vec![
            Ok::<Message, String>(Message::Text("not json".to_string())),
            Ok(Message::Text(r#"{"type":"crystools.monitor","data":{}}"#.to_string())),
            Ok(Message::Binary(vec![1, 2, 3])),
            Ok(Message::Text(
                json!({ "type": "execution_success", "data": { "prompt_id": "p1" } }).to_string(),
            )),
        ]);
        let outcome = watch_events(&mut stream, "p1", &backend, &config(), &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome.state(), JobState::Succeeded);
    }

    #[tokio::test]
    async fn stream_end_before_terminal_is_connection_error() {
        let backend = success_history();
        let mut stream = stream::iter(frames(&[
            json!({ "type": "executing", "data": { "node": "3", "prompt_id": "p1" } }),
        ]));
        let err = watch_events(&mut stream, "p1", &backend, &config(), &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert_matches!(err, MonitorError::Connection(_));
    }

    #[tokio::test]
    async fn receive_error_is_connection_error() {
        let backend = success_history();
        let mut stream = stream::iter(vec![Err::<Message, _>("connection reset".to_string())]);
        let err = watch_events(&mut stream, "p1", &backend, &config(), &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert_matches!(err, MonitorError::Connection(msg) if msg == "connection reset");
    }

    #[tokio::test]
    async fn silent_channel_times_out() {
        let backend = success_history();
        let mut stream = stream::pending::<Result<Message, String>>();
        let config = MonitorConfig {
            max_wait: Some(Duration::from_millis(30)),
            ..config()
        };
        let err = watch_events(&mut stream, "p1", &backend, &config, &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert_matches!(err, MonitorError::Timeout { .. });
    }

    #[tokio::test]
    async fn cancellation_stops_watching() {
        let backend = success_history();
        let mut stream = stream::pending::<Result<Message, String>>();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = watch_events(&mut stream, "p1", &backend, &config(), &cancel, None)
            .await
            .unwrap_err();
        assert_matches!(err, MonitorError::Cancelled { .. });
    }
}
