//! ComfyUI WebSocket and REST client library.
//!
//! Provides the HTTP API wrapper (submission, history, uploads, view
//! URLs), typed push-channel message parsing, the WebSocket client, and
//! the job monitor that follows one submitted prompt to a terminal
//! state by polling history or by consuming push events.

pub mod api;
pub mod backoff;
pub mod client;
pub mod events;
pub mod messages;
pub mod monitor;
pub mod poll;
pub mod processor;
