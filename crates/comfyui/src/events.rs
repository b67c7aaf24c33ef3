//! Job notifications for observers of a running job.
//!
//! Monitors and the job runner publish these on a
//! [`tokio::sync::broadcast`] channel; the CLI renders them as progress
//! lines. Nothing depends on anyone listening.

use serde::Serialize;

use crate::monitor::JobState;

/// A job-level event for one submitted prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// The backend accepted the workflow.
    Queued { prompt_id: String },

    /// The backend began executing the prompt.
    Started { prompt_id: String },

    /// A long-running node reported step progress.
    Progress {
        prompt_id: String,
        value: i64,
        max: i64,
        /// Completion percentage (0-100).
        percent: u8,
    },

    /// A node started executing.
    Executing { prompt_id: String, node: String },

    /// The prompt reached a terminal state.
    Finished { prompt_id: String, state: JobState },
}

impl JobEvent {
    pub fn prompt_id(&self) -> &str {
        match self {
            Self::Queued { prompt_id }
            | Self::Started { prompt_id }
            | Self::Progress { prompt_id, .. }
            | Self::Executing { prompt_id, .. }
            | Self::Finished { prompt_id, .. } => prompt_id,
        }
    }
}
