//! Run lifecycle events.
//!
//! The run loop reports every transition to an [`EventSink`]. Sinks are
//! passed to the loop explicitly; there is no process-wide sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::core::StageId;
use crate::utils::{now, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event types emitted by the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// The loop entered a run with no started stages.
    #[serde(rename = "run.started")]
    RunStarted,
    /// A handler is about to be invoked.
    #[serde(rename = "stage.started")]
    StageStarted,
    /// A handler returned a delta.
    #[serde(rename = "stage.completed")]
    StageCompleted,
    /// A handler returned an error or panicked.
    #[serde(rename = "stage.failed")]
    StageFailed,
    /// The loop suspended before a stage.
    #[serde(rename = "run.interrupted")]
    RunInterrupted,
    /// The loop observed a cancellation request.
    #[serde(rename = "run.cancelled")]
    RunCancelled,
    /// Every stage completed.
    #[serde(rename = "run.completed")]
    RunCompleted,
    /// The run reached the failed status.
    #[serde(rename = "run.failed")]
    RunFailed,
    /// A checkpoint was appended.
    #[serde(rename = "checkpoint.saved")]
    CheckpointSaved,
}

impl EventKind {
    /// Returns the dotted event type name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run.started",
            Self::StageStarted => "stage.started",
            Self::StageCompleted => "stage.completed",
            Self::StageFailed => "stage.failed",
            Self::RunInterrupted => "run.interrupted",
            Self::RunCancelled => "run.cancelled",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
            Self::CheckpointSaved => "checkpoint.saved",
        }
    }

    /// Returns true for events that report a failure.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::StageFailed | Self::RunFailed)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Event type.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// The workflow the event belongs to.
    pub workflow_id: String,
    /// The thread the event belongs to.
    pub thread_id: String,
    /// The stage involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageId>,
    /// Free-form payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// When the event was created.
    pub timestamp: Timestamp,
}

impl RunEvent {
    /// Creates an event with no stage or payload.
    #[must_use]
    pub fn new(kind: EventKind, workflow_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            kind,
            workflow_id: workflow_id.into(),
            thread_id: thread_id.into(),
            stage: None,
            data: None,
            timestamp: now(),
        }
    }

    /// Sets the stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageId) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}
