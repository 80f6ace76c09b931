//! Handler failure payload.

use crate::core::StageId;
use thiserror::Error;

/// Error returned by a stage handler.
///
/// The run loop turns this into an error record on the run state; it is
/// never propagated out of the loop.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StageError {
    /// Stage that failed, when the handler chose to say.
    pub stage: Option<StageId>,
    /// Failure message.
    pub message: String,
}

impl StageError {
    /// Creates a new stage error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            stage: None,
            message: message.into(),
        }
    }

    /// Creates an error tagged with its stage.
    #[must_use]
    pub fn for_stage(stage: StageId, message: impl Into<String>) -> Self {
        Self {
            stage: Some(stage),
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for StageError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for StageError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}
