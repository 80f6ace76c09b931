//! Error types for the deckflow scheduler.
//!
//! Handler failures are not errors at this level: the run loop folds them
//! into the run state so they become part of the checkpoint history. The
//! types here cover everything that must propagate out of the loop instead:
//! resolver anomalies, checkpoint persistence failures and lookups that miss.

use crate::core::StageId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for deckflow operations.
#[derive(Debug, Error)]
pub enum DeckflowError {
    /// The stage registry or dependency table failed validation.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A checkpoint could not be written or read.
    #[error("{0}")]
    Store(#[from] CheckpointError),

    /// The earliest incomplete stage has unmet prerequisites.
    ///
    /// This only happens when `completed_stages` is inconsistent, for
    /// example after a checkpoint was edited by hand.
    #[error("No runnable stage: '{stage}' is waiting on {missing:?}")]
    ResolverAnomaly {
        /// The earliest stage not yet completed.
        stage: StageId,
        /// Its prerequisites that are not in `completed_stages`.
        missing: Vec<StageId>,
    },

    /// No handler is registered for a stage the resolver selected.
    #[error("No handler registered for stage '{0}'")]
    HandlerNotRegistered(StageId),

    /// A run loop for this thread is already active in this process.
    #[error("Thread '{0}' is already running")]
    AlreadyRunning(String),

    /// A run was created with a thread id that already has checkpoints.
    #[error("Thread '{0}' already exists")]
    ThreadExists(String),

    /// A result was requested for a run that has not completed.
    #[error("Thread '{thread_id}' has not completed (status: {status})")]
    NotCompleted {
        /// The thread that was queried.
        thread_id: String,
        /// Its current status.
        status: String,
    },

    /// A completed run does not carry the requested artifact.
    #[error("Thread '{thread_id}' has no artifact '{name}'")]
    ArtifactMissing {
        /// The thread that was queried.
        thread_id: String,
        /// The missing artifact name.
        name: String,
    },
}

impl DeckflowError {
    /// Returns true if the error came from a missed lookup rather than a
    /// broken store or state.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Store(CheckpointError::NotFound { .. } | CheckpointError::ThreadNotFound(_))
        )
    }
}

/// Errors raised by checkpoint store backends.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The thread has no checkpoints.
    #[error("No checkpoints for thread '{0}'")]
    ThreadNotFound(String),

    /// The thread exists but the requested checkpoint does not.
    #[error("Checkpoint '{checkpoint_id}' not found for thread '{thread_id}'")]
    NotFound {
        /// The thread that was queried.
        thread_id: String,
        /// The missing checkpoint id.
        checkpoint_id: String,
    },

    /// The thread id cannot be used as a storage key.
    #[error("Invalid thread id '{0}': use letters, digits, '-', '_' or '.'")]
    InvalidThreadId(String),

    /// A stored record failed its integrity check.
    #[error("Corrupt checkpoint '{checkpoint_id}' for thread '{thread_id}': {reason}")]
    Corrupt {
        /// The thread the record belongs to.
        thread_id: String,
        /// The record id.
        checkpoint_id: String,
        /// What failed.
        reason: String,
    },

    /// The state could not be encoded or decoded.
    #[error("Checkpoint serialization error: {0}")]
    Serialization(String),

    /// The backing storage failed.
    #[error("Checkpoint IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckpointError {
    /// Creates a not-found error for a specific checkpoint.
    #[must_use]
    pub fn not_found(thread_id: impl Into<String>, checkpoint_id: impl Into<String>) -> Self {
        Self::NotFound {
            thread_id: thread_id.into(),
            checkpoint_id: checkpoint_id.into(),
        }
    }

    /// Creates a corruption error.
    #[must_use]
    pub fn corrupt(
        thread_id: impl Into<String>,
        checkpoint_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Corrupt {
            thread_id: thread_id.into(),
            checkpoint_id: checkpoint_id.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "CONTRACT-004-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a stage registry or dependency table fails validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<StageId>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<StageId>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }
}

/// Error raised when a cycle is detected in the dependency table.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in stage dependencies: {}", format_path(cycle_path))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<StageId>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

fn format_path(path: &[StageId]) -> String {
    path.iter()
        .map(StageId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<StageId>) -> Self {
        let info = ContractErrorInfo::new(
            "CONTRACT-004-CYCLE",
            format!("Dependency table contains a cycle: {}", format_path(&cycle_path)),
        )
        .with_fix_hint("Remove one of the prerequisites in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for PipelineValidationError {
    fn from(err: CycleDetectedError) -> Self {
        PipelineValidationError {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}
