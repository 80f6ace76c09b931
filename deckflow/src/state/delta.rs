//! Partial state updates and the merge helpers that build them.

use super::record::union_into;
use super::{ErrorRecord, Message, MessageRole, StageTiming};
use crate::core::{RunStatus, StageId};
use crate::utils::{now, seconds_between, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A partial update to a [`RunState`](super::RunState).
///
/// Stage handlers return a delta describing only what they produced; the
/// run loop merges it on top of the prior state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    /// New status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    /// New current stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<StageId>,
    /// Stages to add to `completed_stages`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_stages: Vec<StageId>,
    /// Stages to add to `failed_stages`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_stages: Vec<StageId>,
    /// Artifacts to upsert.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, String>,
    /// Errors to append.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorRecord>,
    /// Timings to append.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stage_timings: Vec<StageTiming>,
    /// Messages to append.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    /// Template metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_metadata: Option<serde_json::Value>,
    /// Template inventory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_inventory: Option<String>,
    /// Extracted source text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_text: Option<String>,
    /// Outline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outline: Option<String>,
    /// Slide mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slide_mapping: Option<Vec<u32>>,
    /// Text inventory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_inventory: Option<serde_json::Value>,
    /// Replacement text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement_text: Option<serde_json::Value>,
    /// Run start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// Run completion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    /// Total run time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration_seconds: Option<f64>,
    /// Last update time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
}

impl StateDelta {
    /// Creates an empty delta.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the delta changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Combines two deltas with the same rules [`RunState::apply`] uses;
    /// `other` wins on scalar conflicts.
    ///
    /// [`RunState::apply`]: super::RunState::apply
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        union_into(&mut self.completed_stages, other.completed_stages);
        union_into(&mut self.failed_stages, other.failed_stages);
        self.artifacts.extend(other.artifacts);
        self.errors.extend(other.errors);
        self.stage_timings.extend(other.stage_timings);
        self.messages.extend(other.messages);

        self.status = other.status.or(self.status);
        self.current_stage = other.current_stage.or(self.current_stage);
        self.template_metadata = other.template_metadata.or(self.template_metadata);
        self.template_inventory = other.template_inventory.or(self.template_inventory);
        self.source_text = other.source_text.or(self.source_text);
        self.outline = other.outline.or(self.outline);
        self.slide_mapping = other.slide_mapping.or(self.slide_mapping);
        self.text_inventory = other.text_inventory.or(self.text_inventory);
        self.replacement_text = other.replacement_text.or(self.replacement_text);
        self.started_at = other.started_at.or(self.started_at);
        self.completed_at = other.completed_at.or(self.completed_at);
        self.total_duration_seconds = other.total_duration_seconds.or(self.total_duration_seconds);
        self.updated_at = other.updated_at.or(self.updated_at);
        self
    }

    /// Strips the fields only the scheduler may set.
    ///
    /// Returns the cleaned delta and whether anything was removed.
    #[must_use]
    pub fn into_handler_update(mut self) -> (Self, bool) {
        let touched = self.status.is_some()
            || self.current_stage.is_some()
            || !self.completed_stages.is_empty()
            || !self.failed_stages.is_empty()
            || self.completed_at.is_some()
            || self.total_duration_seconds.is_some();

        self.status = None;
        self.current_stage = None;
        self.completed_stages.clear();
        self.failed_stages.clear();
        self.completed_at = None;
        self.total_duration_seconds = None;
        (self, touched)
    }

    /// Marks a stage completed.
    #[must_use]
    pub fn with_completed(mut self, stage: StageId) -> Self {
        union_into(&mut self.completed_stages, vec![stage]);
        self
    }

    /// Upserts an artifact location.
    #[must_use]
    pub fn with_artifact(mut self, name: impl Into<String>, location: impl Into<String>) -> Self {
        self.artifacts.insert(name.into(), location.into());
        self
    }

    /// Appends a message.
    #[must_use]
    pub fn with_message(mut self, role: MessageRole, content: impl Into<String>) -> Self {
        self.messages.push(Message::new(role, content));
        self
    }

    /// Sets the template metadata.
    #[must_use]
    pub fn with_template_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.template_metadata = Some(metadata);
        self
    }

    /// Sets the template inventory.
    #[must_use]
    pub fn with_template_inventory(mut self, inventory: impl Into<String>) -> Self {
        self.template_inventory = Some(inventory.into());
        self
    }

    /// Sets the extracted source text.
    #[must_use]
    pub fn with_source_text(mut self, text: impl Into<String>) -> Self {
        self.source_text = Some(text.into());
        self
    }

    /// Sets the outline.
    #[must_use]
    pub fn with_outline(mut self, outline: impl Into<String>) -> Self {
        self.outline = Some(outline.into());
        self
    }

    /// Sets the slide mapping.
    #[must_use]
    pub fn with_slide_mapping(mut self, mapping: Vec<u32>) -> Self {
        self.slide_mapping = Some(mapping);
        self
    }

    /// Sets the text inventory.
    #[must_use]
    pub fn with_text_inventory(mut self, inventory: serde_json::Value) -> Self {
        self.text_inventory = Some(inventory);
        self
    }

    /// Sets the replacement text.
    #[must_use]
    pub fn with_replacement_text(mut self, replacements: serde_json::Value) -> Self {
        self.replacement_text = Some(replacements);
        self
    }
}

/// Delta for a stage that finished successfully.
///
/// Duration is measured from `start_time` to now.
#[must_use]
pub fn mark_complete(stage: StageId, start_time: Timestamp) -> StateDelta {
    let end_time = now();
    StateDelta {
        completed_stages: vec![stage],
        current_stage: Some(stage),
        status: Some(RunStatus::InProgress),
        stage_timings: vec![StageTiming {
            stage,
            start_time,
            end_time,
            duration_seconds: seconds_between(start_time, end_time),
        }],
        updated_at: Some(end_time),
        ..StateDelta::default()
    }
}

/// Delta for a stage that failed.
#[must_use]
pub fn record_failure(stage: StageId, message: impl Into<String>) -> StateDelta {
    let timestamp = now();
    StateDelta {
        errors: vec![ErrorRecord {
            stage,
            message: message.into(),
            timestamp,
        }],
        failed_stages: vec![stage],
        status: Some(RunStatus::Failed),
        updated_at: Some(timestamp),
        ..StateDelta::default()
    }
}

/// Delta appending one progress message.
#[must_use]
pub fn append_message(role: MessageRole, text: impl Into<String>) -> StateDelta {
    StateDelta::new().with_message(role, text)
}
