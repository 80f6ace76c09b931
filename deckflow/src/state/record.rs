//! The run state snapshot and its append-only record types.

use super::StateDelta;
use crate::core::{RunStatus, StageId};
use crate::utils::{now, seconds_between, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Author of a progress message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Supplied by the person driving the run.
    User,
    /// Produced by a generative stage.
    Assistant,
    /// Produced by the scheduler or a script stage.
    System,
}

/// A human/system readable progress notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Who wrote the message.
    pub role: MessageRole,
    /// The message text.
    pub content: String,
}

impl Message {
    /// Creates a new message.
    #[must_use]
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Creates a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }
}

/// A stage failure recorded in the run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// The stage that failed.
    pub stage: StageId,
    /// The failure message.
    pub message: String,
    /// When the failure was recorded.
    pub timestamp: Timestamp,
}

/// Wall-clock timing of one completed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    /// The stage that ran.
    pub stage: StageId,
    /// When the handler was invoked.
    pub start_time: Timestamp,
    /// When the handler returned.
    pub end_time: Timestamp,
    /// `end_time - start_time` in seconds.
    pub duration_seconds: f64,
}

/// A point-in-time snapshot of a workflow's progress.
///
/// Every field a handler may contribute to is merged through
/// [`RunState::apply`]; the run loop never replaces a state wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// The workflow id.
    pub workflow_id: String,
    /// The thread id this run checkpoints under.
    pub thread_id: String,

    /// Current status.
    pub status: RunStatus,
    /// Last stage that completed.
    #[serde(default)]
    pub current_stage: Option<StageId>,
    /// Stage the run is paused in front of, if it stopped at an interrupt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_before: Option<StageId>,

    /// Template document reference.
    pub template_ref: String,
    /// Source document reference.
    pub source_ref: String,
    /// Name of the generated artifact, without extension.
    pub output_name: String,
    /// Workspace directory handed through to stage handlers.
    pub workspace_dir: String,

    /// Completed stages, in completion order, each at most once.
    #[serde(default)]
    pub completed_stages: Vec<StageId>,
    /// Failed stages, in failure order, each at most once.
    #[serde(default)]
    pub failed_stages: Vec<StageId>,
    /// Logical artifact name to storage location.
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    /// Failure history.
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    /// Timing history.
    #[serde(default)]
    pub stage_timings: Vec<StageTiming>,
    /// Progress log.
    #[serde(default)]
    pub messages: Vec<Message>,

    /// Probed template layout metadata.
    #[serde(default)]
    pub template_metadata: Option<serde_json::Value>,
    /// Markdown inventory of the template slides.
    #[serde(default)]
    pub template_inventory: Option<String>,
    /// Source document converted to text.
    #[serde(default)]
    pub source_text: Option<String>,
    /// Generated deck outline.
    #[serde(default)]
    pub outline: Option<String>,
    /// Template slide indices in output order.
    #[serde(default)]
    pub slide_mapping: Option<Vec<u32>>,
    /// Text inventory of the rearranged deck.
    #[serde(default)]
    pub text_inventory: Option<serde_json::Value>,
    /// Generated replacement text keyed by shape.
    #[serde(default)]
    pub replacement_text: Option<serde_json::Value>,

    /// When the state was created.
    pub created_at: Timestamp,
    /// When the state last changed.
    pub updated_at: Timestamp,
    /// When the first stage started.
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    /// When the run completed.
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
    /// Total run time in seconds, set on completion.
    #[serde(default)]
    pub total_duration_seconds: Option<f64>,
}

impl RunState {
    /// Creates the initial pending state of a run.
    #[must_use]
    pub fn new(
        workflow_id: impl Into<String>,
        thread_id: impl Into<String>,
        template_ref: impl Into<String>,
        source_ref: impl Into<String>,
        output_name: impl Into<String>,
        workspace_dir: impl Into<String>,
    ) -> Self {
        let created = now();
        Self {
            workflow_id: workflow_id.into(),
            thread_id: thread_id.into(),
            status: RunStatus::Pending,
            current_stage: None,
            paused_before: None,
            template_ref: template_ref.into(),
            source_ref: source_ref.into(),
            output_name: output_name.into(),
            workspace_dir: workspace_dir.into(),
            completed_stages: Vec::new(),
            failed_stages: Vec::new(),
            artifacts: BTreeMap::new(),
            errors: Vec::new(),
            stage_timings: Vec::new(),
            messages: Vec::new(),
            template_metadata: None,
            template_inventory: None,
            source_text: None,
            outline: None,
            slide_mapping: None,
            text_inventory: None,
            replacement_text: None,
            created_at: created,
            updated_at: created,
            started_at: None,
            completed_at: None,
            total_duration_seconds: None,
        }
    }

    /// Returns true if the stage is in `completed_stages`.
    #[must_use]
    pub fn is_completed(&self, stage: StageId) -> bool {
        self.completed_stages.contains(&stage)
    }

    /// Returns true if the stage is in `failed_stages`.
    #[must_use]
    pub fn is_failed(&self, stage: StageId) -> bool {
        self.failed_stages.contains(&stage)
    }

    /// Returns `(completed, total)` stage counts.
    #[must_use]
    pub fn progress(&self) -> (usize, usize) {
        (self.completed_stages.len(), StageId::COUNT)
    }

    /// Returns the most recent progress message.
    #[must_use]
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Returns the most recent error.
    #[must_use]
    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.errors.last()
    }

    /// Sum of all recorded stage durations.
    #[must_use]
    pub fn stage_seconds(&self) -> f64 {
        self.stage_timings.iter().map(|t| t.duration_seconds).sum()
    }

    /// Total run time: wall clock from `started_at` to `completed_at` when
    /// both are set, otherwise the sum of stage durations so far.
    #[must_use]
    pub fn total_duration(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(seconds_between(start, end)),
            _ if self.stage_timings.is_empty() => None,
            _ => Some(self.stage_seconds()),
        }
    }

    /// Merges a delta into this state.
    ///
    /// Ordered-set fields union by stage id, list fields concatenate,
    /// `artifacts` upserts, and scalar fields overwrite only when the delta
    /// sets them.
    pub fn apply(&mut self, delta: StateDelta) {
        let StateDelta {
            status,
            current_stage,
            completed_stages,
            failed_stages,
            artifacts,
            errors,
            stage_timings,
            messages,
            template_metadata,
            template_inventory,
            source_text,
            outline,
            slide_mapping,
            text_inventory,
            replacement_text,
            started_at,
            completed_at,
            total_duration_seconds,
            updated_at,
        } = delta;

        union_into(&mut self.completed_stages, completed_stages);
        union_into(&mut self.failed_stages, failed_stages);
        self.artifacts.extend(artifacts);
        self.errors.extend(errors);
        self.stage_timings.extend(stage_timings);
        self.messages.extend(messages);

        overwrite(&mut self.status, status);
        overwrite_opt(&mut self.current_stage, current_stage);
        overwrite_opt(&mut self.template_metadata, template_metadata);
        overwrite_opt(&mut self.template_inventory, template_inventory);
        overwrite_opt(&mut self.source_text, source_text);
        overwrite_opt(&mut self.outline, outline);
        overwrite_opt(&mut self.slide_mapping, slide_mapping);
        overwrite_opt(&mut self.text_inventory, text_inventory);
        overwrite_opt(&mut self.replacement_text, replacement_text);
        overwrite_opt(&mut self.started_at, started_at);
        overwrite_opt(&mut self.completed_at, completed_at);
        overwrite_opt(&mut self.total_duration_seconds, total_duration_seconds);
        overwrite(&mut self.updated_at, updated_at);
    }

    /// Consuming form of [`RunState::apply`].
    #[must_use]
    pub fn merged(mut self, delta: StateDelta) -> Self {
        self.apply(delta);
        self
    }
}

pub(super) fn union_into(target: &mut Vec<StageId>, incoming: Vec<StageId>) {
    for stage in incoming {
        if !target.contains(&stage) {
            target.push(stage);
        }
    }
}

fn overwrite<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn overwrite_opt<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}
