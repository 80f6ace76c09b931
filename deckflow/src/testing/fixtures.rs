//! Registry and state fixtures.

use std::sync::Arc;

use super::mocks::{CallLog, RecordingHandler};
use crate::core::StageId;
use crate::pipeline::StageRegistry;
use crate::stages::StageHandler;
use crate::state::{RunState, StageTiming};
use crate::utils::now;

/// A registry with a [`RecordingHandler`] for every stage.
#[must_use]
pub fn full_registry() -> StageRegistry {
    registry_with(Vec::new())
}

/// A registry with a [`RecordingHandler`] for every stage that has no
/// override.
///
/// # Panics
///
/// Panics if two overrides target the same stage.
#[must_use]
pub fn registry_with(overrides: Vec<Arc<dyn StageHandler>>) -> StageRegistry {
    build(overrides, None)
}

/// Like [`full_registry`], with every default handler appending to `log`.
#[must_use]
pub fn logged_registry(log: &CallLog, overrides: Vec<Arc<dyn StageHandler>>) -> StageRegistry {
    build(overrides, Some(log))
}

fn build(overrides: Vec<Arc<dyn StageHandler>>, log: Option<&CallLog>) -> StageRegistry {
    let overridden: Vec<StageId> = overrides.iter().map(|h| h.stage()).collect();
    let mut builder = StageRegistry::builder();
    for handler in overrides {
        builder = builder.handler(handler).expect("overrides target distinct stages");
    }
    for stage in StageId::ALL {
        if overridden.contains(&stage) {
            continue;
        }
        let handler = match log {
            Some(log) => RecordingHandler::new(stage).with_log(log.clone()),
            None => RecordingHandler::new(stage),
        };
        builder = builder.handler(Arc::new(handler)).expect("stage not yet registered");
    }
    builder.build().expect("every stage has a handler")
}

/// A fresh pending state for `thread_id`.
#[must_use]
pub fn initial_state(thread_id: &str) -> RunState {
    RunState::new(
        "workflow_test",
        thread_id,
        "fixtures/template.pptx",
        "fixtures/source.docx",
        "Quarterly",
        "outputs/workflow_test",
    )
}

/// A state with `stages` completed, each with a timing of `seconds_each`.
#[must_use]
pub fn state_with_completed(thread_id: &str, stages: &[StageId], seconds_each: f64) -> RunState {
    let mut state = initial_state(thread_id);
    let start = now();
    for stage in stages {
        state.completed_stages.push(*stage);
        state.current_stage = Some(*stage);
        state.stage_timings.push(StageTiming {
            stage: *stage,
            start_time: start,
            end_time: start,
            duration_seconds: seconds_each,
        });
    }
    if !stages.is_empty() {
        state.status = crate::core::RunStatus::InProgress;
    }
    state
}
