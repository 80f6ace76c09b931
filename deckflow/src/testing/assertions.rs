//! Test assertions for run states.

use crate::core::{RunStatus, StageId};
use crate::pipeline::DependencyTable;
use crate::state::RunState;

/// Asserts that every stage completed and the run is marked completed.
pub fn assert_completed(state: &RunState) {
    assert_eq!(
        state.status,
        RunStatus::Completed,
        "Expected completed run, got {:?} with errors {:?}",
        state.status,
        state.errors
    );
    assert_eq!(
        state.completed_stages.len(),
        StageId::COUNT,
        "Expected all stages completed, got {:?}",
        state.completed_stages
    );
    assert!(state.completed_at.is_some(), "completed_at not stamped");
    assert!(
        state.total_duration_seconds.is_some(),
        "total_duration_seconds not set"
    );
}

/// Asserts that the run failed at `stage` with an error containing `message`.
pub fn assert_failed_at(state: &RunState, stage: StageId, message: &str) {
    assert_eq!(state.status, RunStatus::Failed, "Expected failed run");
    assert_eq!(
        state.failed_stages,
        vec![stage],
        "Expected only {stage} in failed_stages"
    );
    let error = state
        .last_error()
        .unwrap_or_else(|| panic!("Expected an error record for {stage}"));
    assert_eq!(error.stage, stage);
    assert!(
        error.message.contains(message),
        "Expected error containing '{}', got '{}'",
        message,
        error.message
    );
}

/// Asserts that every stage in `order` ran after all of its prerequisites.
pub fn assert_stage_order_respects_dependencies(order: &[StageId]) {
    let table = DependencyTable::standard();
    for (position, stage) in order.iter().enumerate() {
        for dep in table.prerequisites(*stage) {
            let dep_position = order.iter().position(|s| *s == dep);
            assert!(
                dep_position.is_some_and(|p| p < position),
                "{stage} ran before its prerequisite {dep}: {order:?}"
            );
        }
    }
}
