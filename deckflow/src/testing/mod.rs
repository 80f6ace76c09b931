//! Testing utilities for deckflow runs.
//!
//! This module provides:
//! - Mock stage handlers
//! - Registry and state fixtures
//! - Assertions on run states

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_completed, assert_failed_at, assert_stage_order_respects_dependencies};
pub use fixtures::{full_registry, initial_state, logged_registry, registry_with, state_with_completed};
pub use mocks::{
    artifact_name, CallLog, CancellingHandler, FailingHandler, PanickingHandler,
    RecordingHandler, SlowHandler,
};
