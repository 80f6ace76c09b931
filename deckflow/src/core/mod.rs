//! Core domain types for deckflow.
//!
//! This module contains the identifiers every other layer shares:
//! - Stage ids with their fixed prerequisites and attributes
//! - Run status

mod stage;
mod status;

pub use stage::{StageId, StageKind, UnknownStage};
pub use status::RunStatus;
