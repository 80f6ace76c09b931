//! Run state record and delta merging.
//!
//! A [`RunState`] is the full snapshot persisted in every checkpoint. Stage
//! handlers never mutate it; they return a [`StateDelta`] which the run loop
//! merges with per-field rules:
//! - ordered stage sets union by id
//! - record lists concatenate
//! - `artifacts` upserts by name
//! - scalar fields overwrite when set

mod delta;
mod record;

pub use delta::{append_message, mark_complete, record_failure, StateDelta};
pub use record::{ErrorRecord, Message, MessageRole, RunState, StageTiming};
