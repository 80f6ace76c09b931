//! Utility functions for identifiers and timestamps.

mod ids;
mod timestamps;

pub use ids::{generate_checkpoint_id, generate_thread_id, generate_workflow_id};
pub use timestamps::{iso_timestamp, now, seconds_between, Timestamp};
