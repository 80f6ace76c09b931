//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is shared between the caller, the run loop and
//! the stage context. The loop observes it at checkpoint boundaries only;
//! an in-flight handler is never preempted.

mod token;

pub use token::{CancelCallback, CancelMode, CancellationToken};
