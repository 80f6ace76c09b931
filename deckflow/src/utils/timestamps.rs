//! Timestamp helpers.

use chrono::{DateTime, Utc};

/// A UTC timestamp as stored in run state and checkpoints.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC time.
#[must_use]
pub fn now() -> Timestamp {
    Utc::now()
}

/// Returns the current UTC time as an ISO 8601 string with microsecond
/// precision, e.g. `2024-05-01T09:30:00.123456+00:00`.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Seconds elapsed from `start` to `end`, clamped at zero when the clock
/// went backwards.
#[must_use]
pub fn seconds_between(start: Timestamp, end: Timestamp) -> f64 {
    (end - start)
        .to_std()
        .map_or(0.0, |elapsed| elapsed.as_secs_f64())
}
