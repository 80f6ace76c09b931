//! Append-only checkpoint persistence.
//!
//! Every run loop transition appends one immutable [`Checkpoint`]. Records
//! are addressed by `(thread_id, checkpoint_id)` and ordered by a
//! per-thread `sequence`. Two backends share the same semantics:
//! - [`InMemoryCheckpointStore`] for tests and single-process use
//! - [`FileCheckpointStore`] for durable, crash-safe history

mod file;
mod memory;

pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;

use crate::core::StageId;
use crate::errors::CheckpointError;
use crate::state::RunState;
use crate::utils::{generate_checkpoint_id, now, Timestamp};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, CheckpointError>;

/// An immutable persisted copy of a run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The thread this record belongs to.
    pub thread_id: String,
    /// Unique id within the thread.
    pub checkpoint_id: String,
    /// Position within the thread, starting at 1.
    pub sequence: u64,
    /// When the record was appended.
    pub created_at: Timestamp,
    /// The stage whose transition produced this record.
    pub source_stage: Option<StageId>,
    /// Hex SHA-256 of the serialized state.
    pub digest: String,
    /// The snapshot.
    pub state: RunState,
}

impl Checkpoint {
    /// Builds the next record of a thread, returning it with the serialized
    /// state its digest covers.
    pub(crate) fn seal(
        thread_id: &str,
        sequence: u64,
        source_stage: Option<StageId>,
        state: &RunState,
    ) -> StoreResult<(Self, String)> {
        let encoded = serde_json::to_string(state)?;
        let checkpoint = Self {
            thread_id: thread_id.to_string(),
            checkpoint_id: generate_checkpoint_id(),
            sequence,
            created_at: now(),
            source_stage,
            digest: state_digest(&encoded),
            state: state.clone(),
        };
        Ok((checkpoint, encoded))
    }
}

/// Storage backend for checkpoints.
///
/// Appends for distinct threads never interfere. Callers must not run two
/// loops against the same thread at once.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CheckpointStore: Send + Sync + std::fmt::Debug {
    /// Appends a snapshot and returns its checkpoint id.
    async fn append(
        &self,
        thread_id: &str,
        state: &RunState,
        source_stage: Option<StageId>,
    ) -> StoreResult<String>;

    /// Returns the most recent checkpoint of a thread.
    async fn latest(&self, thread_id: &str) -> StoreResult<Checkpoint>;

    /// Returns a specific checkpoint.
    async fn get(&self, thread_id: &str, checkpoint_id: &str) -> StoreResult<Checkpoint>;

    /// Returns up to `limit` checkpoints, most recent first.
    async fn history(&self, thread_id: &str, limit: usize) -> StoreResult<Vec<Checkpoint>>;

    /// Returns every thread id with at least one checkpoint.
    async fn threads(&self) -> StoreResult<Vec<String>>;
}

/// Point-in-time lookup: the given checkpoint, or the latest one.
pub async fn load_checkpoint(
    store: &dyn CheckpointStore,
    thread_id: &str,
    checkpoint_id: Option<&str>,
) -> StoreResult<Checkpoint> {
    match checkpoint_id {
        Some(id) => store.get(thread_id, id).await,
        None => store.latest(thread_id).await,
    }
}

/// Hex SHA-256 of a serialized state.
#[must_use]
pub fn state_digest(encoded: &str) -> String {
    hex::encode(Sha256::digest(encoded.as_bytes()))
}

fn thread_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_.-]{1,128}$").expect("thread id pattern compiles")
    })
}

/// Rejects thread ids that cannot be used as a storage key.
pub fn validate_thread_id(thread_id: &str) -> StoreResult<()> {
    if thread_id == "." || thread_id == ".." || !thread_id_pattern().is_match(thread_id) {
        return Err(CheckpointError::InvalidThreadId(thread_id.to_string()));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_thread_id() {
        assert!(validate_thread_id("thread_1a2b3c4d").is_ok());
        assert!(validate_thread_id("run-2024.01").is_ok());
        assert!(validate_thread_id("").is_err());
        assert!(validate_thread_id("..").is_err());
        assert!(validate_thread_id("a/b").is_err());
        assert!(validate_thread_id("a b").is_err());
    }

    #[test]
    fn test_digest_is_hex_sha256() {
        let digest = state_digest("{}");
        assert_eq!(digest.len(), 64);
        assert_eq!(
            digest,
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn test_seal_covers_serialized_state() {
        let state = RunState::new("w", "t", "a", "b", "c", "d");
        let (checkpoint, encoded) = Checkpoint::seal("t", 7, Some(StageId::Extract), &state).unwrap();
        assert_eq!(checkpoint.sequence, 7);
        assert_eq!(checkpoint.digest, state_digest(&encoded));
        assert_eq!(checkpoint.state, state);
    }
}
