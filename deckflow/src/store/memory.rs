//! Non-durable checkpoint store.

use super::{validate_thread_id, Checkpoint, CheckpointStore, StoreResult};
use crate::core::StageId;
use crate::errors::CheckpointError;
use crate::state::RunState;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// In-memory checkpoint store.
///
/// The write lock is held only for the push itself, so appends never
/// overlap a running handler.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    threads: RwLock<HashMap<String, Vec<Checkpoint>>>,
    max_history: Option<usize>,
}

impl InMemoryCheckpointStore {
    /// Creates an unbounded store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `max` checkpoints per thread, dropping the oldest.
    #[must_use]
    pub fn with_max_history(mut self, max: usize) -> Self {
        self.max_history = Some(max.max(1));
        self
    }

    /// Returns the number of checkpoints held for a thread.
    #[must_use]
    pub fn len(&self, thread_id: &str) -> usize {
        self.threads.read().get(thread_id).map_or(0, Vec::len)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn append(
        &self,
        thread_id: &str,
        state: &RunState,
        source_stage: Option<StageId>,
    ) -> StoreResult<String> {
        validate_thread_id(thread_id)?;

        let mut threads = self.threads.write();
        let sequence = threads
            .get(thread_id)
            .and_then(|records| records.last())
            .map_or(1, |c| c.sequence + 1);
        let (checkpoint, _) = Checkpoint::seal(thread_id, sequence, source_stage, state)?;
        let id = checkpoint.checkpoint_id.clone();

        let records = threads.entry(thread_id.to_string()).or_default();
        records.push(checkpoint);

        if let Some(max) = self.max_history {
            if records.len() > max {
                let excess = records.len() - max;
                records.drain(..excess);
            }
        }

        Ok(id)
    }

    async fn latest(&self, thread_id: &str) -> StoreResult<Checkpoint> {
        validate_thread_id(thread_id)?;
        self.threads
            .read()
            .get(thread_id)
            .and_then(|records| records.last().cloned())
            .ok_or_else(|| CheckpointError::ThreadNotFound(thread_id.to_string()))
    }

    async fn get(&self, thread_id: &str, checkpoint_id: &str) -> StoreResult<Checkpoint> {
        validate_thread_id(thread_id)?;
        let threads = self.threads.read();
        let records = threads
            .get(thread_id)
            .ok_or_else(|| CheckpointError::ThreadNotFound(thread_id.to_string()))?;

        records
            .iter()
            .find(|c| c.checkpoint_id == checkpoint_id)
            .cloned()
            .ok_or_else(|| CheckpointError::not_found(thread_id, checkpoint_id))
    }

    async fn history(&self, thread_id: &str, limit: usize) -> StoreResult<Vec<Checkpoint>> {
        validate_thread_id(thread_id)?;
        let threads = self.threads.read();
        let records = threads
            .get(thread_id)
            .ok_or_else(|| CheckpointError::ThreadNotFound(thread_id.to_string()))?;

        Ok(records.iter().rev().take(limit).cloned().collect())
    }

    async fn threads(&self) -> StoreResult<Vec<String>> {
        let mut ids: Vec<String> = self.threads.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
