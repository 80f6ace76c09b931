//! Durable checkpoint store backed by one JSON file per checkpoint.
//!
//! Layout:
//!
//! ```text
//! <root>/<thread_id>/<sequence:010>-<checkpoint_id>.json
//! ```
//!
//! Each file is written to a hidden temp file, fsynced, then renamed into
//! place, so a crash leaves either the whole record or nothing. The state is
//! stored as an embedded JSON string and its digest is checked before it is
//! parsed.

use super::{state_digest, validate_thread_id, Checkpoint, CheckpointStore, StoreResult};
use crate::core::StageId;
use crate::errors::CheckpointError;
use crate::state::RunState;
use crate::utils::Timestamp;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// On-disk envelope.
#[derive(Debug, Serialize, Deserialize)]
struct StoredCheckpoint {
    thread_id: String,
    checkpoint_id: String,
    sequence: u64,
    created_at: Timestamp,
    source_stage: Option<StageId>,
    digest: String,
    state: String,
}

#[derive(Debug, Clone)]
struct Entry {
    sequence: u64,
    checkpoint_id: String,
    path: PathBuf,
}

/// File-backed checkpoint store.
#[derive(Debug)]
pub struct FileCheckpointStore {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
    max_history: Option<usize>,
}

impl FileCheckpointStore {
    /// Creates a store rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: DashMap::new(),
            max_history: None,
        }
    }

    /// Keeps at most `max` checkpoints per thread, deleting the oldest.
    #[must_use]
    pub fn with_max_history(mut self, max: usize) -> Self {
        self.max_history = Some(max.max(1));
        self
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn thread_dir(&self, thread_id: &str) -> PathBuf {
        self.root.join(thread_id)
    }

    fn thread_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Lists a thread's records in sequence order. A missing directory
    /// reads as an empty thread.
    async fn entries(&self, thread_id: &str) -> StoreResult<Vec<Entry>> {
        let dir = self.thread_dir(thread_id);
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(item) = read_dir.next_entry().await? {
            let name = item.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(entry) = parse_file_name(name) {
                entries.push(Entry {
                    path: item.path(),
                    ..entry
                });
            }
        }
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    async fn existing_entries(&self, thread_id: &str) -> StoreResult<Vec<Entry>> {
        let entries = self.entries(thread_id).await?;
        if entries.is_empty() {
            return Err(CheckpointError::ThreadNotFound(thread_id.to_string()));
        }
        Ok(entries)
    }

    async fn load(&self, thread_id: &str, entry: &Entry) -> StoreResult<Checkpoint> {
        let bytes = match tokio::fs::read(&entry.path).await {
            Ok(bytes) => bytes,
            // Pruned between listing and reading.
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CheckpointError::not_found(thread_id, &entry.checkpoint_id))
            }
            Err(e) => return Err(e.into()),
        };

        let stored: StoredCheckpoint = serde_json::from_slice(&bytes).map_err(|e| {
            CheckpointError::corrupt(thread_id, &entry.checkpoint_id, format!("unreadable envelope: {e}"))
        })?;

        if stored.thread_id != thread_id
            || stored.checkpoint_id != entry.checkpoint_id
            || stored.sequence != entry.sequence
        {
            return Err(CheckpointError::corrupt(
                thread_id,
                &entry.checkpoint_id,
                "envelope does not match its file name",
            ));
        }

        if state_digest(&stored.state) != stored.digest {
            return Err(CheckpointError::corrupt(
                thread_id,
                &entry.checkpoint_id,
                "digest mismatch",
            ));
        }

        let state: RunState = serde_json::from_str(&stored.state)?;
        Ok(Checkpoint {
            thread_id: stored.thread_id,
            checkpoint_id: stored.checkpoint_id,
            sequence: stored.sequence,
            created_at: stored.created_at,
            source_stage: stored.source_stage,
            digest: stored.digest,
            state,
        })
    }

    async fn prune(&self, entries: &[Entry]) {
        let Some(max) = self.max_history else { return };
        if entries.len() <= max {
            return;
        }
        for entry in &entries[..entries.len() - max] {
            if let Err(e) = tokio::fs::remove_file(&entry.path).await {
                warn!(path = %entry.path.display(), error = %e, "Failed to prune checkpoint");
            }
        }
    }
}

fn file_name(sequence: u64, checkpoint_id: &str) -> String {
    format!("{sequence:010}-{checkpoint_id}.json")
}

fn parse_file_name(name: &str) -> Option<Entry> {
    if name.starts_with('.') {
        return None;
    }
    let stem = name.strip_suffix(".json")?;
    let (sequence, checkpoint_id) = stem.split_once('-')?;
    Some(Entry {
        sequence: sequence.parse().ok()?,
        checkpoint_id: checkpoint_id.to_string(),
        path: PathBuf::new(),
    })
}

async fn write_atomically(dir: &Path, name: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    let tmp = dir.join(format!(".{name}.tmp"));
    let target = dir.join(name);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, &target).await?;
    sync_dir(dir).await?;

    Ok(target)
}

/// Flushes a directory so a rename inside it survives a crash.
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let handle = tokio::fs::File::open(dir).await?;
        handle.sync_all().await?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn append(
        &self,
        thread_id: &str,
        state: &RunState,
        source_stage: Option<StageId>,
    ) -> StoreResult<String> {
        validate_thread_id(thread_id)?;

        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;

        let dir = self.thread_dir(thread_id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut entries = self.entries(thread_id).await?;
        let sequence = entries.last().map_or(1, |e| e.sequence + 1);
        let (checkpoint, encoded) = Checkpoint::seal(thread_id, sequence, source_stage, state)?;

        let stored = StoredCheckpoint {
            thread_id: checkpoint.thread_id,
            checkpoint_id: checkpoint.checkpoint_id,
            sequence,
            created_at: checkpoint.created_at,
            source_stage,
            digest: checkpoint.digest,
            state: encoded,
        };
        let bytes = serde_json::to_vec_pretty(&stored)?;
        let name = file_name(sequence, &stored.checkpoint_id);
        let path = write_atomically(&dir, &name, &bytes).await?;

        debug!(
            thread_id,
            sequence,
            checkpoint_id = %stored.checkpoint_id,
            path = %path.display(),
            "Checkpoint written"
        );

        entries.push(Entry {
            sequence,
            checkpoint_id: stored.checkpoint_id.clone(),
            path,
        });
        self.prune(&entries).await;

        Ok(stored.checkpoint_id)
    }

    async fn latest(&self, thread_id: &str) -> StoreResult<Checkpoint> {
        validate_thread_id(thread_id)?;
        let entries = self.existing_entries(thread_id).await?;
        match entries.last() {
            Some(entry) => self.load(thread_id, entry).await,
            None => Err(CheckpointError::ThreadNotFound(thread_id.to_string())),
        }
    }

    async fn get(&self, thread_id: &str, checkpoint_id: &str) -> StoreResult<Checkpoint> {
        validate_thread_id(thread_id)?;
        let entries = self.existing_entries(thread_id).await?;
        let entry = entries
            .iter()
            .find(|e| e.checkpoint_id == checkpoint_id)
            .ok_or_else(|| CheckpointError::not_found(thread_id, checkpoint_id))?;
        self.load(thread_id, entry).await
    }

    async fn history(&self, thread_id: &str, limit: usize) -> StoreResult<Vec<Checkpoint>> {
        validate_thread_id(thread_id)?;
        let entries = self.existing_entries(thread_id).await?;

        let mut checkpoints = Vec::with_capacity(limit.min(entries.len()));
        for entry in entries.iter().rev().take(limit) {
            checkpoints.push(self.load(thread_id, entry).await?);
        }
        Ok(checkpoints)
    }

    async fn threads(&self) -> StoreResult<Vec<String>> {
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(item) = read_dir.next_entry().await? {
            if !item.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = item.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_thread_id(&name).is_ok() && !self.entries(&name).await?.is_empty() {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;
    use tempfile::TempDir;

    fn store() -> (TempDir, FileCheckpointStore) {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints"));
        (dir, store)
    }

    #[tokio::test]
    async fn test_append_then_latest() {
        let (_dir, store) = store();
        conformance::append_then_latest(&store).await;
    }

    #[tokio::test]
    async fn test_history() {
        let (_dir, store) = store();
        conformance::history_is_newest_first_and_limited(&store).await;
    }

    #[tokio::test]
    async fn test_missing_lookups() {
        let (_dir, store) = store();
        conformance::missing_lookups(&store).await;
    }

    #[tokio::test]
    async fn test_threads_are_independent() {
        let (_dir, store) = store();
        conformance::threads_are_independent(&store).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends() {
        let (_dir, store) = store();
        conformance::concurrent_appends(std::sync::Arc::new(store)).await;
    }

    #[tokio::test]
    async fn test_capped_history() {
        let (_dir, store) = store();
        let store = store.with_max_history(2);
        conformance::capped_history_drops_oldest(&store).await;
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let state = RunState::new("wf", "thread_r", "a", "b", "c", "d");

        let id = {
            let store = FileCheckpointStore::new(dir.path());
            store.append("thread_r", &state, None).await.unwrap();
            store.append("thread_r", &state, Some(StageId::TemplateIntake)).await.unwrap()
        };

        let reopened = FileCheckpointStore::new(dir.path());
        let latest = reopened.latest("thread_r").await.unwrap();
        assert_eq!(latest.checkpoint_id, id);
        assert_eq!(latest.sequence, 2);
        assert_eq!(latest.source_stage, Some(StageId::TemplateIntake));
        assert_eq!(reopened.threads().await.unwrap(), vec!["thread_r".to_string()]);
    }

    #[tokio::test]
    async fn test_tampered_state_is_reported_corrupt() {
        let (_dir, store) = store();
        let state = RunState::new("wf", "thread_t", "a", "b", "c", "d");
        let id = store.append("thread_t", &state, None).await.unwrap();

        let path = store.thread_dir("thread_t").join(file_name(1, &id));
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let mut stored: StoredCheckpoint = serde_json::from_str(&raw).unwrap();
        stored.state = stored.state.replace("\"pending\"", "\"completed\"");
        tokio::fs::write(&path, serde_json::to_vec(&stored).unwrap()).await.unwrap();

        let err = store.latest("thread_t").await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_renamed_file_is_reported_corrupt() {
        let (_dir, store) = store();
        let state = RunState::new("wf", "thread_m", "a", "b", "c", "d");
        let id = store.append("thread_m", &state, None).await.unwrap();

        let dir = store.thread_dir("thread_m");
        tokio::fs::rename(dir.join(file_name(1, &id)), dir.join(file_name(7, &id)))
            .await
            .unwrap();

        let err = store.latest("thread_m").await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }), "got {err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sync_dir_reports_failures() {
        let dir = TempDir::new().unwrap();
        sync_dir(dir.path()).await.unwrap();
        assert!(sync_dir(&dir.path().join("missing")).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_append_fails_when_thread_dir_is_unusable() {
        let dir = TempDir::new().unwrap();
        // A regular file where the checkpoint root should be.
        let root = dir.path().join("checkpoints");
        tokio::fs::write(&root, b"").await.unwrap();

        let store = FileCheckpointStore::new(&root);
        let state = RunState::new("wf", "thread_x", "a", "b", "c", "d");
        let err = store.append("thread_x", &state, None).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Io(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_temp_files_are_ignored() {
        let (_dir, store) = store();
        let state = RunState::new("wf", "thread_p", "a", "b", "c", "d");
        store.append("thread_p", &state, None).await.unwrap();

        let dir = store.thread_dir("thread_p");
        tokio::fs::write(dir.join(".0000000002-partial.json.tmp"), b"{")
            .await
            .unwrap();

        assert_eq!(store.history("thread_p", 10).await.unwrap().len(), 1);
        assert_eq!(store.latest("thread_p").await.unwrap().sequence, 1);
    }

    #[test]
    fn test_file_name_roundtrip() {
        let name = file_name(42, "0191f2a0-7c4e-7d3b-8a55-1b2c3d4e5f60");
        assert_eq!(name, "0000000042-0191f2a0-7c4e-7d3b-8a55-1b2c3d4e5f60.json");

        let entry = parse_file_name(&name).unwrap();
        assert_eq!(entry.sequence, 42);
        assert_eq!(entry.checkpoint_id, "0191f2a0-7c4e-7d3b-8a55-1b2c3d4e5f60");
        assert!(parse_file_name(".tmp").is_none());
        assert!(parse_file_name("notes.txt").is_none());
    }
}
