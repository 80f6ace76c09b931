//! Run loop and store configuration.
//!
//! Both configs deserialize with defaults for every field and can be read
//! from the environment:
//!
//! | Variable | Field |
//! |---|---|
//! | `WORKSPACE_ROOT` | [`RunConfig::workspace_root`] |
//! | `DECKFLOW_MAX_RETRIES` | [`RunConfig::max_retries`] |
//! | `DECKFLOW_ENABLE_INTERRUPTS` | [`RunConfig::enable_interrupts`] |
//! | `DECKFLOW_INTERRUPT_BEFORE` | [`RunConfig::interrupt_before`] (comma separated) |
//! | `DECKFLOW_CHECKPOINT_DIR` | [`StoreConfig::backend`] |
//! | `DECKFLOW_MAX_HISTORY` | [`StoreConfig::max_history`] |

use crate::core::StageId;
use crate::store::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Configuration consumed by the run loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Stages to suspend in front of.
    #[serde(default)]
    pub interrupt_before: BTreeSet<StageId>,
    /// Also suspend in front of every generative stage.
    #[serde(default)]
    pub enable_interrupts: bool,
    /// Accepted for compatibility; the loop never retries a failed stage.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Root under which handlers place workflow workspaces.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
}

fn default_max_retries() -> u32 {
    3
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("outputs")
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            interrupt_before: BTreeSet::new(),
            enable_interrupts: false,
            max_retries: default_max_retries(),
            workspace_root: default_workspace_root(),
        }
    }
}

impl RunConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads overrides from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads overrides through `lookup`. Unparseable values are logged and
    /// ignored.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(root) = lookup("WORKSPACE_ROOT").filter(|v| !v.trim().is_empty()) {
            config.workspace_root = PathBuf::from(root);
        }
        if let Some(raw) = lookup("DECKFLOW_MAX_RETRIES") {
            match raw.trim().parse() {
                Ok(n) => config.max_retries = n,
                Err(_) => warn!(value = %raw, "Ignoring invalid DECKFLOW_MAX_RETRIES"),
            }
        }
        if let Some(raw) = lookup("DECKFLOW_ENABLE_INTERRUPTS") {
            match parse_bool(&raw) {
                Some(flag) => config.enable_interrupts = flag,
                None => warn!(value = %raw, "Ignoring invalid DECKFLOW_ENABLE_INTERRUPTS"),
            }
        }
        if let Some(raw) = lookup("DECKFLOW_INTERRUPT_BEFORE") {
            for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                match part.parse::<StageId>() {
                    Ok(stage) => {
                        config.interrupt_before.insert(stage);
                    }
                    Err(e) => warn!(error = %e, "Ignoring entry in DECKFLOW_INTERRUPT_BEFORE"),
                }
            }
        }

        config
    }

    /// Adds an interrupt point.
    #[must_use]
    pub fn with_interrupt_before(mut self, stage: StageId) -> Self {
        self.interrupt_before.insert(stage);
        self
    }

    /// Enables interrupts before every generative stage.
    #[must_use]
    pub fn with_interrupts_enabled(mut self, enabled: bool) -> Self {
        self.enable_interrupts = enabled;
        self
    }

    /// Sets the workspace root.
    #[must_use]
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// The effective interrupt set.
    #[must_use]
    pub fn interrupts(&self) -> BTreeSet<StageId> {
        let mut set = self.interrupt_before.clone();
        if self.enable_interrupts {
            set.extend(StageId::generative());
        }
        set
    }

    /// Returns true if the loop should suspend before `stage`.
    #[must_use]
    pub fn should_interrupt(&self, stage: StageId) -> bool {
        self.interrupt_before.contains(&stage)
            || (self.enable_interrupts && stage.kind() == crate::core::StageKind::Generative)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Which checkpoint backend to open.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreBackend {
    /// Non-durable, process-local.
    #[default]
    Memory,
    /// One JSON file per checkpoint under `path`.
    File {
        /// Root directory.
        path: PathBuf,
    },
}

/// Checkpoint store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection.
    #[serde(default)]
    pub backend: StoreBackend,
    /// Per-thread retention cap. Unbounded when unset.
    #[serde(default)]
    pub max_history: Option<usize>,
}

impl StoreConfig {
    /// In-memory, unbounded.
    #[must_use]
    pub fn memory() -> Self {
        Self::default()
    }

    /// File-backed, unbounded.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: StoreBackend::File { path: path.into() },
            max_history: None,
        }
    }

    /// Sets the retention cap.
    #[must_use]
    pub fn with_max_history(mut self, max: usize) -> Self {
        self.max_history = Some(max);
        self
    }

    /// Reads the backend from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the backend through `lookup`: a non-empty
    /// `DECKFLOW_CHECKPOINT_DIR` selects the file backend.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = match lookup("DECKFLOW_CHECKPOINT_DIR").filter(|v| !v.trim().is_empty()) {
            Some(dir) => Self::file(dir),
            None => Self::memory(),
        };
        if let Some(raw) = lookup("DECKFLOW_MAX_HISTORY") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.max_history = Some(n),
                _ => warn!(value = %raw, "Ignoring invalid DECKFLOW_MAX_HISTORY"),
            }
        }
        config
    }

    /// Builds the configured store.
    #[must_use]
    pub fn open(&self) -> Arc<dyn CheckpointStore> {
        match &self.backend {
            StoreBackend::Memory => {
                let store = InMemoryCheckpointStore::new();
                Arc::new(match self.max_history {
                    Some(max) => store.with_max_history(max),
                    None => store,
                })
            }
            StoreBackend::File { path } => {
                let store = FileCheckpointStore::new(path);
                Arc::new(match self.max_history {
                    Some(max) => store.with_max_history(max),
                    None => store,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.workspace_root, PathBuf::from("outputs"));
        assert!(config.interrupts().is_empty());
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: RunConfig =
            serde_json::from_str(r#"{"interrupt_before": ["stage3_outline", "2"]}"#).unwrap();
        assert_eq!(
            config.interrupt_before,
            [StageId::Analyze, StageId::Outline].into_iter().collect()
        );
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_enable_interrupts_adds_generative_stages() {
        let config = RunConfig::new()
            .with_interrupts_enabled(true)
            .with_interrupt_before(StageId::Finalize);

        let expected: BTreeSet<StageId> = [
            StageId::Analyze,
            StageId::Outline,
            StageId::Replacements,
            StageId::Finalize,
        ]
        .into_iter()
        .collect();
        assert_eq!(config.interrupts(), expected);
        assert!(config.should_interrupt(StageId::Outline));
        assert!(!config.should_interrupt(StageId::Extract));
    }

    #[test]
    fn test_from_lookup() {
        let config = RunConfig::from_lookup(lookup(&[
            ("WORKSPACE_ROOT", "/tmp/decks"),
            ("DECKFLOW_MAX_RETRIES", "5"),
            ("DECKFLOW_ENABLE_INTERRUPTS", "yes"),
            ("DECKFLOW_INTERRUPT_BEFORE", "7, bogus ,0B"),
        ]));

        assert_eq!(config.workspace_root, PathBuf::from("/tmp/decks"));
        assert_eq!(config.max_retries, 5);
        assert!(config.enable_interrupts);
        assert_eq!(
            config.interrupt_before,
            [StageId::SourceIntake, StageId::Finalize].into_iter().collect()
        );
    }

    #[test]
    fn test_from_lookup_ignores_bad_values() {
        let config = RunConfig::from_lookup(lookup(&[
            ("DECKFLOW_MAX_RETRIES", "many"),
            ("DECKFLOW_ENABLE_INTERRUPTS", "perhaps"),
        ]));
        assert_eq!(config, RunConfig::default());
    }

    #[test]
    fn test_store_config_from_lookup() {
        assert_eq!(StoreConfig::from_lookup(lookup(&[])), StoreConfig::memory());

        let config = StoreConfig::from_lookup(lookup(&[
            ("DECKFLOW_CHECKPOINT_DIR", "/var/lib/deckflow"),
            ("DECKFLOW_MAX_HISTORY", "50"),
        ]));
        assert_eq!(config, StoreConfig::file("/var/lib/deckflow").with_max_history(50));
    }

    #[test]
    fn test_store_config_serde() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"backend": {"type": "file", "path": "cp"}}"#).unwrap();
        assert_eq!(config, StoreConfig::file("cp"));
    }

    #[tokio::test]
    async fn test_open_memory_store() {
        let store = StoreConfig::memory().with_max_history(1).open();
        let state = crate::state::RunState::new("w", "t", "a", "b", "c", "d");
        store.append("t", &state, None).await.unwrap();
        store.append("t", &state, None).await.unwrap();
        assert_eq!(store.history("t", 10).await.unwrap().len(), 1);
    }
}
