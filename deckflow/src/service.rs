//! Run control surface.
//!
//! [`RunService`] is what a CLI or HTTP front end talks to: it creates runs,
//! reports status from the latest checkpoint, resumes threads and forwards
//! cancellation to the loop that is currently driving a thread.

use crate::cancellation::{CancelMode, CancellationToken};
use crate::config::RunConfig;
use crate::core::{RunStatus, StageId};
use crate::errors::{CheckpointError, DeckflowError};
use crate::events::{EventSink, NoOpEventSink};
use crate::pipeline::{RunLoop, RunOutcome, StageRegistry};
use crate::state::{ErrorRecord, RunState, StageTiming};
use crate::store::{load_checkpoint, CheckpointStore};
use crate::utils::{generate_thread_id, generate_workflow_id, Timestamp};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Name of the artifact holding the generated deck.
pub const FINAL_OUTPUT_ARTIFACT: &str = "final_pptx";

/// Inputs of a new run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRun {
    /// Template document reference.
    pub template_ref: String,
    /// Source document reference.
    pub source_ref: String,
    /// Output name, without extension.
    pub output_name: String,
    /// Workflow id; generated when unset.
    #[serde(default)]
    pub workflow_id: Option<String>,
    /// Thread id; generated when unset.
    #[serde(default)]
    pub thread_id: Option<String>,
}

impl NewRun {
    /// Creates a request with generated ids.
    #[must_use]
    pub fn new(
        template_ref: impl Into<String>,
        source_ref: impl Into<String>,
        output_name: impl Into<String>,
    ) -> Self {
        Self {
            template_ref: template_ref.into(),
            source_ref: source_ref.into(),
            output_name: output_name.into(),
            workflow_id: None,
            thread_id: None,
        }
    }

    /// Uses a fixed thread id.
    #[must_use]
    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Uses a fixed workflow id.
    #[must_use]
    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }
}

/// Identity of a created run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    /// The workflow id.
    pub workflow_id: String,
    /// The thread id.
    pub thread_id: String,
    /// The workspace directory recorded in the state.
    pub workspace_dir: String,
    /// The initial checkpoint.
    pub checkpoint_id: String,
}

/// Status report built from a thread's latest checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusView {
    /// The workflow id.
    pub workflow_id: String,
    /// The thread id.
    pub thread_id: String,
    /// The checkpoint the view was read from.
    pub checkpoint_id: String,
    /// Current status.
    pub status: RunStatus,
    /// Last completed stage.
    pub current_stage: Option<StageId>,
    /// Stage the run is suspended in front of.
    pub paused_before: Option<StageId>,
    /// Completed stages.
    pub completed_stages: Vec<StageId>,
    /// Failed stages.
    pub failed_stages: Vec<StageId>,
    /// Number of completed stages.
    pub completed_count: usize,
    /// Number of stages in the workflow.
    pub total_stages: usize,
    /// Artifact locations.
    pub artifacts: BTreeMap<String, String>,
    /// Failure history.
    pub errors: Vec<ErrorRecord>,
    /// Timing history.
    pub stage_timings: Vec<StageTiming>,
    /// When the first stage started.
    pub started_at: Option<Timestamp>,
    /// When the run completed.
    pub completed_at: Option<Timestamp>,
    /// Total run time.
    pub total_duration_seconds: Option<f64>,
    /// Most recent progress message.
    pub last_message: Option<String>,
    /// Whether a loop in this process is driving the thread.
    pub active: bool,
}

impl RunStatusView {
    fn new(checkpoint_id: String, state: RunState, active: bool) -> Self {
        let (completed_count, total_stages) = state.progress();
        let last_message = state.last_message().map(|m| m.content.clone());
        Self {
            workflow_id: state.workflow_id,
            thread_id: state.thread_id,
            checkpoint_id,
            status: state.status,
            current_stage: state.current_stage,
            paused_before: state.paused_before,
            completed_stages: state.completed_stages,
            failed_stages: state.failed_stages,
            completed_count,
            total_stages,
            artifacts: state.artifacts,
            errors: state.errors,
            stage_timings: state.stage_timings,
            started_at: state.started_at,
            completed_at: state.completed_at,
            total_duration_seconds: state.total_duration_seconds,
            last_message,
            active,
        }
    }

    /// Progress as `n/total`.
    #[must_use]
    pub fn progress(&self) -> String {
        format!("{}/{}", self.completed_count, self.total_stages)
    }
}

/// One row of a checkpoint listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    /// The checkpoint id.
    pub checkpoint_id: String,
    /// Position within the thread.
    pub sequence: u64,
    /// When it was written.
    pub created_at: Timestamp,
    /// The stage whose transition produced it.
    pub source_stage: Option<StageId>,
    /// Last completed stage at that point.
    pub current_stage: Option<StageId>,
    /// Status at that point.
    pub status: RunStatus,
    /// Completed stage count at that point.
    pub completed_count: usize,
}

/// Marks a thread as driven by this process until dropped.
struct ActiveRun {
    active: Arc<DashMap<String, Arc<CancellationToken>>>,
    thread_id: String,
    token: Arc<CancellationToken>,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.active.remove(&self.thread_id);
    }
}

/// Creates, inspects, resumes and cancels runs.
#[derive(Debug, Clone)]
pub struct RunService {
    registry: Arc<StageRegistry>,
    store: Arc<dyn CheckpointStore>,
    config: RunConfig,
    events: Arc<dyn EventSink>,
    active: Arc<DashMap<String, Arc<CancellationToken>>>,
}

impl RunService {
    /// Creates a service with default configuration.
    #[must_use]
    pub fn new(registry: Arc<StageRegistry>, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            registry,
            store,
            config: RunConfig::default(),
            events: Arc::new(NoOpEventSink),
            active: Arc::new(DashMap::new()),
        }
    }

    /// Sets the run configuration.
    #[must_use]
    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the event sink handed to every loop.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Returns true if a loop in this process is driving the thread.
    #[must_use]
    pub fn is_active(&self, thread_id: &str) -> bool {
        self.active.contains_key(thread_id)
    }

    /// Persists the initial pending checkpoint of a new run.
    ///
    /// A thread id that already has checkpoints is rejected with
    /// [`DeckflowError::ThreadExists`].
    pub async fn create_run(&self, request: NewRun) -> Result<RunHandle, DeckflowError> {
        let workflow_id = request.workflow_id.unwrap_or_else(generate_workflow_id);
        let thread_id = request.thread_id.unwrap_or_else(generate_thread_id);

        let _claim = self.claim(&thread_id)?;
        match self.store.latest(&thread_id).await {
            Ok(_) => return Err(DeckflowError::ThreadExists(thread_id)),
            Err(CheckpointError::ThreadNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let workspace_dir = self
            .config
            .workspace_root
            .join(&workflow_id)
            .display()
            .to_string();

        let state = RunState::new(
            &workflow_id,
            &thread_id,
            request.template_ref,
            request.source_ref,
            request.output_name,
            &workspace_dir,
        );
        let snapshot = self.run_loop(Arc::new(CancellationToken::new())).start(state).await?;

        info!(workflow_id = %workflow_id, thread_id = %thread_id, "Run created");
        Ok(RunHandle {
            workflow_id,
            thread_id,
            workspace_dir,
            checkpoint_id: snapshot.checkpoint_id,
        })
    }

    /// Reports the latest checkpoint of a thread.
    pub async fn get_status(&self, thread_id: &str) -> Result<RunStatusView, DeckflowError> {
        let checkpoint = self.store.latest(thread_id).await?;
        Ok(RunStatusView::new(
            checkpoint.checkpoint_id,
            checkpoint.state,
            self.is_active(thread_id),
        ))
    }

    /// Lists up to `limit` checkpoints, most recent first.
    pub async fn list_checkpoints(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<CheckpointSummary>, DeckflowError> {
        let history = self.store.history(thread_id, limit).await?;
        Ok(history
            .into_iter()
            .map(|c| CheckpointSummary {
                checkpoint_id: c.checkpoint_id,
                sequence: c.sequence,
                created_at: c.created_at,
                source_stage: c.source_stage,
                current_stage: c.state.current_stage,
                status: c.state.status,
                completed_count: c.state.completed_stages.len(),
            })
            .collect())
    }

    /// Returns the location of the final artifact of a completed run.
    pub async fn get_result(&self, thread_id: &str) -> Result<String, DeckflowError> {
        let state = self.store.latest(thread_id).await?.state;
        if state.status != RunStatus::Completed {
            return Err(DeckflowError::NotCompleted {
                thread_id: thread_id.to_string(),
                status: state.status.to_string(),
            });
        }
        state
            .artifacts
            .get(FINAL_OUTPUT_ARTIFACT)
            .cloned()
            .ok_or_else(|| DeckflowError::ArtifactMissing {
                thread_id: thread_id.to_string(),
                name: FINAL_OUTPUT_ARTIFACT.to_string(),
            })
    }

    /// Re-enters the loop from a checkpoint (the latest when `checkpoint_id`
    /// is `None`) and drives it to a stop.
    ///
    /// Resuming from an older checkpoint appends after the thread's latest
    /// record; history is never rewritten.
    pub async fn resume(
        &self,
        thread_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<RunOutcome, DeckflowError> {
        let active = self.claim(thread_id)?;
        self.drive(active, checkpoint_id).await
    }

    /// Like [`RunService::resume`] from the latest checkpoint, on a spawned
    /// task. The thread is claimed before this returns.
    pub fn spawn_resume(
        &self,
        thread_id: &str,
    ) -> Result<tokio::task::JoinHandle<Result<RunOutcome, DeckflowError>>, DeckflowError> {
        let active = self.claim(thread_id)?;
        let service = self.clone();
        Ok(tokio::spawn(async move { service.drive(active, None).await }))
    }

    /// Creates a run and drives it to a stop.
    pub async fn start(&self, request: NewRun) -> Result<(RunHandle, RunOutcome), DeckflowError> {
        let handle = self.create_run(request).await?;
        let outcome = self.resume(&handle.thread_id, None).await?;
        Ok((handle, outcome))
    }

    /// Requests cancellation of the loop driving `thread_id`.
    ///
    /// Returns `false` if the thread exists but nothing in this process is
    /// driving it.
    pub async fn cancel(
        &self,
        thread_id: &str,
        reason: impl Into<String>,
        abort: bool,
    ) -> Result<bool, DeckflowError> {
        let token = self.active.get(thread_id).map(|entry| entry.value().clone());
        let Some(token) = token else {
            self.store.latest(thread_id).await?;
            return Ok(false);
        };

        let mode = if abort { CancelMode::Abort } else { CancelMode::Pause };
        info!(thread_id, mode = ?mode, "Cancellation requested");
        token.cancel_with(reason, mode);
        Ok(true)
    }

    fn claim(&self, thread_id: &str) -> Result<ActiveRun, DeckflowError> {
        match self.active.entry(thread_id.to_string()) {
            Entry::Occupied(_) => Err(DeckflowError::AlreadyRunning(thread_id.to_string())),
            Entry::Vacant(slot) => {
                let token = Arc::new(CancellationToken::new());
                slot.insert(token.clone());
                Ok(ActiveRun {
                    active: self.active.clone(),
                    thread_id: thread_id.to_string(),
                    token,
                })
            }
        }
    }

    async fn drive(
        &self,
        active: ActiveRun,
        checkpoint_id: Option<&str>,
    ) -> Result<RunOutcome, DeckflowError> {
        let checkpoint = load_checkpoint(self.store.as_ref(), &active.thread_id, checkpoint_id).await?;
        info!(
            thread_id = %active.thread_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            sequence = checkpoint.sequence,
            "Resuming run"
        );
        self.run_loop(active.token.clone()).run(checkpoint.state).await
    }

    fn run_loop(&self, cancel: Arc<CancellationToken>) -> RunLoop {
        RunLoop::new(self.registry.clone(), self.store.clone())
            .with_config(self.config.clone())
            .with_cancellation(cancel)
            .with_event_sink(self.events.clone())
    }
}
