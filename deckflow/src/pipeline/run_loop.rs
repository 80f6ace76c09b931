//! The checkpointed run loop.
//!
//! Each transition follows the same shape: resolve the next stage, invoke
//! its handler against a read-only view of the state, merge the returned
//! delta into a copy, append that copy to the store, and only then treat it
//! as the new state. A failed append therefore leaves the caller on the
//! last durable checkpoint.

use super::registry::StageRegistry;
use super::resolver::NextStage;
use crate::cancellation::{CancelMode, CancellationToken};
use crate::config::RunConfig;
use crate::core::{RunStatus, StageId};
use crate::errors::DeckflowError;
use crate::events::{EventKind, EventSink, NoOpEventSink, RunEvent};
use crate::stages::StageContext;
use crate::state::{
    append_message, mark_complete, record_failure, ErrorRecord, MessageRole, RunState, StateDelta,
};
use crate::store::CheckpointStore;
use crate::utils::now;
use futures::{FutureExt, Stream};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A persisted state together with the checkpoint that holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// The checkpoint id returned by the store.
    pub checkpoint_id: String,
    /// The stage whose transition produced the checkpoint.
    pub source_stage: Option<StageId>,
    /// The persisted state.
    pub state: RunState,
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every stage completed.
    Completed(RunState),
    /// A stage failed, or the run was aborted.
    Failed(RunState),
    /// The loop suspended before an interrupt stage.
    Interrupted {
        /// The stage that will run on resume.
        stage: StageId,
        /// The suspended state.
        state: RunState,
    },
    /// A pause was requested through the cancellation token.
    Cancelled(RunState),
}

impl RunOutcome {
    /// Returns the final state.
    #[must_use]
    pub fn state(&self) -> &RunState {
        match self {
            Self::Completed(state)
            | Self::Failed(state)
            | Self::Cancelled(state)
            | Self::Interrupted { state, .. } => state,
        }
    }

    /// Consumes the outcome, returning the final state.
    #[must_use]
    pub fn into_state(self) -> RunState {
        match self {
            Self::Completed(state)
            | Self::Failed(state)
            | Self::Cancelled(state)
            | Self::Interrupted { state, .. } => state,
        }
    }

    /// Returns true if resuming the thread would make progress.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Interrupted { .. } | Self::Cancelled(_)) && !self.state().status.is_terminal()
    }
}

/// Result of a single transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// A stage completed and the loop can continue.
    Progressed(Snapshot),
    /// The loop stopped. `snapshot` is set when stopping appended a
    /// checkpoint.
    Stopped {
        /// Why it stopped.
        outcome: RunOutcome,
        /// The checkpoint written on the way out, if any.
        snapshot: Option<Snapshot>,
    },
}

/// Drives one thread from its current state to a stop.
#[derive(Debug, Clone)]
pub struct RunLoop {
    registry: Arc<StageRegistry>,
    store: Arc<dyn CheckpointStore>,
    config: RunConfig,
    cancel: Arc<CancellationToken>,
    events: Arc<dyn EventSink>,
}

impl RunLoop {
    /// Creates a loop with default configuration, a fresh cancellation
    /// token and no event sink.
    #[must_use]
    pub fn new(registry: Arc<StageRegistry>, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            registry,
            store,
            config: RunConfig::default(),
            cancel: Arc::new(CancellationToken::new()),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares an existing cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the cancellation token observed by this loop.
    #[must_use]
    pub fn cancellation(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Persists the initial checkpoint of a new run.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the append.
    pub async fn start(&self, initial: RunState) -> Result<Snapshot, DeckflowError> {
        self.persist(initial, None).await
    }

    /// Runs until the loop stops.
    ///
    /// # Errors
    ///
    /// Returns an error on a resolver anomaly or a store failure. Handler
    /// failures are not errors; they end in [`RunOutcome::Failed`].
    pub async fn run(&self, state: RunState) -> Result<RunOutcome, DeckflowError> {
        let mut current = state;
        loop {
            match self.step(&current).await? {
                Step::Progressed(snapshot) => current = snapshot.state,
                Step::Stopped { outcome, .. } => {
                    info!(
                        thread_id = %outcome.state().thread_id,
                        status = %outcome.state().status,
                        completed = outcome.state().completed_stages.len(),
                        "Run loop stopped"
                    );
                    return Ok(outcome);
                }
            }
        }
    }

    /// Lazily drives the loop, yielding one snapshot per checkpoint.
    ///
    /// The stream ends after the stopping checkpoint, or after the first
    /// error. Dropping it suspends the run; every yielded state is already
    /// durable.
    pub fn stream(&self, state: RunState) -> impl Stream<Item = Result<Snapshot, DeckflowError>> + '_ {
        futures::stream::unfold(Some(state), move |current| async move {
            let current = current?;
            match self.step(&current).await {
                Ok(Step::Progressed(snapshot)) => {
                    let next = snapshot.state.clone();
                    Some((Ok(snapshot), Some(next)))
                }
                Ok(Step::Stopped {
                    snapshot: Some(snapshot),
                    ..
                }) => Some((Ok(snapshot), None)),
                Ok(Step::Stopped { snapshot: None, .. }) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Performs one transition.
    ///
    /// # Errors
    ///
    /// Returns an error on a resolver anomaly, a missing handler or a store
    /// failure. `state` is never modified.
    pub async fn step(&self, state: &RunState) -> Result<Step, DeckflowError> {
        match state.status {
            RunStatus::Completed => return Ok(stopped(RunOutcome::Completed(state.clone()))),
            RunStatus::Failed => return Ok(stopped(RunOutcome::Failed(state.clone()))),
            RunStatus::Pending | RunStatus::InProgress => {}
        }

        if self.cancel.is_cancelled() {
            return self.cancelled(state).await;
        }

        match self.registry.table().next_stage(state) {
            NextStage::Done => self.complete(state).await,
            NextStage::Blocked { stage, missing } => {
                warn!(
                    thread_id = %state.thread_id,
                    stage = %stage,
                    missing = ?missing,
                    "Earliest incomplete stage has unmet prerequisites"
                );
                Err(DeckflowError::ResolverAnomaly { stage, missing })
            }
            NextStage::Run(stage) => {
                if self.config.should_interrupt(stage) && state.paused_before != Some(stage) {
                    return self.interrupt(state, stage).await;
                }
                self.execute(state, stage).await
            }
        }
    }

    async fn execute(&self, state: &RunState, stage: StageId) -> Result<Step, DeckflowError> {
        let handler = self
            .registry
            .handler(stage)
            .ok_or(DeckflowError::HandlerNotRegistered(stage))?;

        let start = now();
        if state.started_at.is_none() {
            self.emit(self.event(EventKind::RunStarted, state)).await;
        }
        self.emit(self.event(EventKind::StageStarted, state).with_stage(stage))
            .await;
        info!(
            thread_id = %state.thread_id,
            stage = %stage,
            kind = %stage.kind(),
            "Stage started"
        );

        let ctx = StageContext::new(
            stage,
            &state.workflow_id,
            &state.thread_id,
            self.config.workspace_root.clone(),
            self.cancel.clone(),
        );
        let result = match AssertUnwindSafe(handler.run(state, &ctx)).catch_unwind().await {
            Ok(Ok(update)) => Ok(update),
            Ok(Err(e)) => Err(e.message),
            Err(payload) => Err(format!("handler panicked: {}", panic_message(payload.as_ref()))),
        };

        let (mut delta, failure) = match result {
            Ok(update) => {
                let (update, touched) = update.into_handler_update();
                if touched {
                    warn!(stage = %stage, "Discarding scheduler-owned fields from handler delta");
                }
                let delta = update.merge(mark_complete(stage, start)).merge(append_message(
                    MessageRole::System,
                    format!("Stage {} ({}) completed", stage.code(), stage.label()),
                ));
                (delta, None)
            }
            Err(message) => {
                let delta = record_failure(stage, message.clone()).merge(append_message(
                    MessageRole::System,
                    format!("Stage {} ({}) failed: {message}", stage.code(), stage.label()),
                ));
                (delta, Some(message))
            }
        };
        if state.started_at.is_none() {
            delta.started_at = Some(start);
        }

        let mut next = state.clone();
        next.apply(delta);
        next.paused_before = None;

        let snapshot = self.persist(next, Some(stage)).await?;

        match failure {
            None => {
                let seconds = snapshot
                    .state
                    .stage_timings
                    .last()
                    .map_or(0.0, |t| t.duration_seconds);
                info!(
                    thread_id = %snapshot.state.thread_id,
                    stage = %stage,
                    duration_seconds = seconds,
                    "Stage completed"
                );
                self.emit(
                    self.event(EventKind::StageCompleted, &snapshot.state)
                        .with_stage(stage)
                        .with_data(serde_json::json!({ "duration_seconds": seconds })),
                )
                .await;
                Ok(Step::Progressed(snapshot))
            }
            Some(message) => {
                warn!(
                    thread_id = %snapshot.state.thread_id,
                    stage = %stage,
                    error = %message,
                    "Stage failed"
                );
                self.emit(
                    self.event(EventKind::StageFailed, &snapshot.state)
                        .with_stage(stage)
                        .with_data(serde_json::json!({ "error": message })),
                )
                .await;
                self.emit(self.event(EventKind::RunFailed, &snapshot.state).with_stage(stage))
                    .await;
                Ok(Step::Stopped {
                    outcome: RunOutcome::Failed(snapshot.state.clone()),
                    snapshot: Some(snapshot),
                })
            }
        }
    }

    async fn interrupt(&self, state: &RunState, stage: StageId) -> Result<Step, DeckflowError> {
        let mut next = state.clone();
        next.apply(StateDelta {
            updated_at: Some(now()),
            ..append_message(
                MessageRole::System,
                format!("Paused before stage {} ({})", stage.code(), stage.label()),
            )
        });
        next.paused_before = Some(stage);

        let snapshot = self.persist(next, None).await?;
        info!(thread_id = %snapshot.state.thread_id, stage = %stage, "Run interrupted");
        self.emit(self.event(EventKind::RunInterrupted, &snapshot.state).with_stage(stage))
            .await;

        Ok(Step::Stopped {
            outcome: RunOutcome::Interrupted {
                stage,
                state: snapshot.state.clone(),
            },
            snapshot: Some(snapshot),
        })
    }

    async fn cancelled(&self, state: &RunState) -> Result<Step, DeckflowError> {
        let reason = self.cancel.reason().unwrap_or_default();
        let mode = self.cancel.mode().unwrap_or_default();
        info!(thread_id = %state.thread_id, reason = %reason, mode = ?mode, "Cancellation observed");
        self.emit(
            self.event(EventKind::RunCancelled, state)
                .with_data(serde_json::json!({ "reason": reason, "abort": mode == CancelMode::Abort })),
        )
        .await;

        if mode == CancelMode::Pause {
            return Ok(stopped(RunOutcome::Cancelled(state.clone())));
        }

        let table = self.registry.table();
        let stage = table
            .first_incomplete(state)
            .or(state.current_stage)
            .or_else(|| table.order().last().copied())
            .unwrap_or(StageId::Finalize);

        let timestamp = now();
        let message = format!("cancelled: {reason}");
        let mut next = state.clone();
        next.apply(
            StateDelta {
                status: Some(RunStatus::Failed),
                errors: vec![ErrorRecord {
                    stage,
                    message: message.clone(),
                    timestamp,
                }],
                updated_at: Some(timestamp),
                ..StateDelta::default()
            }
            .merge(append_message(MessageRole::System, format!("Run aborted: {reason}"))),
        );
        next.paused_before = None;

        let snapshot = self.persist(next, None).await?;
        self.emit(self.event(EventKind::RunFailed, &snapshot.state).with_stage(stage))
            .await;

        Ok(Step::Stopped {
            outcome: RunOutcome::Cancelled(snapshot.state.clone()),
            snapshot: Some(snapshot),
        })
    }

    async fn complete(&self, state: &RunState) -> Result<Step, DeckflowError> {
        let finished = now();
        let mut next = state.clone();
        next.apply(
            StateDelta {
                status: Some(RunStatus::Completed),
                completed_at: Some(finished),
                updated_at: Some(finished),
                ..StateDelta::default()
            }
            .merge(append_message(MessageRole::System, "Workflow completed")),
        );
        next.total_duration_seconds = Some(next.total_duration().unwrap_or(0.0));
        next.paused_before = None;

        let snapshot = self.persist(next, None).await?;
        info!(
            thread_id = %snapshot.state.thread_id,
            total_duration_seconds = snapshot.state.total_duration_seconds.unwrap_or(0.0),
            "Run completed"
        );
        self.emit(
            self.event(EventKind::RunCompleted, &snapshot.state)
                .with_data(serde_json::json!({
                    "total_duration_seconds": snapshot.state.total_duration_seconds,
                    "artifacts": snapshot.state.artifacts,
                })),
        )
        .await;

        Ok(Step::Stopped {
            outcome: RunOutcome::Completed(snapshot.state.clone()),
            snapshot: Some(snapshot),
        })
    }

    async fn persist(
        &self,
        state: RunState,
        source_stage: Option<StageId>,
    ) -> Result<Snapshot, DeckflowError> {
        let checkpoint_id = match self.store.append(&state.thread_id, &state, source_stage).await {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    thread_id = %state.thread_id,
                    error = %e,
                    "Checkpoint append failed; transition not committed"
                );
                return Err(e.into());
            }
        };
        debug!(thread_id = %state.thread_id, checkpoint_id = %checkpoint_id, "Checkpoint saved");
        self.emit(
            self.event(EventKind::CheckpointSaved, &state)
                .with_data(serde_json::json!({ "checkpoint_id": checkpoint_id })),
        )
        .await;

        Ok(Snapshot {
            checkpoint_id,
            source_stage,
            state,
        })
    }

    fn event(&self, kind: EventKind, state: &RunState) -> RunEvent {
        RunEvent::new(kind, &state.workflow_id, &state.thread_id)
    }

    async fn emit(&self, event: RunEvent) {
        self.events.emit(&event).await;
    }
}

fn stopped(outcome: RunOutcome) -> Step {
    Step::Stopped {
        outcome,
        snapshot: None,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CheckpointError;
    use crate::events::CollectingEventSink;
    use crate::store::{InMemoryCheckpointStore, MockCheckpointStore};
    use crate::testing::{full_registry, initial_state, FailingHandler, PanickingHandler};
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    fn run_loop(registry: StageRegistry) -> (RunLoop, Arc<InMemoryCheckpointStore>) {
        let store = Arc::new(InMemoryCheckpointStore::new());
        (RunLoop::new(Arc::new(registry), store.clone()), store)
    }

    #[tokio::test]
    async fn test_step_runs_first_stage() {
        let (run_loop, store) = run_loop(full_registry());
        let state = initial_state("thread_step");

        let step = run_loop.step(&state).await.unwrap();
        let Step::Progressed(snapshot) = step else {
            panic!("expected progress, got {step:?}");
        };

        assert_eq!(snapshot.source_stage, Some(StageId::TemplateIntake));
        assert_eq!(snapshot.state.completed_stages, vec![StageId::TemplateIntake]);
        assert_eq!(snapshot.state.current_stage, Some(StageId::TemplateIntake));
        assert_eq!(snapshot.state.status, RunStatus::InProgress);
        assert!(snapshot.state.started_at.is_some());
        assert_eq!(snapshot.state.stage_timings.len(), 1);
        assert_eq!(store.len("thread_step"), 1);
        // The input state is untouched.
        assert!(state.completed_stages.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_state_is_absorbing() {
        let (run_loop, store) = run_loop(full_registry());
        let mut state = initial_state("thread_done");
        state.status = RunStatus::Failed;

        let outcome = run_loop.run(state.clone()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Failed(state));
        assert_eq!(store.len("thread_done"), 0);
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_failure() {
        let registry = crate::testing::registry_with(vec![Arc::new(PanickingHandler::new(
            StageId::Extract,
            "index out of bounds",
        ))]);
        let (run_loop, _) = run_loop(registry);

        let outcome = run_loop.run(initial_state("thread_panic")).await.unwrap();
        let RunOutcome::Failed(state) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(state.failed_stages, vec![StageId::Extract]);
        assert!(state.errors[0].message.contains("index out of bounds"));
        assert!(!state.is_completed(StageId::Extract));
    }

    #[tokio::test]
    async fn test_pause_leaves_state_resumable() {
        let (run_loop, store) = run_loop(full_registry());
        run_loop.cancellation().cancel("operator pause");

        let state = initial_state("thread_pause");
        let outcome = run_loop.run(state.clone()).await.unwrap();

        assert_eq!(outcome, RunOutcome::Cancelled(state));
        assert!(outcome.is_resumable());
        assert_eq!(store.len("thread_pause"), 0);
    }

    #[tokio::test]
    async fn test_abort_records_synthetic_error() {
        let (run_loop, _) = run_loop(full_registry());
        let state = run_loop
            .step(&initial_state("thread_abort"))
            .await
            .map(|s| match s {
                Step::Progressed(snapshot) => snapshot.state,
                other => panic!("unexpected {other:?}"),
            })
            .unwrap();

        run_loop.cancellation().abort("operator abort");
        let outcome = run_loop.run(state).await.unwrap();
        let RunOutcome::Cancelled(state) = outcome else {
            panic!("expected cancellation");
        };

        assert_eq!(state.status, RunStatus::Failed);
        let error = state.last_error().unwrap();
        assert_eq!(error.stage, StageId::SourceIntake);
        assert_eq!(error.message, "cancelled: operator abort");
        assert!(state.failed_stages.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_does_not_commit() {
        let mut store = MockCheckpointStore::new();
        store
            .expect_append()
            .times(1)
            .returning(|_, _, _| Err(CheckpointError::Io(std::io::Error::other("disk full"))));

        let run_loop = RunLoop::new(Arc::new(full_registry()), Arc::new(store));
        let state = initial_state("thread_io");

        let err = run_loop.step(&state).await.unwrap_err();
        assert!(matches!(err, DeckflowError::Store(CheckpointError::Io(_))));
        assert!(state.completed_stages.is_empty());
    }

    #[tokio::test]
    async fn test_stream_yields_each_checkpoint_then_ends() {
        let (run_loop, store) = run_loop(full_registry());
        let snapshots: Vec<Snapshot> = run_loop
            .stream(initial_state("thread_stream"))
            .map(|item| item.unwrap())
            .collect()
            .await;

        // Nine stage transitions plus the completion record.
        assert_eq!(snapshots.len(), 10);
        assert_eq!(snapshots.last().map(|s| s.state.status), Some(RunStatus::Completed));
        assert_eq!(store.len("thread_stream"), 10);

        let sources: Vec<Option<StageId>> = snapshots.iter().map(|s| s.source_stage).collect();
        let mut expected: Vec<Option<StageId>> = StageId::ALL.iter().copied().map(Some).collect();
        expected.push(None);
        assert_eq!(sources, expected);
    }

    #[tokio::test]
    async fn test_stream_is_lazy() {
        let (run_loop, store) = run_loop(full_registry());
        let mut stream = Box::pin(run_loop.stream(initial_state("thread_lazy")));

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.source_stage, Some(StageId::TemplateIntake));
        drop(stream);

        assert_eq!(store.len("thread_lazy"), 1);
    }

    #[tokio::test]
    async fn test_events_for_failed_run() {
        let sink = Arc::new(CollectingEventSink::new());
        let registry = crate::testing::registry_with(vec![Arc::new(FailingHandler::new(
            StageId::TemplateIntake,
            "template missing",
        ))]);
        let run_loop = RunLoop::new(Arc::new(registry), Arc::new(InMemoryCheckpointStore::new()))
            .with_event_sink(sink.clone());

        run_loop.run(initial_state("thread_events")).await.unwrap();

        assert_eq!(
            sink.kinds(),
            vec![
                "run.started",
                "stage.started",
                "checkpoint.saved",
                "stage.failed",
                "run.failed",
            ]
        );
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
