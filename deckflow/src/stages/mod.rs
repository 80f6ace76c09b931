//! Stage handler trait and execution context.
//!
//! Handlers are the units of work the run loop schedules. Each handler
//! receives a read-only view of the run state and returns a delta; the loop
//! owns merging, timing and persistence.

mod result;

pub use result::StageError;

use crate::cancellation::CancellationToken;
use crate::core::StageId;
use crate::state::{RunState, StateDelta};
use async_trait::async_trait;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Trait for stage handlers.
///
/// A handler may have side effects (files, external calls) but is never
/// invoked twice for a stage already in `completed_stages`.
#[async_trait]
pub trait StageHandler: Send + Sync + Debug {
    /// Returns the stage this handler implements.
    fn stage(&self) -> StageId;

    /// Runs the stage.
    ///
    /// Scheduler-owned fields in the returned delta (`status`,
    /// `current_stage`, `completed_stages`, `failed_stages`, `completed_at`,
    /// `total_duration_seconds`) are discarded.
    async fn run(&self, state: &RunState, ctx: &StageContext) -> Result<StateDelta, StageError>;
}

/// Per-invocation context handed to a handler.
#[derive(Debug, Clone)]
pub struct StageContext {
    stage: StageId,
    workflow_id: String,
    thread_id: String,
    workspace_root: PathBuf,
    cancel: Arc<CancellationToken>,
}

impl StageContext {
    /// Creates a new context.
    #[must_use]
    pub fn new(
        stage: StageId,
        workflow_id: impl Into<String>,
        thread_id: impl Into<String>,
        workspace_root: impl Into<PathBuf>,
        cancel: Arc<CancellationToken>,
    ) -> Self {
        Self {
            stage,
            workflow_id: workflow_id.into(),
            thread_id: thread_id.into(),
            workspace_root: workspace_root.into(),
            cancel,
        }
    }

    /// Returns the stage being run.
    #[must_use]
    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Returns the workflow id.
    #[must_use]
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Returns the thread id.
    #[must_use]
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Returns the configured workspace root. The scheduler never reads it.
    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Returns `<workspace_root>/<workflow_id>/<stage dir>`.
    #[must_use]
    pub fn stage_dir(&self) -> PathBuf {
        self.workspace_root
            .join(&self.workflow_id)
            .join(self.stage.workspace_dir())
    }

    /// Returns true once cancellation of the run has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns the shared cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }
}

/// A handler backed by a closure.
pub struct FnHandler<F>
where
    F: Fn(&RunState, &StageContext) -> Result<StateDelta, StageError> + Send + Sync,
{
    stage: StageId,
    func: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&RunState, &StageContext) -> Result<StateDelta, StageError> + Send + Sync,
{
    /// Creates a new function-based handler.
    pub fn new(stage: StageId, func: F) -> Self {
        Self { stage, func }
    }
}

impl<F> Debug for FnHandler<F>
where
    F: Fn(&RunState, &StageContext) -> Result<StateDelta, StageError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler")
            .field("stage", &self.stage)
            .finish()
    }
}

#[async_trait]
impl<F> StageHandler for FnHandler<F>
where
    F: Fn(&RunState, &StageContext) -> Result<StateDelta, StageError> + Send + Sync,
{
    fn stage(&self) -> StageId {
        self.stage
    }

    async fn run(&self, state: &RunState, ctx: &StageContext) -> Result<StateDelta, StageError> {
        (self.func)(state, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(stage: StageId) -> StageContext {
        StageContext::new(stage, "workflow_1", "thread_1", "outputs", Arc::new(CancellationToken::new()))
    }

    #[tokio::test]
    async fn test_fn_handler() {
        let handler = FnHandler::new(StageId::Outline, |state, _ctx| {
            Ok(StateDelta::new().with_outline(format!("# {}", state.output_name)))
        });
        assert_eq!(handler.stage(), StageId::Outline);

        let state = RunState::new("workflow_1", "thread_1", "t", "s", "Quarterly", "outputs/workflow_1");
        let delta = handler.run(&state, &ctx(StageId::Outline)).await.unwrap();
        assert_eq!(delta.outline.as_deref(), Some("# Quarterly"));
    }

    #[tokio::test]
    async fn test_fn_handler_error() {
        let handler = FnHandler::new(StageId::Analyze, |_, _| Err(StageError::new("quota exceeded")));
        let state = RunState::new("w", "t", "a", "b", "c", "d");
        let err = handler.run(&state, &ctx(StageId::Analyze)).await.unwrap_err();
        assert_eq!(err.message, "quota exceeded");
    }

    #[test]
    fn test_context_paths_and_cancellation() {
        let ctx = ctx(StageId::Finalize);
        assert_eq!(ctx.workspace_root(), Path::new("outputs"));
        assert_eq!(
            ctx.stage_dir(),
            Path::new("outputs").join("workflow_1").join(StageId::Finalize.workspace_dir())
        );
        assert!(!ctx.is_cancelled());
        ctx.cancellation().cancel("stop");
        assert!(ctx.is_cancelled());
    }
}
