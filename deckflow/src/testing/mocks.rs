//! Mock stage handlers for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::core::StageId;
use crate::stages::{StageContext, StageError, StageHandler};
use crate::state::{MessageRole, RunState, StateDelta};

/// Shared, ordered record of handler invocations across a registry.
pub type CallLog = Arc<Mutex<Vec<StageId>>>;

/// The artifact each mock stage reports, keyed the way real stages name them.
#[must_use]
pub fn artifact_name(stage: StageId) -> &'static str {
    match stage {
        StageId::TemplateIntake => "template_metadata",
        StageId::SourceIntake => "source_markdown",
        StageId::Extract => "template_inventory",
        StageId::Analyze => "template_analysis",
        StageId::Outline => "outline_md",
        StageId::Rearrange => "rearranged_pptx",
        StageId::Inventory => "text_inventory",
        StageId::Replacements => "replacement_text",
        StageId::Finalize => crate::service::FINAL_OUTPUT_ARTIFACT,
    }
}

/// A handler that succeeds with a plausible delta and records each call.
#[derive(Debug)]
pub struct RecordingHandler {
    stage: StageId,
    calls: Mutex<usize>,
    log: Option<CallLog>,
}

impl RecordingHandler {
    /// Creates a new recording handler.
    #[must_use]
    pub fn new(stage: StageId) -> Self {
        Self {
            stage,
            calls: Mutex::new(0),
            log: None,
        }
    }

    /// Also appends each call to a shared log.
    #[must_use]
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Returns the number of times the handler ran.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl StageHandler for RecordingHandler {
    fn stage(&self) -> StageId {
        self.stage
    }

    async fn run(&self, state: &RunState, ctx: &StageContext) -> Result<StateDelta, StageError> {
        *self.calls.lock() += 1;
        if let Some(log) = &self.log {
            log.lock().push(self.stage);
        }

        let location = match self.stage {
            StageId::Finalize => format!(
                "{}/{}/{}.pptx",
                state.workspace_dir,
                self.stage.workspace_dir(),
                state.output_name
            ),
            _ => ctx.stage_dir().join(artifact_name(self.stage)).display().to_string(),
        };
        let delta = StateDelta::new()
            .with_artifact(artifact_name(self.stage), location)
            .with_message(MessageRole::Assistant, format!("{} done", self.stage.label()));

        Ok(match self.stage {
            StageId::TemplateIntake => {
                delta.with_template_metadata(serde_json::json!({ "slide_count": 12 }))
            }
            StageId::SourceIntake => delta.with_source_text("# Source\n\nQuarterly results."),
            StageId::Extract => delta.with_template_inventory("| slide | layout |"),
            StageId::Outline => delta.with_outline("# Deck\n## Results"),
            StageId::Rearrange => delta.with_slide_mapping(vec![0, 3, 3, 7]),
            StageId::Inventory => {
                delta.with_text_inventory(serde_json::json!({ "slide-0": { "shape-0": "Title" } }))
            }
            StageId::Replacements => {
                delta.with_replacement_text(serde_json::json!({ "slide-0": { "shape-0": "Results" } }))
            }
            StageId::Analyze | StageId::Finalize => delta,
        })
    }
}

/// A handler that always returns an error.
#[derive(Debug)]
pub struct FailingHandler {
    stage: StageId,
    error: String,
}

impl FailingHandler {
    /// Creates a new failing handler.
    #[must_use]
    pub fn new(stage: StageId, error: impl Into<String>) -> Self {
        Self {
            stage,
            error: error.into(),
        }
    }
}

#[async_trait]
impl StageHandler for FailingHandler {
    fn stage(&self) -> StageId {
        self.stage
    }

    async fn run(&self, _state: &RunState, _ctx: &StageContext) -> Result<StateDelta, StageError> {
        Err(StageError::for_stage(self.stage, &self.error))
    }
}

/// A handler that panics.
#[derive(Debug)]
pub struct PanickingHandler {
    stage: StageId,
    message: String,
}

impl PanickingHandler {
    /// Creates a new panicking handler.
    #[must_use]
    pub fn new(stage: StageId, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

#[async_trait]
impl StageHandler for PanickingHandler {
    fn stage(&self) -> StageId {
        self.stage
    }

    async fn run(&self, _state: &RunState, _ctx: &StageContext) -> Result<StateDelta, StageError> {
        panic!("{}", self.message);
    }
}

/// A handler that trips the run's cancellation token while it runs, then
/// succeeds.
#[derive(Debug)]
pub struct CancellingHandler {
    stage: StageId,
    reason: String,
    abort: bool,
}

impl CancellingHandler {
    /// Requests a pause during the stage.
    #[must_use]
    pub fn pause(stage: StageId, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
            abort: false,
        }
    }

    /// Requests an abort during the stage.
    #[must_use]
    pub fn abort(stage: StageId, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
            abort: true,
        }
    }
}

#[async_trait]
impl StageHandler for CancellingHandler {
    fn stage(&self) -> StageId {
        self.stage
    }

    async fn run(&self, _state: &RunState, ctx: &StageContext) -> Result<StateDelta, StageError> {
        if self.abort {
            ctx.cancellation().abort(&self.reason);
        } else {
            ctx.cancellation().cancel(&self.reason);
        }
        Ok(StateDelta::new().with_artifact(artifact_name(self.stage), "partial"))
    }
}

/// A handler that sleeps before succeeding.
#[derive(Debug)]
pub struct SlowHandler {
    stage: StageId,
    delay: Duration,
}

impl SlowHandler {
    /// Creates a slow handler with delay in milliseconds.
    #[must_use]
    pub fn with_delay_ms(stage: StageId, ms: u64) -> Self {
        Self {
            stage,
            delay: Duration::from_millis(ms),
        }
    }
}

#[async_trait]
impl StageHandler for SlowHandler {
    fn stage(&self) -> StageId {
        self.stage
    }

    async fn run(&self, _state: &RunState, _ctx: &StageContext) -> Result<StateDelta, StageError> {
        tokio::time::sleep(self.delay).await;
        Ok(StateDelta::new().with_artifact(artifact_name(self.stage), "slow"))
    }
}
