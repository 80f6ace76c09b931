//! # Deckflow
//!
//! A durable, resumable scheduler for the nine-stage deck generation
//! pipeline.
//!
//! Deckflow drives a fixed sequence of stages (template intake, source
//! intake, extraction, analysis, outlining, rearrangement, inventory,
//! replacement and finalization) with support for:
//!
//! - **Dependency resolution**: the next stage is the earliest incomplete one
//!   whose prerequisites are done
//! - **Checkpointing**: every transition appends an immutable snapshot, in
//!   memory or on disk
//! - **Resumption**: any checkpoint can be reloaded and driven forward
//! - **Interrupts and cancellation**: pause before chosen stages, or stop a
//!   running loop cooperatively
//! - **Event emission**: lifecycle events for monitoring
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use deckflow::prelude::*;
//!
//! let registry = StageRegistry::builder()
//!     .handler(Arc::new(TemplateIntake::new()))?
//!     // ... one handler per stage
//!     .build()?;
//!
//! let service = RunService::new(Arc::new(registry), StoreConfig::from_env().open());
//! let (handle, outcome) = service
//!     .start(NewRun::new("template.pptx", "source.docx", "Quarterly"))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod service;
pub mod stages;
pub mod state;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancelMode, CancellationToken};
    pub use crate::config::{RunConfig, StoreBackend, StoreConfig};
    pub use crate::core::{RunStatus, StageId, StageKind};
    pub use crate::errors::{
        CheckpointError, ContractErrorInfo, CycleDetectedError, DeckflowError,
        PipelineValidationError,
    };
    pub use crate::events::{EventKind, EventSink, LoggingEventSink, NoOpEventSink, RunEvent};
    pub use crate::observability::{init_logging, LogFormat};
    pub use crate::pipeline::{
        DependencyTable, NextStage, RunLoop, RunOutcome, Snapshot, StageRegistry,
    };
    pub use crate::service::{CheckpointSummary, NewRun, RunHandle, RunService, RunStatusView};
    pub use crate::stages::{FnHandler, StageContext, StageError, StageHandler};
    pub use crate::state::{RunState, StateDelta};
    pub use crate::store::{
        Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
    };
    pub use crate::utils::{iso_timestamp, Timestamp};
}
