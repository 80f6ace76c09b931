//! Scheduling: dependency resolution, the stage registry and the run loop.

mod registry;
mod resolver;
mod run_loop;


pub use registry::{StageRegistry, StageRegistryBuilder};
pub use resolver::{next_stage, DependencyTable, NextStage};
pub use run_loop::{RunLoop, RunOutcome, Snapshot, Step};
