//! Iterative issue-resolution workflow engine.
//!
//! An issue is driven through `impl → review → pr → finish` (with a `rebase`
//! detour and `fatal` as the other terminal) by an explicit state machine.
//! Each non-terminal stage has a [`kernels::StageKernel`]; the
//! [`orchestrator::Orchestrator`] runs them one at a time, consults the
//! [`workflow::TransitionTable`] for the next stage and checkpoints the
//! [`workflow::ImplementationState`] before every step.

pub mod backend;
pub mod config;
pub mod errors;
pub mod gates;
pub mod kernels;
pub mod logging;
pub mod orchestrator;
pub mod process;
pub mod review;
pub mod tracker;
pub mod util;
pub mod workflow;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use config::EngineConfig;
pub use errors::{
    CheckpointError, CommandError, ConfigError, PipelineError, TableError, TrackerError,
    TransitionError, WorkflowError,
};
pub use orchestrator::{Orchestrator, RunOutcome, RunRequest, run_issue};
pub use workflow::{Event, FinalStatus, ImplementationState, Stage, WorkflowContext};
