//! Workflow state model and transition table.
//!
//! - [`stage`]: the fixed stage and event vocabulary
//! - [`state`]: the checkpointed `ImplementationState` and its history
//! - [`context`]: the per-run `WorkflowContext` and kernel `StageResult`
//! - [`transitions`]: the `(stage, event) -> stage` table and its validation

pub mod context;
pub mod stage;
pub mod state;
pub mod transitions;

pub use context::{FinalStatus, StageResult, Tunables, WorkflowContext};
pub use stage::{Event, Stage};
pub use state::{ImplementationState, RetryCounters, StageRecord};
pub use transitions::{REQUIRED_EDGES, TransitionTable, next_stage, validate_transition_table};
