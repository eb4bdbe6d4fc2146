//! Typed error hierarchy for the issueflow engine.
//!
//! One enum per subsystem:
//! - `TransitionError` / `TableError`: transition lookup and startup validation
//! - `CheckpointError`: checkpoint load/save and resume checks
//! - `PipelineError`: generation backend failures
//! - `CommandError`: shell command plumbing
//! - `TrackerError`: issue/PR tracker calls
//! - `WorkflowError`: orchestrator construction and run failures
//! - `ConfigError`: engine configuration

use std::path::PathBuf;

use thiserror::Error;

use crate::workflow::{Event, Stage};

/// Errors from a transition table lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("No transitions defined for stage '{stage}'")]
    UnknownStage { stage: Stage },

    #[error("No transition for event '{event}' from stage '{stage}'")]
    UnknownEvent { stage: Stage, event: Event },

    #[error("Unknown stage name '{0}'")]
    UnknownStageName(String),

    #[error("Unknown event name '{0}'")]
    UnknownEventName(String),
}

/// Errors found while validating a transition table at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("Transition table is missing required edge ({stage}, {event})")]
    MissingEdge { stage: Stage, event: Event },

    #[error("Transition ({stage}, {event}) leaves terminal stage '{stage}'")]
    TerminalSource { stage: Stage, event: Event },

    #[error("Transition ({stage}, {event}) -> {next} does not match required target {expected}")]
    WrongTarget {
        stage: Stage,
        event: Event,
        next: Stage,
        expected: Stage,
    },

    #[error("Kernel for stage '{stage}' can emit '{event}' but the table has no such edge")]
    UnroutedEmission { stage: Stage, event: Event },

    #[error("Kernel registered for terminal stage '{0}'")]
    TerminalKernel(Stage),
}

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint not found at {path}")]
    NotFound { path: PathBuf },

    #[error("Failed to read checkpoint at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write checkpoint at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed checkpoint at {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Checkpoint schema version {found} does not match expected version {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("Checkpoint is for issue #{found}, but issue #{expected} was requested")]
    IssueMismatch { expected: u64, found: u64 },

    #[error("Checkpoint working copy {found} does not match requested {expected}")]
    WorktreeMismatch { expected: PathBuf, found: PathBuf },
}

/// Errors from the generation backend.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unsupported generation provider '{0}'")]
    UnsupportedProvider(String),

    #[error("Failed to spawn generation backend '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Generation backend timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Generation backend exited with code {exit_code}: {stderr}")]
    NonZeroExit { exit_code: i32, stderr: String },

    #[error("Generation backend reported an error: {0}")]
    Reported(String),

    #[error("Failed to write generation output at {path}: {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' timed out after {secs}s")]
    Timeout { program: String, secs: u64 },
}

/// Errors from the issue/PR tracker collaborator.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The tracker rejected the request. The message is the raw error text,
    /// which callers inspect for known failure signatures.
    #[error("Tracker request failed: {0}")]
    Rejected(String),

    #[error("Failed to parse tracker response: {0}")]
    Parse(String),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Errors from constructing or running the orchestrator.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid transition wiring: {0}")]
    Table(#[from] TableError),

    #[error("Checkpoint failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Failed to write fatal report at {path}: {source}")]
    Report {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to scan artifact directory {path}: {source}")]
    Artifacts {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load issue #{issue}: {source}")]
    Issue {
        issue: u64,
        #[source]
        source: TrackerError,
    },
}

/// Errors from loading the engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_errors_are_distinguishable() {
        let stage_err = TransitionError::UnknownStage {
            stage: Stage::Finish,
        };
        let event_err = TransitionError::UnknownEvent {
            stage: Stage::Impl,
            event: Event::PrPass,
        };
        assert!(matches!(stage_err, TransitionError::UnknownStage { .. }));
        assert!(matches!(event_err, TransitionError::UnknownEvent { .. }));
        assert_ne!(stage_err, event_err);
        assert!(event_err.to_string().contains("pr_pass"));
        assert!(event_err.to_string().contains("impl"));
    }

    #[test]
    fn table_error_missing_edge_names_pair() {
        let err = TableError::MissingEdge {
            stage: Stage::Rebase,
            event: Event::RebaseConflict,
        };
        let msg = err.to_string();
        assert!(msg.contains("rebase"));
        assert!(msg.contains("rebase_conflict"));
    }

    #[test]
    fn checkpoint_version_mismatch_carries_versions() {
        let err = CheckpointError::VersionMismatch {
            found: 1,
            expected: 2,
        };
        match &err {
            CheckpointError::VersionMismatch { found, expected } => {
                assert_eq!(*found, 1);
                assert_eq!(*expected, 2);
            }
            _ => panic!("Expected VersionMismatch"),
        }
        assert!(err.to_string().contains("version 1"));
    }

    #[test]
    fn workflow_error_converts_from_table_error() {
        let inner = TableError::TerminalKernel(Stage::Finish);
        let err: WorkflowError = inner.into();
        assert!(matches!(
            err,
            WorkflowError::Table(TableError::TerminalKernel(Stage::Finish))
        ));
    }

    #[test]
    fn tracker_error_converts_from_command_error() {
        let inner = CommandError::Timeout {
            program: "gh".into(),
            secs: 30,
        };
        let err: TrackerError = inner.into();
        assert!(err.to_string().contains("gh"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&TransitionError::UnknownStageName("x".into()));
        assert_std_error(&TableError::TerminalKernel(Stage::Fatal));
        assert_std_error(&CheckpointError::VersionMismatch {
            found: 0,
            expected: 1,
        });
        assert_std_error(&PipelineError::Timeout { secs: 1 });
        assert_std_error(&TrackerError::Rejected("x".into()));
    }
}
