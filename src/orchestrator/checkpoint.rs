use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::EngineConfig;
use crate::errors::CheckpointError;
use crate::util::write_atomic;
use crate::workflow::{ImplementationState, WorkflowContext};

/// Schema version written into every checkpoint. Bump on incompatible
/// changes to [`ImplementationState`].
pub const CHECKPOINT_VERSION: u32 = 1;

/// On-disk checkpoint envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub state: ImplementationState,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

/// Called by the orchestrator before every step.
pub trait CheckpointHook {
    fn checkpoint(&mut self, ctx: &WorkflowContext) -> Result<(), CheckpointError>;
}

/// Hook that persists nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCheckpoint;

impl CheckpointHook for NoopCheckpoint {
    fn checkpoint(&mut self, _ctx: &WorkflowContext) -> Result<(), CheckpointError> {
        Ok(())
    }
}

/// Single-file checkpoint for one issue run.
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the configured location for `issue` in `worktree`.
    pub fn for_issue(config: &EngineConfig, worktree: &Path, issue: u64) -> Self {
        Self::new(config.paths.checkpoint_in(worktree, issue))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Atomically replace the checkpoint with `state`.
    pub fn save(&self, state: &ImplementationState) -> Result<(), CheckpointError> {
        let record = CheckpointRecord {
            version: CHECKPOINT_VERSION,
            timestamp: Utc::now(),
            state: state.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&record).map_err(|source| {
            CheckpointError::Malformed {
                path: self.path.clone(),
                source,
            }
        })?;
        write_atomic(&self.path, &bytes).map_err(|source| CheckpointError::Write {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), stage = %state.current_stage, "checkpoint saved");
        Ok(())
    }

    /// Load the full record. Missing, malformed and other-version files are
    /// errors; nothing is defaulted.
    pub fn load_record(&self) -> Result<CheckpointRecord, CheckpointError> {
        let content = fs::read_to_string(&self.path).map_err(|source| {
            if source.kind() == ErrorKind::NotFound {
                CheckpointError::NotFound {
                    path: self.path.clone(),
                }
            } else {
                CheckpointError::Read {
                    path: self.path.clone(),
                    source,
                }
            }
        })?;

        let malformed = |source| CheckpointError::Malformed {
            path: self.path.clone(),
            source,
        };
        let header: VersionHeader = serde_json::from_str(&content).map_err(malformed)?;
        if header.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                found: header.version,
                expected: CHECKPOINT_VERSION,
            });
        }
        serde_json::from_str(&content).map_err(malformed)
    }

    pub fn load(&self) -> Result<ImplementationState, CheckpointError> {
        self.load_record().map(|record| record.state)
    }

    /// Load and check the checkpoint belongs to `issue` in `worktree`.
    pub fn resume(
        &self,
        issue: u64,
        worktree: &Path,
    ) -> Result<ImplementationState, CheckpointError> {
        let state = self.load()?;
        if state.issue != issue {
            return Err(CheckpointError::IssueMismatch {
                expected: issue,
                found: state.issue,
            });
        }
        if state.worktree != worktree {
            return Err(CheckpointError::WorktreeMismatch {
                expected: worktree.to_path_buf(),
                found: state.worktree,
            });
        }
        Ok(state)
    }
}

impl CheckpointHook for CheckpointStore {
    fn checkpoint(&mut self, ctx: &WorkflowContext) -> Result<(), CheckpointError> {
        self.save(&ctx.state)
    }
}
