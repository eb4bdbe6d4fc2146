//! Version-control and issue-tracker collaborators.
//!
//! Kernels depend only on the [`VersionControl`] and [`IssueTracker`] traits.
//! [`git::GitCli`] and [`github::GhCli`] are the production adapters; success
//! and failure come back as exit status plus captured output, which the
//! kernels inspect for known substrings.

pub mod git;
pub mod github;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::TrackerError;
use crate::process::CommandOutput;

pub use git::GitCli;
pub use github::GhCli;

#[async_trait]
pub trait VersionControl: Send + Sync {
    fn worktree(&self) -> &Path;

    async fn fetch(&self, remote: &str) -> Result<CommandOutput>;

    /// Rebase the current branch onto `onto` (e.g. `origin/main`).
    async fn rebase(&self, onto: &str) -> Result<CommandOutput>;

    async fn rebase_abort(&self) -> Result<CommandOutput>;

    async fn current_branch(&self) -> Result<String>;

    async fn push(&self, remote: &str, branch: &str) -> Result<CommandOutput>;

    /// Replace the remote branch after a history rewrite, refusing if it
    /// moved since it was last fetched.
    async fn push_with_lease(&self, remote: &str, branch: &str) -> Result<CommandOutput>;

    async fn has_remote(&self, name: &str) -> Result<bool>;

    async fn has_remote_branch(&self, remote: &str, branch: &str) -> Result<bool>;

    /// Stage every change and commit it. `None` when there was nothing to commit.
    async fn commit_all(&self, message: &str) -> Result<Option<String>>;

    /// Files added or modified by the HEAD commit, relative to the worktree.
    async fn head_changed_files(&self) -> Result<Vec<PathBuf>>;

    /// One-line summary of HEAD (`<short sha> <subject>`), if any commit exists.
    async fn last_commit_summary(&self) -> Result<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueDetails {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Identifier and URL of something the tracker created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedItem {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrRequest {
    pub title: String,
    pub body: String,
    pub base: String,
    pub head: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueEdit {
    pub title: Option<String>,
    pub body: Option<String>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrEdit {
    pub title: Option<String>,
    pub body: Option<String>,
}

/// Aggregate state of a PR's CI checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    None,
    Pending,
    Passing,
    Failing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrStatus {
    pub number: u64,
    pub url: String,
    pub state: String,
    pub merge_state: String,
    pub checks: CheckStatus,
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn view_issue(&self, number: u64) -> Result<IssueDetails, TrackerError>;

    async fn create_issue(
        &self,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<CreatedItem, TrackerError>;

    async fn edit_issue(&self, number: u64, edit: &IssueEdit) -> Result<(), TrackerError>;

    async fn create_pr(&self, request: &PrRequest) -> Result<CreatedItem, TrackerError>;

    async fn view_pr(&self, number: u64) -> Result<PrStatus, TrackerError>;

    async fn edit_pr(&self, number: u64, edit: &PrEdit) -> Result<(), TrackerError>;
}

/// Pick the push remote: `upstream` when configured, otherwise `origin`.
pub async fn detect_remote(vcs: &dyn VersionControl) -> Result<String> {
    for candidate in ["upstream", "origin"] {
        if vcs.has_remote(candidate).await? {
            return Ok(candidate.to_string());
        }
    }
    anyhow::bail!("No 'upstream' or 'origin' remote configured")
}

/// Pick the base branch on `remote`: `master` when present, otherwise `main`.
pub async fn detect_base(vcs: &dyn VersionControl, remote: &str) -> Result<String> {
    if vcs.has_remote_branch(remote, "master").await? {
        Ok("master".to_string())
    } else {
        Ok("main".to_string())
    }
}
