use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::{Delta, DiffOptions, IndexAddOption, Repository, Signature};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::VersionControl;
use crate::config::{EngineConfig, PathsSection};
use crate::process::{CommandOutput, CommandRunner, args};

/// Git adapter: network and history-rewriting operations go through the git
/// CLI (so credentials and hooks behave as for a user); local inspection and
/// commits use `git2`.
pub struct GitCli {
    worktree: PathBuf,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    /// Worktree-relative prefixes never staged (engine scratch files).
    exclude_prefixes: Vec<PathBuf>,
}

impl GitCli {
    /// Adapter that keeps the default scratch paths out of commits.
    pub fn new(worktree: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            worktree: worktree.into(),
            runner,
            timeout,
            exclude_prefixes: PathsSection::default().scratch_prefixes(),
        }
    }

    /// Adapter using the configured command timeout and scratch paths.
    pub fn from_config(
        worktree: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        config: &EngineConfig,
    ) -> Self {
        Self::new(worktree, runner, config.timeouts.command())
            .with_excludes(config.paths.scratch_prefixes())
    }

    pub fn with_excludes(mut self, prefixes: Vec<PathBuf>) -> Self {
        self.exclude_prefixes = prefixes;
        self
    }

    fn open(&self) -> Result<Repository> {
        Repository::open(&self.worktree)
            .with_context(|| format!("Failed to open git repository at {}", self.worktree.display()))
    }

    async fn git(&self, argv: &[&str]) -> Result<CommandOutput> {
        let out = self
            .runner
            .run("git", &args(argv), &self.worktree, self.timeout)
            .await?;
        debug!(?argv, status = out.status, "git");
        Ok(out)
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.exclude_prefixes.iter().any(|p| path.starts_with(p))
    }
}

#[async_trait]
impl VersionControl for GitCli {
    fn worktree(&self) -> &Path {
        &self.worktree
    }

    async fn fetch(&self, remote: &str) -> Result<CommandOutput> {
        self.git(&["fetch", remote]).await
    }

    async fn rebase(&self, onto: &str) -> Result<CommandOutput> {
        self.git(&["rebase", onto]).await
    }

    async fn rebase_abort(&self) -> Result<CommandOutput> {
        self.git(&["rebase", "--abort"]).await
    }

    async fn current_branch(&self) -> Result<String> {
        let out = self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        if !out.success() {
            anyhow::bail!("Failed to read current branch: {}", out.stderr.trim());
        }
        let branch = out.stdout.trim().to_string();
        if branch.is_empty() || branch == "HEAD" {
            anyhow::bail!("Working copy is on a detached HEAD");
        }
        Ok(branch)
    }

    async fn push(&self, remote: &str, branch: &str) -> Result<CommandOutput> {
        self.git(&["push", "-u", remote, branch]).await
    }

    async fn push_with_lease(&self, remote: &str, branch: &str) -> Result<CommandOutput> {
        self.git(&["push", "--force-with-lease", "-u", remote, branch]).await
    }

    async fn has_remote(&self, name: &str) -> Result<bool> {
        let repo = self.open()?;
        let remotes = repo.remotes().context("Failed to list remotes")?;
        Ok(remotes.iter().flatten().any(|r| r == name))
    }

    async fn has_remote_branch(&self, remote: &str, branch: &str) -> Result<bool> {
        let repo = self.open()?;
        let refname = format!("refs/remotes/{}/{}", remote, branch);
        Ok(repo.find_reference(&refname).is_ok())
    }

    async fn commit_all(&self, message: &str) -> Result<Option<String>> {
        let repo = self.open()?;
        let mut index = repo.index()?;

        let mut skip = |path: &Path, _spec: &[u8]| -> i32 {
            if self.is_excluded(path) { 1 } else { 0 }
        };
        index.add_all(
            ["*"].iter(),
            IndexAddOption::DEFAULT,
            Some(&mut skip as &mut git2::IndexMatchedPath<'_>),
        )?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        if let Some(parent) = &parent
            && parent.tree_id() == tree_id
        {
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("issueflow", "issueflow@localhost"))?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        Ok(Some(commit_id.to_string()))
    }

    async fn head_changed_files(&self) -> Result<Vec<PathBuf>> {
        let repo = self.open()?;
        let Some(head) = repo.head().ok().and_then(|h| h.peel_to_commit().ok()) else {
            return Ok(Vec::new());
        };
        let new_tree = head.tree()?;
        let old_tree = match head.parent(0) {
            Ok(parent) => Some(parent.tree()?),
            Err(_) => None,
        };

        let mut opts = DiffOptions::new();
        let diff = repo.diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), Some(&mut opts))?;

        let mut files = Vec::new();
        for delta in diff.deltas() {
            match delta.status() {
                Delta::Added | Delta::Modified | Delta::Renamed | Delta::Copied => {
                    if let Some(path) = delta.new_file().path() {
                        files.push(path.to_path_buf());
                    }
                }
                _ => {}
            }
        }
        Ok(files)
    }

    async fn last_commit_summary(&self) -> Result<Option<String>> {
        let repo = self.open()?;
        let Some(head) = repo.head().ok().and_then(|h| h.peel_to_commit().ok()) else {
            return Ok(None);
        };
        let sha = head.id().to_string();
        let subject = head.summary().unwrap_or("").to_string();
        Ok(Some(format!("{} {}", &sha[..7], subject)))
    }
}
