//! Engine configuration.
//!
//! Read from a TOML file whose location the caller decides; every field has a
//! default so an empty file (or no file) is a valid configuration. Values are
//! layered file → environment:
//!
//! ```toml
//! [workflow]
//! max_iterations = 10
//! max_reviews = 8
//! max_steps = 100
//! review_enabled = true
//!
//! [models.impl]
//! provider = "claude"
//! model = "sonnet"
//!
//! [models.review]
//! provider = "claude"
//! model = "opus"
//!
//! [git]
//! remote = "origin"   # detected when omitted
//! base = "main"       # detected when omitted
//!
//! [tracker]
//! pr_label = "has-pr"          # added to the issue once its PR is open
//! report_fatal = false         # open a follow-up issue when a run fails
//! fatal_labels = ["issueflow"]
//!
//! [parse_gate]
//! extensions = ["py"]
//! command = ["python3", "-m", "py_compile"]
//! timeout_secs = 120
//!
//! [timeouts]
//! generation_secs = 1800
//! command_secs = 300
//!
//! [paths]
//! artifact_dir = ".tmp/issueflow"
//! finalize = ".tmp/finalize.txt"
//! commit_report_dir = ".tmp"
//! checkpoint = ".tmp/issueflow/checkpoint-issue-{issue}.json"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::ModelSelector;
use crate::errors::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workflow: WorkflowSection,
    pub models: ModelsSection,
    pub git: GitSection,
    pub tracker: TrackerSection,
    pub parse_gate: ParseGateConfig,
    pub timeouts: TimeoutsSection,
    pub paths: PathsSection,
    pub backend: BackendSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    pub max_iterations: u32,
    pub max_reviews: u32,
    /// Global backstop against transition cycles.
    pub max_steps: u32,
    pub review_enabled: bool,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_reviews: 8,
            max_steps: 100,
            review_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsSection {
    #[serde(rename = "impl")]
    pub impl_model: ModelSelector,
    #[serde(rename = "review")]
    pub review_model: ModelSelector,
}

impl Default for ModelsSection {
    fn default() -> Self {
        Self {
            impl_model: ModelSelector::new("claude", "sonnet"),
            review_model: ModelSelector::new("claude", "opus"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSection {
    pub remote: Option<String>,
    pub base: Option<String>,
}

/// What the engine tells the tracker once a run ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSection {
    /// Label added to the issue after its pull request is open.
    pub pr_label: Option<String>,
    /// Open a follow-up issue carrying the fatal reason.
    pub report_fatal: bool,
    pub fatal_labels: Vec<String>,
}

/// Settings for the deterministic syntax check that gates the impl stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseGateConfig {
    /// File extensions (without the dot) the checker understands.
    pub extensions: Vec<String>,
    /// Checker program and leading arguments; file paths are appended.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ParseGateConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["py".to_string()],
            command: vec![
                "python3".to_string(),
                "-m".to_string(),
                "py_compile".to_string(),
            ],
            timeout_secs: 120,
        }
    }
}

impl ParseGateConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    pub generation_secs: u64,
    pub command_secs: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            generation_secs: 1800,
            command_secs: 300,
        }
    }
}

impl TimeoutsSection {
    pub fn generation(&self) -> Duration {
        Duration::from_secs(self.generation_secs)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }
}

/// Placeholder in [`PathsSection::checkpoint`] replaced by the issue number.
pub const ISSUE_PLACEHOLDER: &str = "{issue}";

/// Paths inside the working copy, relative unless absolute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub artifact_dir: PathBuf,
    pub finalize: PathBuf,
    pub commit_report_dir: PathBuf,
    /// Checkpoint file; `{issue}` becomes the issue number.
    pub checkpoint: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from(".tmp/issueflow"),
            finalize: PathBuf::from(".tmp/finalize.txt"),
            commit_report_dir: PathBuf::from(".tmp"),
            checkpoint: PathBuf::from(".tmp/issueflow/checkpoint-issue-{issue}.json"),
        }
    }
}

impl PathsSection {
    pub fn artifact_dir_in(&self, worktree: &Path) -> PathBuf {
        worktree.join(&self.artifact_dir)
    }

    pub fn finalize_in(&self, worktree: &Path) -> PathBuf {
        worktree.join(&self.finalize)
    }

    /// Commit-message artifact for one impl iteration.
    pub fn commit_report_in(&self, worktree: &Path, iteration: u32) -> PathBuf {
        worktree
            .join(&self.commit_report_dir)
            .join(format!("commit-report-iter-{}.txt", iteration))
    }

    /// Checkpoint file for an issue run.
    pub fn checkpoint_in(&self, worktree: &Path, issue: u64) -> PathBuf {
        let template = self.checkpoint.to_string_lossy();
        worktree.join(template.replace(ISSUE_PLACEHOLDER, &issue.to_string()))
    }

    /// Worktree-relative locations of engine scratch files, which must never
    /// be committed. Absolute paths live outside the working copy and are
    /// left out.
    pub fn scratch_prefixes(&self) -> Vec<PathBuf> {
        // Nearest ancestor of the checkpoint template that is the same for
        // every issue.
        let checkpoint = self
            .checkpoint
            .ancestors()
            .find(|p| !p.as_os_str().is_empty() && !p.to_string_lossy().contains(ISSUE_PLACEHOLDER));
        let mut prefixes: Vec<PathBuf> = Vec::new();
        for path in [
            Some(self.artifact_dir.as_path()),
            Some(self.finalize.as_path()),
            Some(self.commit_report_dir.as_path()),
            checkpoint,
        ]
        .into_iter()
        .flatten()
        {
            if path.is_relative()
                && !path.as_os_str().is_empty()
                && !prefixes.iter().any(|p| p == path)
            {
                prefixes.push(path.to_path_buf());
            }
        }
        prefixes
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    pub claude_cmd: String,
    pub skip_permissions: bool,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            claude_cmd: "claude".to_string(),
            skip_permissions: true,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse the file at `path` and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `CLAUDE_CMD`, `SKIP_PERMISSIONS` and `ISSUEFLOW_MAX_ITERATIONS`.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(cmd) = lookup("CLAUDE_CMD") {
            self.backend.claude_cmd = cmd;
        }
        if let Some(skip) = lookup("SKIP_PERMISSIONS") {
            self.backend.skip_permissions = skip != "false";
        }
        if let Some(raw) = lookup("ISSUEFLOW_MAX_ITERATIONS") {
            self.workflow.max_iterations =
                raw.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "ISSUEFLOW_MAX_ITERATIONS".to_string(),
                    message: format!("'{}' is not a positive integer", raw),
                })?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workflow.max_iterations == 0 {
            return Err(invalid("workflow.max_iterations", "must be at least 1"));
        }
        if self.workflow.max_steps == 0 {
            return Err(invalid("workflow.max_steps", "must be at least 1"));
        }
        if self.parse_gate.command.is_empty() {
            return Err(invalid("parse_gate.command", "must name a program"));
        }
        if self.paths.checkpoint.file_name().is_none() {
            return Err(invalid("paths.checkpoint", "must name a file"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
