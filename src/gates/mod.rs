//! Deterministic syntax gate run after every impl commit.
//!
//! Only files touched by the HEAD commit are checked, filtered by extension and
//! by existence (deleted or renamed-away paths are skipped). With nothing left
//! to check the gate passes trivially.

use anyhow::Result;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::{debug, info};

use crate::config::ParseGateConfig;
use crate::errors::CommandError;
use crate::process::CommandRunner;
use crate::tracker::VersionControl;
use crate::util::truncate_chars;

static FILE_REF_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"File "([^"]+)""#).unwrap());

const MAX_DIAGNOSTIC_CHARS: usize = 4000;

/// Outcome of one gate run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateReport {
    pub passed: bool,
    /// Worktree-relative files handed to the checker.
    pub checked_files: Vec<PathBuf>,
    pub offending_files: Vec<PathBuf>,
    /// Raw checker output, truncated.
    pub diagnostics: String,
}

impl GateReport {
    fn trivial() -> Self {
        Self {
            passed: true,
            checked_files: Vec::new(),
            offending_files: Vec::new(),
            diagnostics: String::new(),
        }
    }

    /// Feedback for the next impl prompt.
    pub fn feedback(&self) -> String {
        let files: Vec<String> = self
            .offending_files
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        format!(
            "Syntax check failed for: {}\n\n{}",
            files.join(", "),
            self.diagnostics.trim()
        )
    }
}

pub struct ParseGate {
    config: ParseGateConfig,
}

impl ParseGate {
    pub fn new(config: ParseGateConfig) -> Self {
        Self { config }
    }

    fn wants(&self, path: &std::path::Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.config.extensions.iter().any(|e| e == ext))
    }

    /// Check the files changed by HEAD. Errors only when the checker cannot be
    /// started; a checker timeout counts as a failed check.
    pub async fn check(
        &self,
        vcs: &dyn VersionControl,
        runner: &dyn CommandRunner,
    ) -> Result<GateReport> {
        let worktree = vcs.worktree().to_path_buf();
        let checked_files: Vec<PathBuf> = vcs
            .head_changed_files()
            .await?
            .into_iter()
            .filter(|p| self.wants(p) && worktree.join(p).is_file())
            .collect();

        if checked_files.is_empty() {
            debug!("parse gate: no matching files in HEAD, passing");
            return Ok(GateReport::trivial());
        }

        let Some((program, leading)) = self.config.command.split_first() else {
            anyhow::bail!("parse_gate.command is empty");
        };
        let mut argv = leading.to_vec();
        argv.extend(checked_files.iter().map(|p| p.display().to_string()));

        let output = match runner
            .run(program, &argv, &worktree, self.config.timeout())
            .await
        {
            Ok(output) => output,
            Err(CommandError::Timeout { secs, .. }) => {
                return Ok(GateReport {
                    passed: false,
                    offending_files: checked_files.clone(),
                    checked_files,
                    diagnostics: format!("Syntax checker timed out after {}s", secs),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let diagnostics = output.combined();
        let passed = output.success();
        let offending_files = if passed {
            Vec::new()
        } else {
            offending_files(&checked_files, &diagnostics)
        };
        info!(
            checked = checked_files.len(),
            offending = offending_files.len(),
            passed,
            "parse gate finished"
        );
        Ok(GateReport {
            passed,
            checked_files,
            offending_files,
            diagnostics: truncate_chars(&diagnostics, MAX_DIAGNOSTIC_CHARS),
        })
    }
}

/// Files named in checker output, via `File "<path>"` references or plain
/// mentions of a checked path. Falls back to every checked file when the
/// output names none of them.
pub fn offending_files(checked: &[PathBuf], diagnostics: &str) -> Vec<PathBuf> {
    let mut hits = BTreeSet::new();
    for cap in FILE_REF_REGEX.captures_iter(diagnostics) {
        if let Some(m) = cap.get(1) {
            let referenced = PathBuf::from(m.as_str());
            if let Some(file) = checked.iter().find(|c| referenced.ends_with(c)) {
                hits.insert(file.clone());
            }
        }
    }
    for file in checked {
        if diagnostics.contains(&file.display().to_string()) {
            hits.insert(file.clone());
        }
    }
    if hits.is_empty() {
        return checked.to_vec();
    }
    // Keep checker order.
    checked.iter().filter(|c| hits.contains(*c)).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{CommandOutput, ShellRunner};
    use crate::test_support::{FakeVcs, ScriptedRunner};
    use std::fs;
    use tempfile::tempdir;

    fn config() -> ParseGateConfig {
        ParseGateConfig::default()
    }

    #[tokio::test]
    async fn test_no_matching_files_passes_without_running_checker() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("README.md"), "docs").unwrap();
        let vcs = FakeVcs::new(dir.path()).with_changed_files(vec!["README.md", "gone.py"]);
        let runner = ScriptedRunner::new(vec![]);

        let report = ParseGate::new(config()).check(&vcs, &runner).await.unwrap();
        assert!(report.passed);
        assert!(report.checked_files.is_empty());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_checker_receives_exactly_the_changed_files() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("pkg")).unwrap();
        fs::write(dir.path().join("pkg/a.py"), "x = 1\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "n").unwrap();
        let vcs = FakeVcs::new(dir.path()).with_changed_files(vec!["pkg/a.py", "notes.txt"]);
        let runner = ScriptedRunner::new(vec![CommandOutput::ok("")]);

        let report = ParseGate::new(config()).check(&vcs, &runner).await.unwrap();
        assert!(report.passed);
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "python3");
        assert_eq!(calls[0].1, vec!["-m", "py_compile", "pkg/a.py"]);
    }

    #[tokio::test]
    async fn test_failure_names_offending_file_from_traceback() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        fs::write(dir.path().join("b.py"), "def (:\n").unwrap();
        let vcs = FakeVcs::new(dir.path()).with_changed_files(vec!["a.py", "b.py"]);
        let runner = ScriptedRunner::new(vec![CommandOutput::failed(
            1,
            "  File \"b.py\", line 1\n    def (:\n        ^\nSyntaxError: invalid syntax\n",
        )]);

        let report = ParseGate::new(config()).check(&vcs, &runner).await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.offending_files, vec![PathBuf::from("b.py")]);
        assert!(report.feedback().contains("b.py"));
        assert!(report.feedback().contains("SyntaxError"));
    }

    #[test]
    fn test_offending_files_falls_back_to_all_checked() {
        let checked = vec![PathBuf::from("a.py"), PathBuf::from("b.py")];
        assert_eq!(offending_files(&checked, "something broke"), checked);
        assert_eq!(
            offending_files(&checked, "  File \"/abs/path/a.py\", line 2"),
            vec![PathBuf::from("a.py")]
        );
    }

    #[tokio::test]
    async fn test_checker_timeout_is_a_failed_check() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        let vcs = FakeVcs::new(dir.path()).with_changed_files(vec!["a.py"]);
        let runner = ScriptedRunner::new(vec![]).with_timeout_next();

        let report = ParseGate::new(config()).check(&vcs, &runner).await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.offending_files, vec![PathBuf::from("a.py")]);
        assert!(report.diagnostics.contains("timed out"));
    }

    #[tokio::test]
    async fn test_empty_command_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        let vcs = FakeVcs::new(dir.path()).with_changed_files(vec!["a.py"]);
        let gate = ParseGate::new(ParseGateConfig {
            command: Vec::new(),
            ..config()
        });
        assert!(gate.check(&vcs, &ScriptedRunner::new(vec![])).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_checker_command() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("good.py"), "ok\n").unwrap();
        fs::write(dir.path().join("bad.py"), "BAD\n").unwrap();
        let vcs = FakeVcs::new(dir.path()).with_changed_files(vec!["good.py", "bad.py"]);
        let gate = ParseGate::new(ParseGateConfig {
            command: vec![
                "sh".into(),
                "-c".into(),
                "grep -H BAD \"$@\" && exit 1; exit 0".into(),
                "checker".into(),
            ],
            ..config()
        });

        let report = gate.check(&vcs, &ShellRunner).await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.offending_files, vec![PathBuf::from("bad.py")]);
    }
}
