//! Scripted collaborators for unit and integration tests.
//!
//! Every fake records what it was asked to do and answers from a queue, so a
//! test reads as "given these responses, expect these calls".

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use crate::backend::{GenerationBackend, GenerationOutput, GenerationRequest};
use crate::errors::{CommandError, PipelineError, TrackerError};
use crate::kernels::StageKernel;
use crate::process::{CommandOutput, CommandRunner};
use crate::tracker::{
    CreatedItem, IssueDetails, IssueEdit, IssueTracker, PrEdit, PrRequest, PrStatus, CheckStatus,
    VersionControl,
};
use crate::workflow::{Event, Stage, StageResult, WorkflowContext};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Temporary git repository with a committer identity configured.
pub fn temp_git_repo() -> Result<TempDir> {
    let dir = tempfile::tempdir()?;
    let repo = git2::Repository::init(dir.path())?;
    let mut config = repo.config()?;
    config.set_str("user.name", "test")?;
    config.set_str("user.email", "test@test.com")?;
    Ok(dir)
}

// ── Command runner ──────────────────────────────────────────────────

/// Answers commands from a queue; an empty queue answers with success.
#[derive(Default)]
pub struct ScriptedRunner {
    outputs: Mutex<VecDeque<CommandOutput>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
    timeout_next: Mutex<bool>,
}

impl ScriptedRunner {
    pub fn new(outputs: Vec<CommandOutput>) -> Self {
        Self {
            outputs: Mutex::new(outputs.into()),
            ..Default::default()
        }
    }

    /// Make the next call time out instead of answering.
    pub fn with_timeout_next(self) -> Self {
        *lock(&self.timeout_next) = true;
        self
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        _cwd: &Path,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        lock(&self.calls).push((program.to_string(), args.to_vec()));
        if std::mem::take(&mut *lock(&self.timeout_next)) {
            return Err(CommandError::Timeout {
                program: program.to_string(),
                secs: timeout.as_secs(),
            });
        }
        Ok(lock(&self.outputs)
            .pop_front()
            .unwrap_or_else(|| CommandOutput::ok("")))
    }
}

// ── Version control ─────────────────────────────────────────────────

#[derive(Debug, Default)]
struct VcsScript {
    remotes: Vec<String>,
    remote_branches: Vec<(String, String)>,
    branch: String,
    changed_files: Vec<PathBuf>,
    fetch: VecDeque<CommandOutput>,
    rebase: VecDeque<CommandOutput>,
    push: VecDeque<CommandOutput>,
    commits: Vec<String>,
    calls: Vec<String>,
}

/// In-memory [`VersionControl`]. Commits are recorded, never written.
pub struct FakeVcs {
    worktree: PathBuf,
    script: Mutex<VcsScript>,
}

impl FakeVcs {
    pub fn new(worktree: impl Into<PathBuf>) -> Self {
        Self {
            worktree: worktree.into(),
            script: Mutex::new(VcsScript {
                branch: "issue-branch".to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn with_remote(self, name: &str) -> Self {
        lock(&self.script).remotes.push(name.to_string());
        self
    }

    pub fn with_remote_branch(self, remote: &str, branch: &str) -> Self {
        lock(&self.script)
            .remote_branches
            .push((remote.to_string(), branch.to_string()));
        self
    }

    pub fn with_branch(self, branch: &str) -> Self {
        lock(&self.script).branch = branch.to_string();
        self
    }

    pub fn with_changed_files(self, files: Vec<&str>) -> Self {
        lock(&self.script).changed_files = files.into_iter().map(PathBuf::from).collect();
        self
    }

    pub fn with_fetch(self, output: CommandOutput) -> Self {
        lock(&self.script).fetch.push_back(output);
        self
    }

    pub fn with_rebase(self, output: CommandOutput) -> Self {
        lock(&self.script).rebase.push_back(output);
        self
    }

    pub fn with_push(self, output: CommandOutput) -> Self {
        lock(&self.script).push.push_back(output);
        self
    }

    /// Commit messages in order.
    pub fn commits(&self) -> Vec<String> {
        lock(&self.script).commits.clone()
    }

    /// Operation log, e.g. `fetch origin`, `rebase origin/main`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.script).calls.clone()
    }

    fn log(&self, call: String) {
        lock(&self.script).calls.push(call);
    }

    /// Plain and lease pushes share one answer queue.
    fn next_push(&self) -> CommandOutput {
        lock(&self.script)
            .push
            .pop_front()
            .unwrap_or_else(|| CommandOutput::ok(""))
    }
}

#[async_trait]
impl VersionControl for FakeVcs {
    fn worktree(&self) -> &Path {
        &self.worktree
    }

    async fn fetch(&self, remote: &str) -> Result<CommandOutput> {
        self.log(format!("fetch {}", remote));
        Ok(lock(&self.script)
            .fetch
            .pop_front()
            .unwrap_or_else(|| CommandOutput::ok("")))
    }

    async fn rebase(&self, onto: &str) -> Result<CommandOutput> {
        self.log(format!("rebase {}", onto));
        Ok(lock(&self.script)
            .rebase
            .pop_front()
            .unwrap_or_else(|| CommandOutput::ok("")))
    }

    async fn rebase_abort(&self) -> Result<CommandOutput> {
        self.log("rebase --abort".to_string());
        Ok(CommandOutput::ok(""))
    }

    async fn current_branch(&self) -> Result<String> {
        Ok(lock(&self.script).branch.clone())
    }

    async fn push(&self, remote: &str, branch: &str) -> Result<CommandOutput> {
        self.log(format!("push {} {}", remote, branch));
        Ok(self.next_push())
    }

    async fn push_with_lease(&self, remote: &str, branch: &str) -> Result<CommandOutput> {
        self.log(format!("push --force-with-lease {} {}", remote, branch));
        Ok(self.next_push())
    }

    async fn has_remote(&self, name: &str) -> Result<bool> {
        Ok(lock(&self.script).remotes.iter().any(|r| r == name))
    }

    async fn has_remote_branch(&self, remote: &str, branch: &str) -> Result<bool> {
        Ok(lock(&self.script)
            .remote_branches
            .iter()
            .any(|(r, b)| r == remote && b == branch))
    }

    async fn commit_all(&self, message: &str) -> Result<Option<String>> {
        let mut script = lock(&self.script);
        script.commits.push(message.to_string());
        script.calls.push("commit".to_string());
        Ok(Some(format!("{:07x}", script.commits.len())))
    }

    async fn head_changed_files(&self) -> Result<Vec<PathBuf>> {
        Ok(lock(&self.script).changed_files.clone())
    }

    async fn last_commit_summary(&self) -> Result<Option<String>> {
        let script = lock(&self.script);
        Ok(script.commits.last().map(|msg| {
            let subject = msg.lines().next().unwrap_or("");
            format!("{:07x} {}", script.commits.len(), subject)
        }))
    }
}

// ── Issue tracker ───────────────────────────────────────────────────

#[derive(Default)]
struct TrackerScript {
    issue: Option<IssueDetails>,
    create_pr: VecDeque<Result<CreatedItem, String>>,
    created: Vec<PrRequest>,
    issue_edits: Vec<(u64, IssueEdit)>,
    created_issues: Vec<(String, String, Vec<String>)>,
    pr_edits: Vec<(u64, PrEdit)>,
}

/// In-memory [`IssueTracker`]. PR creation answers from a queue and defaults
/// to PR #1; created issues are numbered from #1001.
#[derive(Default)]
pub struct FakeTracker {
    script: Mutex<TrackerScript>,
}

impl FakeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_issue(self, issue: IssueDetails) -> Self {
        lock(&self.script).issue = Some(issue);
        self
    }

    pub fn with_pr_result(self, result: Result<CreatedItem, &str>) -> Self {
        lock(&self.script)
            .create_pr
            .push_back(result.map_err(str::to_string));
        self
    }

    pub fn created_prs(&self) -> Vec<PrRequest> {
        lock(&self.script).created.clone()
    }

    pub fn issue_edits(&self) -> Vec<(u64, IssueEdit)> {
        lock(&self.script).issue_edits.clone()
    }

    /// Issues opened through the tracker as `(title, body, labels)`.
    pub fn created_issues(&self) -> Vec<(String, String, Vec<String>)> {
        lock(&self.script).created_issues.clone()
    }

    pub fn pr_edits(&self) -> Vec<(u64, PrEdit)> {
        lock(&self.script).pr_edits.clone()
    }
}

#[async_trait]
impl IssueTracker for FakeTracker {
    async fn view_issue(&self, number: u64) -> Result<IssueDetails, TrackerError> {
        lock(&self.script)
            .issue
            .clone()
            .filter(|i| i.number == number)
            .ok_or_else(|| TrackerError::Rejected(format!("issue #{} not found", number)))
    }

    async fn create_issue(
        &self,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<CreatedItem, TrackerError> {
        let mut script = lock(&self.script);
        script
            .created_issues
            .push((title.to_string(), body.to_string(), labels.to_vec()));
        let number = 1000 + script.created_issues.len() as u64;
        Ok(CreatedItem {
            number,
            url: format!("https://example.com/issues/{}", number),
        })
    }

    async fn edit_issue(&self, number: u64, edit: &IssueEdit) -> Result<(), TrackerError> {
        lock(&self.script).issue_edits.push((number, edit.clone()));
        Ok(())
    }

    async fn create_pr(&self, request: &PrRequest) -> Result<CreatedItem, TrackerError> {
        let mut script = lock(&self.script);
        script.created.push(request.clone());
        match script.create_pr.pop_front() {
            Some(Ok(item)) => Ok(item),
            Some(Err(message)) => Err(TrackerError::Rejected(message)),
            None => Ok(CreatedItem {
                number: 1,
                url: "https://example.com/pull/1".to_string(),
            }),
        }
    }

    async fn view_pr(&self, number: u64) -> Result<PrStatus, TrackerError> {
        Ok(PrStatus {
            number,
            url: format!("https://example.com/pull/{}", number),
            state: "OPEN".to_string(),
            merge_state: "CLEAN".to_string(),
            checks: CheckStatus::None,
        })
    }

    async fn edit_pr(&self, number: u64, edit: &PrEdit) -> Result<(), TrackerError> {
        lock(&self.script).pr_edits.push((number, edit.clone()));
        Ok(())
    }
}

// ── Generation backend ──────────────────────────────────────────────

/// One scripted backend reply: text plus files written into the working copy.
#[derive(Debug, Clone, Default)]
pub struct ScriptedReply {
    text: String,
    files: Vec<(PathBuf, String)>,
    error: Option<String>,
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    /// Also write `contents` to `path` (relative to the request's cwd).
    pub fn with_file(mut self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.files.push((path.into(), contents.into()));
        self
    }
}

/// Answers generation requests from a queue; an exhausted queue is an error.
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        lock(&self.requests).clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.requests)
            .iter()
            .map(|r| r.prompt.clone())
            .collect()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, PipelineError> {
        let start = Instant::now();
        lock(&self.requests).push(request.clone());
        let reply = lock(&self.replies)
            .pop_front()
            .ok_or_else(|| PipelineError::Reported("scripted backend exhausted".to_string()))?;
        if let Some(message) = reply.error {
            return Err(PipelineError::Reported(message));
        }
        for (path, contents) in &reply.files {
            let target = request.cwd.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| PipelineError::Other(e.into()))?;
            }
            std::fs::write(&target, contents).map_err(|e| PipelineError::Other(e.into()))?;
        }
        if let Some(parent) = request.output_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::Other(e.into()))?;
        }
        std::fs::write(&request.output_path, &reply.text).map_err(|source| {
            PipelineError::OutputWriteFailed {
                path: request.output_path.clone(),
                source,
            }
        })?;
        Ok(GenerationOutput {
            text: reply.text,
            output_path: request.output_path.clone(),
            duration: start.elapsed(),
        })
    }
}

// ── Kernels ─────────────────────────────────────────────────────────

/// Kernel that emits events from a queue and errors once it runs dry.
pub struct ScriptedKernel {
    stage: Stage,
    emits: &'static [Event],
    events: Mutex<VecDeque<Event>>,
}

impl ScriptedKernel {
    pub fn new(stage: Stage, emits: &'static [Event], events: Vec<Event>) -> Self {
        Self {
            stage,
            emits,
            events: Mutex::new(events.into()),
        }
    }
}

#[async_trait]
impl StageKernel for ScriptedKernel {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn emits(&self) -> &'static [Event] {
        self.emits
    }

    async fn run(&self, ctx: &mut WorkflowContext) -> Result<StageResult> {
        let Some(event) = lock(&self.events).pop_front() else {
            anyhow::bail!("no scripted event left for stage {}", self.stage);
        };
        ctx.state.record(self.stage, event, None, None);
        Ok(StageResult::new(event))
    }
}
