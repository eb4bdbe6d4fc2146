use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::Path;
use tracing::{info, warn};

use super::prompts::{ImplPromptInputs, completion_marker, impl_prompt};
use super::{KernelDeps, StageKernel, finish_attempt};
use crate::backend::GenerationRequest;
use crate::gates::ParseGate;
use crate::review::extract_score;
use crate::util::write_atomic;
use crate::workflow::{Event, Stage, StageResult, WorkflowContext};

/// Consecutive parse-gate failures that end the run.
pub const PARSE_FAIL_LIMIT: u32 = 3;

const EMITS: &[Event] = &[
    Event::ImplNotDone,
    Event::ParseFail,
    Event::ImplDone,
    Event::Fatal,
];

/// Generates an implementation attempt, commits it once the agent declares
/// completion and gates it on a syntax check.
pub struct ImplKernel {
    deps: KernelDeps,
    gate: ParseGate,
}

impl ImplKernel {
    pub fn new(deps: KernelDeps) -> Self {
        let gate = ParseGate::new(deps.config.parse_gate.clone());
        Self { deps, gate }
    }

    async fn attempt(&self, ctx: &mut WorkflowContext, dir: &Path) -> Result<(StageResult, Value)> {
        let issue = ctx.state.issue;
        let iteration = ctx.state.iteration;
        let max_iterations = ctx.tunables.max_iterations;

        if iteration > max_iterations {
            ctx.state.record(Stage::Impl, Event::Fatal, None, None);
            let reason = format!(
                "Iteration {} exceeds max_iterations ({})",
                iteration, max_iterations
            );
            return Ok((StageResult::fatal(reason), json!({ "max_iterations": max_iterations })));
        }

        let paths = &self.deps.config.paths;
        let worktree = ctx.state.worktree.clone();
        let finalize = paths.finalize_in(&worktree);
        let commit_report = paths.commit_report_in(&worktree, iteration);

        // A finalize file from an earlier iteration must not count as done.
        if finalize.exists() {
            std::fs::remove_file(&finalize)
                .with_context(|| format!("Failed to remove stale {}", finalize.display()))?;
        }

        let last_commit = self.deps.vcs.last_commit_summary().await?;
        let commit_report_rel = paths.commit_report_in(Path::new(""), iteration);
        let prompt = impl_prompt(
            ctx,
            &ImplPromptInputs {
                finalize: &paths.finalize,
                commit_report: &commit_report_rel,
                last_commit: last_commit.as_deref(),
            },
        );
        let prompt_path = dir.join(format!("impl-iter-{}-prompt.md", iteration));
        write_atomic(&prompt_path, prompt.as_bytes())?;

        let request = GenerationRequest {
            prompt,
            selector: ctx.tunables.impl_model.clone(),
            output_path: dir.join(format!("impl-iter-{}-output.md", iteration)),
            cwd: worktree.clone(),
            timeout: self.deps.config.timeouts.generation(),
        };
        let output = match self.deps.backend.generate(&request).await {
            Ok(output) => output,
            Err(e) => {
                warn!(issue, iteration, error = %e, "impl generation failed");
                ctx.state.record(Stage::Impl, Event::ImplNotDone, None, None);
                ctx.state.advance_iteration();
                let result = StageResult::new(Event::ImplNotDone)
                    .with_reason(format!("Generation failed: {}", e));
                return Ok((result, json!({ "generation_error": e.to_string() })));
            }
        };

        let score = extract_score(&output.text);
        ctx.state.last_output = Some(output.output_path.clone());
        ctx.state.last_score = Some(score);

        let marker = completion_marker(issue);
        let finalize_text = std::fs::read_to_string(&finalize).unwrap_or_default();
        if !finalize_text.contains(&marker) {
            info!(issue, iteration, score, "completion marker not found");
            ctx.state
                .record(Stage::Impl, Event::ImplNotDone, Some(score), Some(output.output_path.as_path()));
            ctx.state.advance_iteration();
            let result = StageResult::new(Event::ImplNotDone)
                .with_reason("Completion marker not found")
                .with_payload("score", score)
                .with_metric("generation_secs", output.duration.as_secs_f64());
            return Ok((result, json!({ "finalize": finalize, "marker": marker })));
        }

        let message = std::fs::read_to_string(&commit_report).unwrap_or_default();
        if message.trim().is_empty() {
            ctx.state.record(Stage::Impl, Event::Fatal, Some(score), None);
            let reason = format!(
                "Completion marker present but commit message artifact {} is missing or empty",
                commit_report.display()
            );
            return Ok((StageResult::fatal(reason), json!({ "commit_report": commit_report })));
        }

        let commit = self.deps.vcs.commit_all(message.trim()).await?;
        let gate = self
            .gate
            .check(self.deps.vcs.as_ref(), self.deps.runner.as_ref())
            .await?;
        let details = json!({
            "commit": commit,
            "checked_files": gate.checked_files,
            "offending_files": gate.offending_files,
        });

        if !gate.passed {
            let counters = &mut ctx.state.counters;
            counters.parse_fail_streak += 1;
            let streak = counters.parse_fail_streak;
            let feedback = gate.feedback();
            ctx.parse_feedback = Some(feedback.clone());
            ctx.state.last_feedback = Some(feedback);

            if streak >= PARSE_FAIL_LIMIT {
                ctx.state.record(Stage::Impl, Event::Fatal, Some(score), None);
                let reason = format!("Parse check failed {} consecutive times", streak);
                return Ok((StageResult::fatal(reason), details));
            }
            warn!(issue, iteration, streak, "parse check failed");
            ctx.state
                .record(Stage::Impl, Event::ParseFail, Some(score), Some(output.output_path.as_path()));
            ctx.state.advance_iteration();
            let result = StageResult::new(Event::ParseFail)
                .with_reason("Parse check failed")
                .with_payload("parse_fail_streak", streak)
                .with_payload("score", score);
            return Ok((result, details));
        }

        ctx.state.counters.parse_fail_streak = 0;
        ctx.clear_feedback();
        ctx.state.last_feedback = None;
        ctx.state
            .record(Stage::Impl, Event::ImplDone, Some(score), Some(finalize.as_path()));
        info!(issue, iteration, score, ?commit, "implementation done");
        let mut result = StageResult::new(Event::ImplDone)
            .with_payload("score", score)
            .with_artifact(finalize)
            .with_metric("generation_secs", output.duration.as_secs_f64());
        if let Some(sha) = commit {
            result = result.with_payload("commit", sha);
        }
        Ok((result, details))
    }
}

#[async_trait]
impl StageKernel for ImplKernel {
    fn stage(&self) -> Stage {
        Stage::Impl
    }

    fn emits(&self) -> &'static [Event] {
        EMITS
    }

    async fn run(&self, ctx: &mut WorkflowContext) -> Result<StageResult> {
        let iteration = ctx.state.iteration;
        let attempt = ctx.attempts_for(Stage::Impl);
        let dir = self.deps.artifact_dir(ctx);
        let outcome = self.attempt(ctx, &dir).await;
        finish_attempt(&dir, Stage::Impl, iteration, attempt, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::process::CommandOutput;
    use crate::test_support::{FakeTracker, FakeVcs, ScriptedBackend, ScriptedReply, ScriptedRunner};
    use crate::workflow::{ImplementationState, Tunables};
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    const FINALIZE: &str = ".tmp/finalize.txt";

    struct Harness {
        dir: TempDir,
        backend: Arc<ScriptedBackend>,
        vcs: Arc<FakeVcs>,
        runner: Arc<ScriptedRunner>,
        kernel: ImplKernel,
    }

    fn harness(replies: Vec<ScriptedReply>, changed: Vec<&str>, checks: Vec<CommandOutput>) -> Harness {
        let dir = tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::new(replies));
        let vcs = Arc::new(FakeVcs::new(dir.path()).with_changed_files(changed));
        let runner = Arc::new(ScriptedRunner::new(checks));
        let deps = KernelDeps {
            backend: backend.clone(),
            vcs: vcs.clone(),
            tracker: Arc::new(FakeTracker::new()),
            runner: runner.clone(),
            config: Arc::new(EngineConfig::default()),
        };
        Harness {
            kernel: ImplKernel::new(deps),
            dir,
            backend,
            vcs,
            runner,
        }
    }

    fn ctx(dir: &Path) -> WorkflowContext {
        let mut ctx = WorkflowContext::new(
            ImplementationState::new(857, dir),
            "Crash on empty input",
            Tunables::default(),
        );
        ctx.bump_attempt(Stage::Impl);
        ctx
    }

    fn done_reply(iteration: u32) -> ScriptedReply {
        ScriptedReply::text("Quality: 88")
            .with_file(FINALIZE, "[fix] guard empty input\n\nBody\nIssue 857 resolved\n")
            .with_file(
                format!(".tmp/commit-report-iter-{}.txt", iteration),
                "[fix] guard empty input\n",
            )
    }

    #[tokio::test]
    async fn test_not_done_advances_iteration() {
        let h = harness(vec![ScriptedReply::text("Score: 40/100")], vec![], vec![]);
        let mut ctx = ctx(h.dir.path());

        let result = h.kernel.run(&mut ctx).await.unwrap();
        assert_eq!(result.event, Event::ImplNotDone);
        assert_eq!(ctx.state.iteration, 2);
        assert_eq!(ctx.state.last_score, Some(40));
        assert_eq!(ctx.state.history.len(), 1);
        assert_eq!(ctx.state.history[0].iteration, 1);
        assert!(h.vcs.commits().is_empty());
        assert!(h.dir.path().join(".tmp/issueflow/impl-iter-1-prompt.md").exists());
        assert!(h.dir.path().join(".tmp/issueflow/impl-iter-1-output.md").exists());
        assert!(h.dir.path().join(".tmp/issueflow/impl-iter-1-attempt-1.json").exists());
    }

    #[tokio::test]
    async fn test_done_commits_and_passes_gate() {
        let h = harness(vec![done_reply(1)], vec!["app.py"], vec![CommandOutput::ok("")]);
        std::fs::write(h.dir.path().join("app.py"), "x = 1\n").unwrap();
        let mut ctx = ctx(h.dir.path());

        let result = h.kernel.run(&mut ctx).await.unwrap();
        assert_eq!(result.event, Event::ImplDone);
        assert_eq!(ctx.state.iteration, 1);
        assert_eq!(ctx.state.last_score, Some(88));
        assert_eq!(h.vcs.commits(), vec!["[fix] guard empty input"]);
        assert_eq!(h.runner.calls().len(), 1);
        assert_eq!(ctx.state.history[0].outcome, Event::ImplDone);
        assert_eq!(result.payload["commit"], "0000001");
    }

    #[tokio::test]
    async fn test_marker_without_commit_report_is_fatal() {
        let reply = ScriptedReply::text("done")
            .with_file(FINALIZE, "[fix] x\nIssue 857 resolved\n");
        let h = harness(vec![reply], vec![], vec![]);
        let mut ctx = ctx(h.dir.path());

        let result = h.kernel.run(&mut ctx).await.unwrap();
        assert_eq!(result.event, Event::Fatal);
        assert!(result.reason.unwrap().contains("commit message artifact"));
        assert!(h.vcs.commits().is_empty());
    }

    #[tokio::test]
    async fn test_third_consecutive_parse_failure_is_fatal() {
        let bad = || CommandOutput::failed(1, "  File \"app.py\", line 1\nSyntaxError: invalid syntax");
        let h = harness(
            vec![done_reply(1), done_reply(2), done_reply(3)],
            vec!["app.py"],
            vec![bad(), bad(), bad()],
        );
        std::fs::write(h.dir.path().join("app.py"), "def (:\n").unwrap();
        let mut ctx = ctx(h.dir.path());

        let first = h.kernel.run(&mut ctx).await.unwrap();
        assert_eq!(first.event, Event::ParseFail);
        assert!(ctx.parse_feedback.as_deref().unwrap().contains("app.py"));
        let second = h.kernel.run(&mut ctx).await.unwrap();
        assert_eq!(second.event, Event::ParseFail);
        assert_eq!(ctx.state.iteration, 3);
        let third = h.kernel.run(&mut ctx).await.unwrap();
        assert_eq!(third.event, Event::Fatal);
        assert_eq!(ctx.state.counters.parse_fail_streak, 3);

        // Retry context reached the second prompt.
        assert!(h.backend.prompts()[1].contains("Parse check failure"));
    }

    #[tokio::test]
    async fn test_gate_pass_resets_parse_streak() {
        let h = harness(vec![done_reply(1)], vec!["app.py"], vec![CommandOutput::ok("")]);
        std::fs::write(h.dir.path().join("app.py"), "x = 1\n").unwrap();
        let mut ctx = ctx(h.dir.path());
        ctx.state.counters.parse_fail_streak = 2;
        ctx.parse_feedback = Some("old".into());

        let result = h.kernel.run(&mut ctx).await.unwrap();
        assert_eq!(result.event, Event::ImplDone);
        assert_eq!(ctx.state.counters.parse_fail_streak, 0);
        assert!(ctx.parse_feedback.is_none());
    }

    #[tokio::test]
    async fn test_iteration_over_budget_is_fatal_without_generation() {
        let h = harness(vec![], vec![], vec![]);
        let mut ctx = ctx(h.dir.path());
        ctx.state.iteration = 11;

        let result = h.kernel.run(&mut ctx).await.unwrap();
        assert_eq!(result.event, Event::Fatal);
        assert!(h.backend.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_stale_finalize_is_removed_before_generation() {
        let h = harness(vec![ScriptedReply::text("still working")], vec![], vec![]);
        let finalize = h.dir.path().join(FINALIZE);
        std::fs::create_dir_all(finalize.parent().unwrap()).unwrap();
        std::fs::write(&finalize, "[fix] old\nIssue 857 resolved\n").unwrap();
        let mut ctx = ctx(h.dir.path());

        let result = h.kernel.run(&mut ctx).await.unwrap();
        assert_eq!(result.event, Event::ImplNotDone);
        assert!(!finalize.exists());
    }

    #[tokio::test]
    async fn test_generation_failure_is_not_done() {
        let h = harness(vec![ScriptedReply::error("rate limited")], vec![], vec![]);
        let mut ctx = ctx(h.dir.path());

        let result = h.kernel.run(&mut ctx).await.unwrap();
        assert_eq!(result.event, Event::ImplNotDone);
        assert!(result.reason.unwrap().contains("rate limited"));
        assert_eq!(ctx.state.iteration, 2);
    }
}
