use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{KernelDeps, StageKernel, finish_attempt};
use crate::workflow::{Event, Stage, StageResult, WorkflowContext};

/// Rebase attempts allowed before the run is ended.
pub const REBASE_ATTEMPT_LIMIT: u32 = 3;

const EMITS: &[Event] = &[Event::RebaseOk, Event::RebaseConflict, Event::Fatal];

/// Brings the branch up to date with `<remote>/<base>` after a rejected push.
pub struct RebaseKernel {
    deps: KernelDeps,
}

impl RebaseKernel {
    pub fn new(deps: KernelDeps) -> Self {
        Self { deps }
    }

    async fn attempt(&self, ctx: &mut WorkflowContext) -> Result<(StageResult, Value)> {
        let issue = ctx.state.issue;
        ctx.state.counters.rebase_attempts += 1;
        let attempts = ctx.state.counters.rebase_attempts;
        if attempts > REBASE_ATTEMPT_LIMIT {
            ctx.state.record(Stage::Rebase, Event::Fatal, None, None);
            let reason = format!("Rebase stage exceeded {} attempts", REBASE_ATTEMPT_LIMIT);
            return Ok((StageResult::fatal(reason), json!({ "rebase_attempts": attempts })));
        }

        let (remote, base) = self.deps.push_target(ctx).await?;
        let onto = format!("{}/{}", remote, base);
        let details = json!({ "remote": remote, "base": base, "onto": onto });

        let fetch = self.deps.vcs.fetch(&remote).await?;
        if !fetch.success() {
            ctx.state.record(Stage::Rebase, Event::Fatal, None, None);
            let reason = format!("git fetch {} failed: {}", remote, fetch.combined().trim());
            return Ok((StageResult::fatal(reason), details));
        }

        let rebase = self.deps.vcs.rebase(&onto).await?;
        if rebase.success() {
            info!(issue, %onto, "rebase succeeded");
            ctx.state.record(Stage::Rebase, Event::RebaseOk, None, None);
            return Ok((StageResult::new(Event::RebaseOk), details));
        }

        let conflict = rebase.combined();
        warn!(issue, %onto, "rebase conflict, aborting");
        let abort = self.deps.vcs.rebase_abort().await?;
        if !abort.success() {
            warn!(issue, stderr = %abort.stderr.trim(), "rebase --abort failed");
        }
        ctx.state.record(Stage::Rebase, Event::RebaseConflict, None, None);
        let result = StageResult::new(Event::RebaseConflict)
            .with_reason(format!("Rebase onto {} conflicted: {}", onto, conflict.trim()));
        Ok((result, details))
    }
}

#[async_trait]
impl StageKernel for RebaseKernel {
    fn stage(&self) -> Stage {
        Stage::Rebase
    }

    fn emits(&self) -> &'static [Event] {
        EMITS
    }

    async fn run(&self, ctx: &mut WorkflowContext) -> Result<StageResult> {
        let iteration = ctx.state.iteration;
        let attempt = ctx.attempts_for(Stage::Rebase);
        let dir = self.deps.artifact_dir(ctx);
        let outcome = self.attempt(ctx).await;
        finish_attempt(&dir, Stage::Rebase, iteration, attempt, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::process::CommandOutput;
    use crate::test_support::{FakeTracker, FakeVcs, ScriptedBackend, ScriptedRunner};
    use crate::workflow::{ImplementationState, Tunables};
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    fn setup(vcs: FakeVcs) -> (TempDir, Arc<FakeVcs>, RebaseKernel, WorkflowContext) {
        let dir = tempdir().unwrap();
        let vcs = Arc::new(vcs);
        let deps = KernelDeps {
            backend: Arc::new(ScriptedBackend::new(vec![])),
            vcs: vcs.clone(),
            tracker: Arc::new(FakeTracker::new()),
            runner: Arc::new(ScriptedRunner::new(vec![])),
            config: Arc::new(EngineConfig::default()),
        };
        let mut ctx = WorkflowContext::new(
            ImplementationState::new(3, dir.path()),
            "plan",
            Tunables::default(),
        );
        ctx.bump_attempt(Stage::Rebase);
        (dir, vcs, RebaseKernel::new(deps), ctx)
    }

    #[tokio::test]
    async fn test_clean_rebase() {
        let (_dir, vcs, kernel, mut ctx) = setup(FakeVcs::new("/w").with_remote("origin"));
        let result = kernel.run(&mut ctx).await.unwrap();
        assert_eq!(result.event, Event::RebaseOk);
        assert_eq!(vcs.calls(), vec!["fetch origin", "rebase origin/main"]);
        assert_eq!(ctx.state.iteration, 1);
    }

    #[tokio::test]
    async fn test_conflict_aborts() {
        let (_dir, vcs, kernel, mut ctx) = setup(
            FakeVcs::new("/w")
                .with_remote("origin")
                .with_rebase(CommandOutput::failed(1, "CONFLICT (content): Merge conflict in a.py")),
        );
        let result = kernel.run(&mut ctx).await.unwrap();
        assert_eq!(result.event, Event::RebaseConflict);
        assert!(result.reason.unwrap().contains("Merge conflict in a.py"));
        assert_eq!(
            vcs.calls(),
            vec!["fetch origin", "rebase origin/main", "rebase --abort"]
        );
    }

    #[tokio::test]
    async fn test_fetch_failure_is_fatal() {
        let (_dir, vcs, kernel, mut ctx) = setup(
            FakeVcs::new("/w")
                .with_remote("origin")
                .with_fetch(CommandOutput::failed(128, "could not read from remote")),
        );
        let result = kernel.run(&mut ctx).await.unwrap();
        assert_eq!(result.event, Event::Fatal);
        assert_eq!(vcs.calls(), vec!["fetch origin"]);
    }

    #[tokio::test]
    async fn test_configured_target_overrides_detection() {
        let (_dir, vcs, kernel, mut ctx) = setup(FakeVcs::new("/w"));
        ctx.tunables.remote = Some("fork".into());
        ctx.tunables.base_branch = Some("develop".into());
        kernel.run(&mut ctx).await.unwrap();
        assert_eq!(vcs.calls(), vec!["fetch fork", "rebase fork/develop"]);
    }

    #[tokio::test]
    async fn test_attempt_budget_is_fatal() {
        let (_dir, vcs, kernel, mut ctx) = setup(FakeVcs::new("/w").with_remote("origin"));
        ctx.state.counters.rebase_attempts = REBASE_ATTEMPT_LIMIT;
        let result = kernel.run(&mut ctx).await.unwrap();
        assert_eq!(result.event, Event::Fatal);
        assert!(vcs.calls().is_empty());
    }
}
