use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use std::sync::LazyLock;
use tracing::{info, warn};

use super::prompts::completion_marker;
use super::{KernelDeps, StageKernel, finish_attempt};
use crate::tracker::github::parse_created_url;
use crate::tracker::{CreatedItem, PrEdit, PrRequest};
use crate::workflow::{Event, Stage, StageResult, WorkflowContext};

/// PR attempts allowed before the run is ended.
pub const PR_ATTEMPT_LIMIT: u32 = 6;

const EMITS: &[Event] = &[
    Event::PrPass,
    Event::PrFailFixable,
    Event::PrFailNeedRebase,
    Event::Fatal,
];

/// One or more bracketed tags, an optional colon, then a summary.
static TITLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\[[A-Za-z0-9._/-]+\])+:?\s+\S.*$").unwrap());

static CLOSING_TRAILER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(close[sd]?|fix(e[sd])?|resolve[sd]?)\s+#\d+").unwrap());

/// Failure text meaning the branch is behind its remote.
const NEED_REBASE_SIGNATURES: &[&str] = &[
    "non-fast-forward",
    "[rejected]",
    "fetch first",
    "updates were rejected",
    "tip of your current branch is behind",
];

/// How a failed push or PR creation should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrFailure {
    NeedRebase,
    Fixable,
}

pub fn classify_failure(text: &str) -> PrFailure {
    let lower = text.to_lowercase();
    if NEED_REBASE_SIGNATURES.iter().any(|s| lower.contains(s)) {
        PrFailure::NeedRebase
    } else {
        PrFailure::Fixable
    }
}

/// Title and body for the pull request, from the finalize artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrDraft {
    pub title: String,
    pub body: String,
}

/// Split the finalize artifact into title (first non-empty line) and body.
/// The completion marker line is dropped; a `Closes #N` trailer is appended
/// unless the body already closes an issue.
pub fn draft_from_finalize(text: &str, issue: u64) -> Result<PrDraft, String> {
    let mut lines = text.lines().skip_while(|l| l.trim().is_empty());
    let title = lines.next().map(str::trim).unwrap_or_default().to_string();
    if title.is_empty() {
        return Err("Finalize artifact is empty; its first line must be the PR title".to_string());
    }
    if !TITLE_REGEX.is_match(&title) {
        return Err(format!(
            "PR title '{}' must look like '[tag] summary' (one or more bracketed tags)",
            title
        ));
    }

    let marker = completion_marker(issue);
    let mut body = lines
        .filter(|l| l.trim() != marker)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();
    if !CLOSING_TRAILER_REGEX.is_match(&body) {
        if !body.is_empty() {
            body.push_str("\n\n");
        }
        body.push_str(&format!("Closes #{}", issue));
    }
    Ok(PrDraft { title, body })
}

/// True when the branch was rebased after its last push attempt, so the
/// remote copy has to be replaced rather than fast-forwarded.
pub fn rebased_since_push(ctx: &WorkflowContext) -> bool {
    ctx.state
        .history
        .iter()
        .rev()
        .find(|r| matches!(r.stage, Stage::Rebase | Stage::Pr))
        .is_some_and(|r| r.stage == Stage::Rebase && r.outcome == Event::RebaseOk)
}

/// Pushes the branch and opens the pull request.
pub struct PrKernel {
    deps: KernelDeps,
}

impl PrKernel {
    pub fn new(deps: KernelDeps) -> Self {
        Self { deps }
    }

    fn fail(
        ctx: &mut WorkflowContext,
        kind: PrFailure,
        message: String,
        details: Value,
    ) -> (StageResult, Value) {
        match kind {
            PrFailure::NeedRebase => {
                ctx.state
                    .record(Stage::Pr, Event::PrFailNeedRebase, None, None);
                let result = StageResult::new(Event::PrFailNeedRebase).with_reason(message);
                (result, details)
            }
            PrFailure::Fixable => {
                ctx.ci_feedback = Some(message.clone());
                ctx.state.last_feedback = Some(message.clone());
                ctx.state.record(Stage::Pr, Event::PrFailFixable, None, None);
                ctx.state.advance_iteration();
                let result = StageResult::new(Event::PrFailFixable).with_reason(message);
                (result, details)
            }
        }
    }

    /// Bring an already open PR in line with the current draft. Tracker
    /// failures here are logged; the PR itself is known to exist.
    async fn refresh_existing(&self, issue: u64, existing: CreatedItem, request: &PrRequest) -> CreatedItem {
        let url = match self.deps.tracker.view_pr(existing.number).await {
            Ok(status) => {
                info!(issue, pr = status.number, state = %status.state, checks = ?status.checks, "pull request already open");
                status.url
            }
            Err(e) => {
                warn!(issue, pr = existing.number, error = %e, "failed to view existing pull request");
                existing.url
            }
        };
        let edit = PrEdit {
            title: Some(request.title.clone()),
            body: Some(request.body.clone()),
        };
        if let Err(e) = self.deps.tracker.edit_pr(existing.number, &edit).await {
            warn!(issue, pr = existing.number, error = %e, "failed to update existing pull request");
        }
        CreatedItem {
            number: existing.number,
            url,
        }
    }

    async fn attempt(&self, ctx: &mut WorkflowContext) -> Result<(StageResult, Value)> {
        let issue = ctx.state.issue;
        ctx.state.counters.pr_attempts += 1;
        let attempts = ctx.state.counters.pr_attempts;
        if attempts > PR_ATTEMPT_LIMIT {
            ctx.state.record(Stage::Pr, Event::Fatal, None, None);
            let reason = format!("PR stage exceeded {} attempts", PR_ATTEMPT_LIMIT);
            return Ok((StageResult::fatal(reason), json!({ "pr_attempts": attempts })));
        }

        let (remote, base) = self.deps.push_target(ctx).await?;
        let finalize = self.deps.config.paths.finalize_in(&ctx.state.worktree);
        let text = std::fs::read_to_string(&finalize)
            .with_context(|| format!("Failed to read finalize artifact {}", finalize.display()))?;

        let draft = match draft_from_finalize(&text, issue) {
            Ok(draft) => draft,
            Err(message) => {
                warn!(issue, %message, "PR title rejected");
                return Ok(Self::fail(
                    ctx,
                    PrFailure::Fixable,
                    message,
                    json!({ "remote": remote, "base": base }),
                ));
            }
        };

        let branch = self.deps.vcs.current_branch().await?;
        let details = json!({
            "remote": remote,
            "base": base,
            "branch": branch,
            "title": draft.title,
        });

        let push = if rebased_since_push(ctx) {
            info!(issue, %remote, %branch, "branch was rebased, pushing with lease");
            self.deps.vcs.push_with_lease(&remote, &branch).await?
        } else {
            self.deps.vcs.push(&remote, &branch).await?
        };
        if !push.success() {
            let text = push.combined();
            let kind = classify_failure(&text);
            warn!(issue, ?kind, "push failed");
            return Ok(Self::fail(
                ctx,
                kind,
                format!("git push failed: {}", text.trim()),
                details,
            ));
        }

        let request = PrRequest {
            title: draft.title,
            body: draft.body,
            base,
            head: branch,
        };
        let created = match self.deps.tracker.create_pr(&request).await {
            Ok(created) => created,
            Err(e) => {
                let text = e.to_string();
                // An existing PR for the branch is as good as a new one.
                match text
                    .contains("already exists")
                    .then(|| parse_created_url(&text).ok())
                    .flatten()
                {
                    Some(existing) => self.refresh_existing(issue, existing, &request).await,
                    None => {
                        let kind = classify_failure(&text);
                        return Ok(Self::fail(ctx, kind, text, details));
                    }
                }
            }
        };

        ctx.state.pr_number = Some(created.number);
        ctx.state.pr_url = Some(created.url.clone());
        ctx.ci_feedback = None;
        ctx.state.record(Stage::Pr, Event::PrPass, None, None);
        info!(issue, pr = created.number, url = %created.url, "pull request ready");
        let result = StageResult::new(Event::PrPass)
            .with_payload("pr_number", created.number)
            .with_payload("pr_url", created.url);
        Ok((result, details))
    }
}

#[async_trait]
impl StageKernel for PrKernel {
    fn stage(&self) -> Stage {
        Stage::Pr
    }

    fn emits(&self) -> &'static [Event] {
        EMITS
    }

    async fn run(&self, ctx: &mut WorkflowContext) -> Result<StageResult> {
        let iteration = ctx.state.iteration;
        let attempt = ctx.attempts_for(Stage::Pr);
        let dir = self.deps.artifact_dir(ctx);
        let outcome = self.attempt(ctx).await;
        finish_attempt(&dir, Stage::Pr, iteration, attempt, outcome)
    }
}
