use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::Path;
use tracing::{info, warn};

use super::prompts::{ReviewPromptInputs, review_prompt};
use super::{KernelDeps, StageKernel, finish_attempt};
use crate::backend::GenerationRequest;
use crate::review::{REVIEW_STREAK_LIMIT, VerdictExtractor, next_fail_streak};
use crate::util::write_atomic;
use crate::workflow::{Event, Stage, StageResult, WorkflowContext};

const EMITS: &[Event] = &[Event::ReviewPass, Event::ReviewFail, Event::Fatal];

/// Scores the committed change on four dimensions and gates the pull request
/// on the result.
pub struct ReviewKernel {
    deps: KernelDeps,
    extractor: Box<dyn VerdictExtractor>,
}

impl ReviewKernel {
    pub fn new(deps: KernelDeps, extractor: Box<dyn VerdictExtractor>) -> Self {
        Self { deps, extractor }
    }

    async fn attempt(
        &self,
        ctx: &mut WorkflowContext,
        dir: &Path,
        attempt: u32,
    ) -> Result<(StageResult, Value)> {
        let issue = ctx.state.issue;
        let iteration = ctx.state.iteration;

        if !ctx.tunables.review_enabled {
            let result = StageResult::new(Event::ReviewPass)
                .with_reason("Review disabled")
                .with_payload("skipped", true);
            return Ok((result, Value::Null));
        }

        let max_reviews = ctx.tunables.max_reviews;
        if ctx.state.counters.review_attempts >= max_reviews {
            info!(issue, max_reviews, "review attempt cap reached, passing");
            let score = ctx.state.counters.last_review_score;
            ctx.state.counters.reset_review_cycle();
            ctx.review_feedback = None;
            ctx.state.record(Stage::Review, Event::ReviewPass, score, None);
            let result = StageResult::new(Event::ReviewPass)
                .with_reason(format!("Review attempt cap ({}) reached", max_reviews))
                .with_payload("forced", true);
            return Ok((result, json!({ "max_reviews": max_reviews })));
        }
        ctx.state.counters.review_attempts += 1;

        let last_commit = self.deps.vcs.last_commit_summary().await?;
        let changed_files = self.deps.vcs.head_changed_files().await?;
        let prompt = review_prompt(
            ctx,
            &ReviewPromptInputs {
                last_commit: last_commit.as_deref(),
                changed_files: &changed_files,
            },
        );
        let stem = format!("review-iter-{}-attempt-{}", iteration, attempt);
        write_atomic(&dir.join(format!("{}-prompt.md", stem)), prompt.as_bytes())?;

        let request = GenerationRequest {
            prompt,
            selector: ctx.tunables.review_model.clone(),
            output_path: dir.join(format!("{}-output.md", stem)),
            cwd: ctx.state.worktree.clone(),
            timeout: self.deps.config.timeouts.generation(),
        };
        let (verdict, output_path) = match self.deps.backend.generate(&request).await {
            Ok(output) => (Some(self.extractor.extract(&output.text)), Some(output.output_path)),
            Err(e) => {
                warn!(issue, iteration, error = %e, "review generation failed");
                (None, None)
            }
        };

        if let Some(verdict) = &verdict
            && verdict.passes()
        {
            let overall = verdict.overall();
            ctx.state.last_score = Some(overall);
            ctx.state.counters.reset_review_cycle();
            ctx.review_feedback = None;
            ctx.state
                .record(Stage::Review, Event::ReviewPass, Some(overall), output_path.as_deref());
            info!(issue, iteration, overall, "review passed");
            let result = StageResult::new(Event::ReviewPass)
                .with_payload("overall", overall)
                .with_payload("scores", json!(verdict.scores));
            return Ok((result, json!({ "verdict": verdict })));
        }

        // Failed or unusable review. A failed generation never counts as an
        // improvement.
        let counters = &mut ctx.state.counters;
        let previous = counters.last_review_score;
        let overall = verdict.as_ref().map(|v| v.overall());
        let streak = next_fail_streak(counters.review_fail_streak, previous, overall.unwrap_or(0));
        counters.review_fail_streak = streak;
        if let Some(overall) = overall {
            counters.last_review_score = Some(overall);
            ctx.state.last_score = Some(overall);
        }

        let feedback = match &verdict {
            Some(v) => v.feedback_text(),
            None => "The review could not be completed; re-check the change against the issue."
                .to_string(),
        };
        ctx.review_feedback = Some(feedback.clone());
        ctx.state.last_feedback = Some(feedback);
        let details = json!({ "verdict": verdict, "previous_overall": previous });

        if streak >= REVIEW_STREAK_LIMIT {
            ctx.state.record(Stage::Review, Event::Fatal, overall, output_path.as_deref());
            let reason = format!(
                "Review score did not improve for {} consecutive attempts",
                streak
            );
            return Ok((StageResult::fatal(reason), details));
        }

        warn!(issue, iteration, ?overall, streak, "review failed");
        ctx.state
            .record(Stage::Review, Event::ReviewFail, overall, output_path.as_deref());
        ctx.state.advance_iteration();
        let mut result = StageResult::new(Event::ReviewFail).with_payload("fail_streak", streak);
        if let Some(overall) = overall {
            result = result.with_payload("overall", overall);
        }
        Ok((result, details))
    }
}

#[async_trait]
impl StageKernel for ReviewKernel {
    fn stage(&self) -> Stage {
        Stage::Review
    }

    fn emits(&self) -> &'static [Event] {
        EMITS
    }

    async fn run(&self, ctx: &mut WorkflowContext) -> Result<StageResult> {
        let iteration = ctx.state.iteration;
        let attempt = ctx.attempts_for(Stage::Review);
        let dir = self.deps.artifact_dir(ctx);
        let outcome = self.attempt(ctx, &dir, attempt).await;
        finish_attempt(&dir, Stage::Review, iteration, attempt, outcome)
    }
}
