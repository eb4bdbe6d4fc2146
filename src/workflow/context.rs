use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::backend::ModelSelector;
use crate::config::EngineConfig;

use super::stage::{Event, Stage};
use super::state::ImplementationState;

/// What one kernel attempt produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub event: Event,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub payload: BTreeMap<String, Value>,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl StageResult {
    pub fn new(event: Event) -> Self {
        Self {
            event,
            reason: None,
            payload: BTreeMap::new(),
            artifacts: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::new(Event::Fatal).with_reason(reason)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifacts.push(path.into());
        self
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }
}

/// Tunables shared by the kernels.
#[derive(Debug, Clone, PartialEq)]
pub struct Tunables {
    pub max_iterations: u32,
    pub max_reviews: u32,
    pub review_enabled: bool,
    pub impl_model: ModelSelector,
    pub review_model: ModelSelector,
    /// Push remote override; detected when `None`.
    pub remote: Option<String>,
    /// Base branch override; detected when `None`.
    pub base_branch: Option<String>,
}

impl Default for Tunables {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl Tunables {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_iterations: config.workflow.max_iterations,
            max_reviews: config.workflow.max_reviews,
            review_enabled: config.workflow.review_enabled,
            impl_model: config.models.impl_model.clone(),
            review_model: config.models.review_model.clone(),
            remote: config.git.remote.clone(),
            base_branch: config.git.base.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Finished,
    Fatal,
}

/// Everything a kernel may read or write during a run.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub run_id: Uuid,
    /// Issue body or plan the implementation follows.
    pub plan: String,
    /// Extra instruction from whoever started the run.
    pub upstream_instruction: Option<String>,
    pub review_feedback: Option<String>,
    pub parse_feedback: Option<String>,
    /// Failure text from the PR stage (push, creation, title checks).
    pub ci_feedback: Option<String>,
    pub artifacts: Vec<PathBuf>,
    pub payloads: BTreeMap<Stage, BTreeMap<String, Value>>,
    pub metrics: BTreeMap<String, f64>,
    pub final_status: Option<FinalStatus>,
    pub fatal_reason: Option<String>,
    pub tunables: Tunables,
    pub state: ImplementationState,
}

impl WorkflowContext {
    pub fn new(state: ImplementationState, plan: impl Into<String>, tunables: Tunables) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            plan: plan.into(),
            upstream_instruction: None,
            review_feedback: None,
            parse_feedback: None,
            ci_feedback: None,
            artifacts: Vec::new(),
            payloads: BTreeMap::new(),
            metrics: BTreeMap::new(),
            final_status: None,
            fatal_reason: None,
            tunables,
            state,
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.upstream_instruction = Some(instruction.into());
        self
    }

    pub fn stage(&self) -> Stage {
        self.state.current_stage
    }

    pub fn attempts_for(&self, stage: Stage) -> u32 {
        self.state.attempts.get(&stage).copied().unwrap_or(0)
    }

    /// Bump and return the attempt counter for `stage`. The counter lives in
    /// the checkpointed state, so attempt numbers keep counting across a
    /// resume.
    pub fn bump_attempt(&mut self, stage: Stage) -> u32 {
        let count = self.state.attempts.entry(stage).or_insert(0);
        *count += 1;
        *count
    }

    /// Fold a kernel result into the context.
    pub fn merge_result(&mut self, stage: Stage, result: &StageResult) {
        self.artifacts.extend(result.artifacts.iter().cloned());
        self.payloads
            .entry(stage)
            .or_default()
            .extend(result.payload.iter().map(|(k, v)| (k.clone(), v.clone())));
        for (key, value) in &result.metrics {
            self.metrics.insert(format!("{}.{}", stage, key), *value);
        }
    }

    /// Retry context to inject into the next impl prompt, newest concern first.
    pub fn retry_context(&self) -> Option<String> {
        let sections: Vec<String> = [
            ("Parse check failure", &self.parse_feedback),
            ("Review feedback", &self.review_feedback),
            ("Pull request / CI failure", &self.ci_feedback),
        ]
        .into_iter()
        .filter_map(|(title, body)| body.as_ref().map(|b| format!("### {}\n{}", title, b.trim())))
        .collect();

        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }

    pub fn clear_feedback(&mut self) {
        self.parse_feedback = None;
        self.review_feedback = None;
        self.ci_feedback = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> WorkflowContext {
        WorkflowContext::new(ImplementationState::new(3, "/w"), "plan", Tunables::default())
    }

    #[test]
    fn test_bump_attempt_counts_per_stage() {
        let mut ctx = ctx();
        assert_eq!(ctx.bump_attempt(Stage::Impl), 1);
        assert_eq!(ctx.bump_attempt(Stage::Impl), 2);
        assert_eq!(ctx.bump_attempt(Stage::Pr), 1);
        assert_eq!(ctx.attempts_for(Stage::Impl), 2);
        assert_eq!(ctx.attempts_for(Stage::Rebase), 0);
    }

    #[test]
    fn test_merge_result_collects_artifacts_payload_and_metrics() {
        let mut ctx = ctx();
        let result = StageResult::new(Event::PrPass)
            .with_payload("pr_url", "https://example.com/pull/9")
            .with_artifact("/tmp/pr.json")
            .with_metric("duration_secs", 1.5);
        ctx.merge_result(Stage::Pr, &result);

        assert_eq!(ctx.artifacts, vec![PathBuf::from("/tmp/pr.json")]);
        assert_eq!(
            ctx.payloads[&Stage::Pr]["pr_url"],
            Value::from("https://example.com/pull/9")
        );
        assert_eq!(ctx.metrics["pr.duration_secs"], 1.5);
    }

    #[test]
    fn test_retry_context_includes_all_present_feedback() {
        let mut ctx = ctx();
        assert!(ctx.retry_context().is_none());
        ctx.parse_feedback = Some("src/a.py: invalid syntax".into());
        ctx.ci_feedback = Some("title rejected".into());
        let text = ctx.retry_context().unwrap();
        assert!(text.contains("Parse check failure"));
        assert!(text.contains("src/a.py"));
        assert!(text.contains("title rejected"));
        assert!(!text.contains("Review feedback"));
    }

    #[test]
    fn test_fatal_result_carries_reason() {
        let result = StageResult::fatal("budget exhausted");
        assert_eq!(result.event, Event::Fatal);
        assert_eq!(result.reason.as_deref(), Some("budget exhausted"));
    }
}
