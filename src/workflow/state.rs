use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::stage::{Event, Stage};

/// One entry in the append-only run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    /// Event the kernel emitted for this attempt.
    pub outcome: Event,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
}

/// Per-concern retry budgets. Kept in the state so a resumed run does not get
/// a fresh allowance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCounters {
    /// Consecutive parse-gate failures since the last pass.
    pub parse_fail_streak: u32,
    /// Consecutive non-improving review failures.
    pub review_fail_streak: u32,
    /// Overall score of the previous review attempt in this review cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_review_score: Option<u8>,
    /// Review attempts in the current review cycle.
    pub review_attempts: u32,
    pub pr_attempts: u32,
    pub rebase_attempts: u32,
}

impl RetryCounters {
    /// Clear review convergence tracking after a review pass.
    pub fn reset_review_cycle(&mut self) {
        self.review_fail_streak = 0;
        self.last_review_score = None;
        self.review_attempts = 0;
    }
}

/// Serializable workflow state for one issue run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplementationState {
    pub issue: u64,
    pub current_stage: Stage,
    pub iteration: u32,
    pub worktree: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_score: Option<u8>,
    /// Output file of the latest impl attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<PathBuf>,
    #[serde(default)]
    pub history: Vec<StageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub counters: RetryCounters,
    /// Kernel invocations per stage; numbers the diagnostic artifacts.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attempts: BTreeMap<Stage, u32>,
}

impl ImplementationState {
    /// Fresh state: iteration 1, stage impl.
    pub fn new(issue: u64, worktree: impl Into<PathBuf>) -> Self {
        Self {
            issue,
            current_stage: Stage::Impl,
            iteration: 1,
            worktree: worktree.into(),
            plan_path: None,
            last_feedback: None,
            last_score: None,
            last_output: None,
            history: Vec::new(),
            pr_number: None,
            pr_url: None,
            counters: RetryCounters::default(),
            attempts: BTreeMap::new(),
        }
    }

    pub fn with_plan(mut self, plan_path: impl Into<PathBuf>) -> Self {
        self.plan_path = Some(plan_path.into());
        self
    }

    /// Append a history record for the current iteration.
    pub fn record(
        &mut self,
        stage: Stage,
        outcome: Event,
        score: Option<u8>,
        artifact: Option<&Path>,
    ) {
        self.history.push(StageRecord {
            stage,
            iteration: self.iteration,
            timestamp: Utc::now(),
            outcome,
            score,
            artifact: artifact.map(Path::to_path_buf),
        });
    }

    /// Move on to the next impl iteration. The counter never goes backwards.
    pub fn advance_iteration(&mut self) {
        self.iteration = self.iteration.saturating_add(1);
    }

    pub fn is_terminal(&self) -> bool {
        self.current_stage.is_terminal()
    }

    /// History entries for one stage, oldest first.
    pub fn records_for(&self, stage: Stage) -> impl Iterator<Item = &StageRecord> {
        self.history.iter().filter(move |r| r.stage == stage)
    }
}
