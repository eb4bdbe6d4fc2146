use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::TransitionError;

/// A named phase of the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Impl,
    Review,
    Pr,
    Rebase,
    Finish,
    Fatal,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Impl,
        Stage::Review,
        Stage::Pr,
        Stage::Rebase,
        Stage::Finish,
        Stage::Fatal,
    ];

    /// Stages that run a kernel.
    pub const ACTIVE: [Stage; 4] = [Stage::Impl, Stage::Review, Stage::Pr, Stage::Rebase];

    /// No kernel runs once one of these is reached.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Finish | Stage::Fatal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Impl => "impl",
            Stage::Review => "review",
            Stage::Pr => "pr",
            Stage::Rebase => "rebase",
            Stage::Finish => "finish",
            Stage::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| TransitionError::UnknownStageName(s.to_string()))
    }
}

/// Symbolic outcome emitted by a stage kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    ImplNotDone,
    ParseFail,
    ImplDone,
    ReviewPass,
    ReviewFail,
    PrPass,
    PrFailFixable,
    PrFailNeedRebase,
    RebaseOk,
    RebaseConflict,
    Fatal,
}

impl Event {
    pub const ALL: [Event; 11] = [
        Event::ImplNotDone,
        Event::ParseFail,
        Event::ImplDone,
        Event::ReviewPass,
        Event::ReviewFail,
        Event::PrPass,
        Event::PrFailFixable,
        Event::PrFailNeedRebase,
        Event::RebaseOk,
        Event::RebaseConflict,
        Event::Fatal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Event::ImplNotDone => "impl_not_done",
            Event::ParseFail => "parse_fail",
            Event::ImplDone => "impl_done",
            Event::ReviewPass => "review_pass",
            Event::ReviewFail => "review_fail",
            Event::PrPass => "pr_pass",
            Event::PrFailFixable => "pr_fail_fixable",
            Event::PrFailNeedRebase => "pr_fail_need_rebase",
            Event::RebaseOk => "rebase_ok",
            Event::RebaseConflict => "rebase_conflict",
            Event::Fatal => "fatal",
        }
    }

    /// Whether this event represents forward progress for its stage.
    pub fn is_pass(self) -> bool {
        matches!(
            self,
            Event::ImplDone | Event::ReviewPass | Event::PrPass | Event::RebaseOk
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Event {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Event::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| TransitionError::UnknownEventName(s.to_string()))
    }
}
