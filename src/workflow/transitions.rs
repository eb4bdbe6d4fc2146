//! The workflow transition table.
//!
//! A finite map from `(stage, event)` to the next stage. There are no wildcard
//! or default edges: an event a kernel can emit must be routed explicitly, and
//! `validate` is run once at startup so a wiring mistake surfaces before the
//! first step rather than mid-run.

use std::collections::BTreeMap;

use crate::errors::{TableError, TransitionError};

use super::stage::{Event, Stage};

/// The minimal edge set every table must contain, with its required target.
pub const REQUIRED_EDGES: &[(Stage, Event, Stage)] = &[
    (Stage::Impl, Event::ImplNotDone, Stage::Impl),
    (Stage::Impl, Event::ParseFail, Stage::Impl),
    (Stage::Impl, Event::ImplDone, Stage::Review),
    (Stage::Impl, Event::Fatal, Stage::Fatal),
    (Stage::Review, Event::ReviewPass, Stage::Pr),
    (Stage::Review, Event::ReviewFail, Stage::Impl),
    (Stage::Review, Event::Fatal, Stage::Fatal),
    (Stage::Pr, Event::PrPass, Stage::Finish),
    (Stage::Pr, Event::PrFailFixable, Stage::Impl),
    (Stage::Pr, Event::PrFailNeedRebase, Stage::Rebase),
    (Stage::Pr, Event::Fatal, Stage::Fatal),
    (Stage::Rebase, Event::RebaseOk, Stage::Pr),
    (Stage::Rebase, Event::RebaseConflict, Stage::Fatal),
    (Stage::Rebase, Event::Fatal, Stage::Fatal),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionTable {
    edges: BTreeMap<(Stage, Event), Stage>,
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl TransitionTable {
    /// The table wired from `REQUIRED_EDGES`.
    pub fn standard() -> Self {
        Self::from_edges(REQUIRED_EDGES.iter().copied())
    }

    pub fn from_edges(edges: impl IntoIterator<Item = (Stage, Event, Stage)>) -> Self {
        Self {
            edges: edges
                .into_iter()
                .map(|(stage, event, next)| ((stage, event), next))
                .collect(),
        }
    }

    /// Remove an edge, returning its previous target.
    pub fn remove(&mut self, stage: Stage, event: Event) -> Option<Stage> {
        self.edges.remove(&(stage, event))
    }

    pub fn insert(&mut self, stage: Stage, event: Event, next: Stage) -> Option<Stage> {
        self.edges.insert((stage, event), next)
    }

    pub fn contains(&self, stage: Stage, event: Event) -> bool {
        self.edges.contains_key(&(stage, event))
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Resolve the stage that follows `event` in `stage`.
    ///
    /// A stage with no outgoing edges at all is `UnknownStage`; a known stage
    /// without an edge for `event` is `UnknownEvent`.
    pub fn next_stage(&self, stage: Stage, event: Event) -> Result<Stage, TransitionError> {
        if let Some(next) = self.edges.get(&(stage, event)) {
            return Ok(*next);
        }
        if self.edges.keys().any(|(s, _)| *s == stage) {
            Err(TransitionError::UnknownEvent { stage, event })
        } else {
            Err(TransitionError::UnknownStage { stage })
        }
    }

    /// String-keyed lookup used when stage/event names come from outside the
    /// type system (checkpoints written by other tools, log replays).
    pub fn next_stage_by_name(&self, stage: &str, event: &str) -> Result<Stage, TransitionError> {
        let stage: Stage = stage.parse()?;
        let event: Event = event.parse()?;
        self.next_stage(stage, event)
    }

    /// Events routed out of `stage`.
    pub fn events_for(&self, stage: Stage) -> Vec<Event> {
        self.edges
            .keys()
            .filter(|(s, _)| *s == stage)
            .map(|(_, e)| *e)
            .collect()
    }

    /// Check the table once at startup.
    pub fn validate(&self) -> Result<(), TableError> {
        for (stage, event) in self.edges.keys() {
            if stage.is_terminal() {
                return Err(TableError::TerminalSource {
                    stage: *stage,
                    event: *event,
                });
            }
        }
        for (stage, event, expected) in REQUIRED_EDGES {
            match self.edges.get(&(*stage, *event)) {
                None => {
                    return Err(TableError::MissingEdge {
                        stage: *stage,
                        event: *event,
                    });
                }
                Some(next) if next != expected => {
                    return Err(TableError::WrongTarget {
                        stage: *stage,
                        event: *event,
                        next: *next,
                        expected: *expected,
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Convenience wrapper over the standard table.
pub fn next_stage(stage: Stage, event: Event) -> Result<Stage, TransitionError> {
    TransitionTable::standard().next_stage(stage, event)
}

/// Validate the standard table.
pub fn validate_transition_table() -> Result<(), TableError> {
    TransitionTable::standard().validate()
}
