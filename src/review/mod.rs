//! Review scoring for the review stage.
//!
//! - [`score`]: coarse score from free text (`Score: N/100` and friends)
//! - [`verdict`]: four-dimension verdicts extracted from review output

pub mod score;
pub mod verdict;

pub use score::{NEUTRAL_SCORE, clamp_score, extract_score, try_extract_score};
pub use verdict::{
    HeuristicVerdictExtractor, ReviewScores, ReviewVerdict, VerdictExtractor, VerdictSource,
    extract_verdict,
};

/// Consecutive non-improving review failures that end the run.
pub const REVIEW_STREAK_LIMIT: u32 = 4;

/// Next review fail streak after a failing attempt scored `current`.
///
/// A strict improvement over the previous overall score restarts the streak
/// at 1; anything else (including the first failure) extends it.
pub fn next_fail_streak(streak: u32, previous: Option<u8>, current: u8) -> u32 {
    if previous.is_some_and(|p| current > p) {
        1
    } else {
        streak.saturating_add(1)
    }
}
