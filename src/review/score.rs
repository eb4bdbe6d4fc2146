//! Heuristic quality score from free text.

use regex::Regex;
use std::sync::LazyLock;

/// Score used when no pattern matches.
pub const NEUTRAL_SCORE: u8 = 50;

static SCORE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)score\s*[:=]\s*(-?\d+(?:\.\d+)?)\s*/\s*100").unwrap());

static QUALITY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)quality\s*[:=]\s*(-?\d+(?:\.\d+)?)(?:\s*/\s*100)?").unwrap());

static RATING_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)rating\s*[:=]\s*(-?\d+(?:\.\d+)?)\s*/\s*10\b").unwrap());

/// Clamp any numeric score into `0..=100`.
pub fn clamp_score(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

fn first_number(regex: &Regex, text: &str) -> Option<f64> {
    regex
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Try `Score: N/100`, then `Quality: N[/100]`, then `Rating: X.X/10`.
pub fn try_extract_score(text: &str) -> Option<u8> {
    if let Some(n) = first_number(&SCORE_REGEX, text) {
        return Some(clamp_score(n));
    }
    if let Some(n) = first_number(&QUALITY_REGEX, text) {
        return Some(clamp_score(n));
    }
    first_number(&RATING_REGEX, text).map(|n| clamp_score(n * 10.0))
}

/// Like [`try_extract_score`], falling back to [`NEUTRAL_SCORE`].
pub fn extract_score(text: &str) -> u8 {
    try_extract_score(text).unwrap_or(NEUTRAL_SCORE)
}
