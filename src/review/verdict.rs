//! Structured review verdicts extracted from free text.
//!
//! Extraction order:
//! 1. the whole response as one JSON object
//! 2. each fenced code block
//! 3. the widest `{ ... }` span
//! 4. heuristic: a coarse score from [`extract_score`] plus regex-extracted
//!    `Findings:` / `Suggestions:` sections
//!
//! A JSON candidate only counts if it carries at least one scoring dimension.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::LazyLock;

use super::score::{clamp_score, extract_score};
use crate::util::widest_brace_span;

pub const FAITHFULNESS_THRESHOLD: u8 = 90;
pub const STYLE_THRESHOLD: u8 = 85;
pub const DOCS_THRESHOLD: u8 = 85;
pub const CORNER_CASES_THRESHOLD: u8 = 85;

static FENCED_BLOCK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").unwrap());

static FINDINGS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)findings\s*:\s*(.*?)(?:\n[ \t]*[#*]*[ \t]*suggestions\s*:|\z)").unwrap()
});

static SUGGESTIONS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)suggestions\s*:\s*(.*)\z").unwrap());

static BULLET_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s*").unwrap());

static NUMERIC_TEXT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(-?\d+(?:\.\d+)?)\s*(?:(%)|/\s*(\d+(?:\.\d+)?))?\s*$").unwrap()
});

const FAITHFULNESS_KEYS: &[&str] = &["faithfulness", "faithful", "correctness"];
const STYLE_KEYS: &[&str] = &["style", "code_style"];
const DOCS_KEYS: &[&str] = &["docs", "documentation", "doc"];
const CORNER_CASE_KEYS: &[&str] = &[
    "corner_cases",
    "corner_case_coverage",
    "corner_case",
    "edge_cases",
    "corner-cases",
];
const OVERALL_KEYS: &[&str] = &["overall", "score", "overall_score"];

/// The four scoring dimensions, each in `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewScores {
    pub faithfulness: u8,
    pub style: u8,
    pub docs: u8,
    pub corner_cases: u8,
}

impl ReviewScores {
    pub fn uniform(score: u8) -> Self {
        Self {
            faithfulness: score,
            style: score,
            docs: score,
            corner_cases: score,
        }
    }

    /// Mean of the four dimensions, rounded.
    pub fn overall(&self) -> u8 {
        let sum = self.faithfulness as u32
            + self.style as u32
            + self.docs as u32
            + self.corner_cases as u32;
        ((sum as f64) / 4.0).round() as u8
    }

    /// `(name, score, threshold)` for every dimension below its threshold.
    pub fn failing_dimensions(&self) -> Vec<(&'static str, u8, u8)> {
        [
            ("faithfulness", self.faithfulness, FAITHFULNESS_THRESHOLD),
            ("style", self.style, STYLE_THRESHOLD),
            ("docs", self.docs, DOCS_THRESHOLD),
            ("corner_cases", self.corner_cases, CORNER_CASES_THRESHOLD),
        ]
        .into_iter()
        .filter(|(_, score, threshold)| score < threshold)
        .collect()
    }

    pub fn passes(&self) -> bool {
        self.failing_dimensions().is_empty()
    }
}

/// Where a verdict was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    WholeResponse,
    FencedBlock,
    BraceSpan,
    Heuristic,
}

impl fmt::Display for VerdictSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerdictSource::WholeResponse => "whole_response",
            VerdictSource::FencedBlock => "fenced_block",
            VerdictSource::BraceSpan => "brace_span",
            VerdictSource::Heuristic => "heuristic",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub scores: ReviewScores,
    pub findings: Vec<String>,
    pub suggestions: Vec<String>,
    pub source: VerdictSource,
}

impl ReviewVerdict {
    pub fn overall(&self) -> u8 {
        self.scores.overall()
    }

    pub fn passes(&self) -> bool {
        self.scores.passes()
    }

    /// Feedback block injected into the next impl prompt.
    pub fn feedback_text(&self) -> String {
        let mut out = format!("Review score: {}/100\n", self.overall());
        let failing = self.scores.failing_dimensions();
        if !failing.is_empty() {
            out.push_str("Below threshold:\n");
            for (name, score, threshold) in failing {
                out.push_str(&format!("- {}: {} (needs {})\n", name, score, threshold));
            }
        }
        if !self.findings.is_empty() {
            out.push_str("Findings:\n");
            for finding in &self.findings {
                out.push_str(&format!("- {}\n", finding));
            }
        }
        if !self.suggestions.is_empty() {
            out.push_str("Suggestions:\n");
            for suggestion in &self.suggestions {
                out.push_str(&format!("- {}\n", suggestion));
            }
        }
        out
    }
}

/// Turns raw review text into a verdict. Never fails: the last resort is a
/// heuristic verdict.
pub trait VerdictExtractor: Send + Sync {
    fn extract(&self, text: &str) -> ReviewVerdict;
}

/// Default extractor implementing the JSON-then-heuristic cascade.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicVerdictExtractor;

impl VerdictExtractor for HeuristicVerdictExtractor {
    fn extract(&self, text: &str) -> ReviewVerdict {
        extract_verdict(text)
    }
}

pub fn extract_verdict(text: &str) -> ReviewVerdict {
    if let Some(verdict) = parse_verdict_json(text, VerdictSource::WholeResponse) {
        return verdict;
    }
    for cap in FENCED_BLOCK_REGEX.captures_iter(text) {
        if let Some(body) = cap.get(1)
            && let Some(verdict) = parse_verdict_json(body.as_str(), VerdictSource::FencedBlock)
        {
            return verdict;
        }
    }
    if let Some(span) = widest_brace_span(text)
        && let Some(verdict) = parse_verdict_json(span, VerdictSource::BraceSpan)
    {
        return verdict;
    }
    heuristic_verdict(text)
}

fn parse_verdict_json(candidate: &str, source: VerdictSource) -> Option<ReviewVerdict> {
    let value: Value = serde_json::from_str(candidate.trim()).ok()?;
    let root = value.as_object()?;
    let scores_obj = root
        .get("scores")
        .and_then(Value::as_object)
        .unwrap_or(root);

    let faithfulness = lookup_dimension(scores_obj, FAITHFULNESS_KEYS);
    let style = lookup_dimension(scores_obj, STYLE_KEYS);
    let docs = lookup_dimension(scores_obj, DOCS_KEYS);
    let corner_cases = lookup_dimension(scores_obj, CORNER_CASE_KEYS);

    let any_present = [faithfulness, style, docs, corner_cases]
        .iter()
        .any(|d| d.is_some());
    if !any_present {
        return None;
    }

    // Unusable dimensions fall back to the overall score, else fail closed at 0.
    let fallback = lookup_dimension(root, OVERALL_KEYS)
        .flatten()
        .or_else(|| lookup_dimension(scores_obj, OVERALL_KEYS).flatten())
        .unwrap_or(0);
    let resolve = |d: Option<Option<u8>>| d.flatten().unwrap_or(fallback);

    Some(ReviewVerdict {
        scores: ReviewScores {
            faithfulness: resolve(faithfulness),
            style: resolve(style),
            docs: resolve(docs),
            corner_cases: resolve(corner_cases),
        },
        findings: string_list(root.get("findings")),
        suggestions: string_list(root.get("suggestions")),
        source,
    })
}

/// `None` when no key is present; `Some(None)` when present but unusable.
fn lookup_dimension(obj: &Map<String, Value>, keys: &[&str]) -> Option<Option<u8>> {
    keys.iter()
        .find_map(|k| obj.get(*k))
        .map(coerce_dimension)
}

/// Coerce a JSON value into `0..=100`.
///
/// Numbers are taken on the 0–100 scale and clamped. Strings may be `"85"`,
/// `"85%"`, `"85/100"` or `"8.5/10"` (rescaled by the denominator). Anything
/// else is unusable.
pub fn coerce_dimension(value: &Value) -> Option<u8> {
    match value {
        Value::Number(n) => n.as_f64().map(clamp_score),
        Value::String(s) => {
            let caps = NUMERIC_TEXT_REGEX.captures(s)?;
            let n: f64 = caps.get(1)?.as_str().parse().ok()?;
            match caps.get(3) {
                Some(denominator) => {
                    let d: f64 = denominator.as_str().parse().ok()?;
                    if d <= 0.0 {
                        return None;
                    }
                    Some(clamp_score(n * 100.0 / d))
                }
                None => Some(clamp_score(n)),
            }
        }
        Value::Object(obj) => obj.get("score").and_then(coerce_dimension),
        _ => None,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Object(_) => Some(item.to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => section_lines(s),
        _ => Vec::new(),
    }
}

fn section_lines(section: &str) -> Vec<String> {
    section
        .lines()
        .map(|line| BULLET_REGEX.replace(line, "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

fn heuristic_verdict(text: &str) -> ReviewVerdict {
    let score = extract_score(text);
    let findings = FINDINGS_REGEX
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| section_lines(m.as_str()))
        .unwrap_or_default();
    let suggestions = SUGGESTIONS_REGEX
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| section_lines(m.as_str()))
        .unwrap_or_default();
    ReviewVerdict {
        scores: ReviewScores::uniform(score),
        findings,
        suggestions,
        source: VerdictSource::Heuristic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PASSING_JSON: &str = r#"{"scores": {"faithfulness": 95, "style": 90, "docs": 88, "corner_cases": 86}, "findings": ["minor naming"], "suggestions": []}"#;

    #[test]
    fn test_whole_response_json() {
        let v = extract_verdict(PASSING_JSON);
        assert_eq!(v.source, VerdictSource::WholeResponse);
        assert_eq!(v.scores.faithfulness, 95);
        assert_eq!(v.findings, vec!["minor naming"]);
        assert!(v.passes());
    }

    #[test]
    fn test_fenced_block_json() {
        let text = format!("Here is my review:\n\n```json\n{}\n```\nThanks!", PASSING_JSON);
        let v = extract_verdict(&text);
        assert_eq!(v.source, VerdictSource::FencedBlock);
        assert_eq!(v.scores.corner_cases, 86);
    }

    #[test]
    fn test_fenced_block_skips_non_verdict_blocks() {
        let text = format!(
            "```python\nprint('{{}}')\n```\nand\n```\n{}\n```",
            PASSING_JSON
        );
        let v = extract_verdict(&text);
        assert_eq!(v.source, VerdictSource::FencedBlock);
        assert_eq!(v.scores.style, 90);
    }

    #[test]
    fn test_brace_span_in_noisy_text() {
        let text = format!("Verdict follows {} -- end of verdict", PASSING_JSON);
        let v = extract_verdict(&text);
        assert_eq!(v.source, VerdictSource::BraceSpan);
        assert_eq!(v.scores.docs, 88);
    }

    #[test]
    fn test_flat_keys_and_aliases() {
        let v = extract_verdict(
            r#"{"faithfulness": "92/100", "style": "8.8/10", "documentation": "90%", "edge_cases": 87}"#,
        );
        assert_eq!(v.scores.faithfulness, 92);
        assert_eq!(v.scores.style, 88);
        assert_eq!(v.scores.docs, 90);
        assert_eq!(v.scores.corner_cases, 87);
    }

    #[test]
    fn test_unusable_dimension_falls_back_to_overall_then_zero() {
        let v = extract_verdict(r#"{"overall": 70, "scores": {"faithfulness": "great", "style": 90}}"#);
        assert_eq!(v.scores.faithfulness, 70);
        assert_eq!(v.scores.style, 90);
        assert_eq!(v.scores.docs, 70);

        let v = extract_verdict(r#"{"faithfulness": 95}"#);
        assert_eq!(v.scores.style, 0);
        assert!(!v.passes());
    }

    #[test]
    fn test_json_without_dimensions_is_ignored() {
        let v = extract_verdict("{\"status\": \"ok\"}\nScore: 40/100");
        assert_eq!(v.source, VerdictSource::Heuristic);
        assert_eq!(v.scores, ReviewScores::uniform(40));
    }

    #[test]
    fn test_heuristic_findings_and_suggestions() {
        let text = "Score: 72/100\n\nFindings:\n- missing null check\n- typo in docstring\n\nSuggestions:\n1. add a test for empty input\n";
        let v = extract_verdict(text);
        assert_eq!(v.source, VerdictSource::Heuristic);
        assert_eq!(v.overall(), 72);
        assert_eq!(v.findings, vec!["missing null check", "typo in docstring"]);
        assert_eq!(v.suggestions, vec!["add a test for empty input"]);
    }

    #[test]
    fn test_heuristic_without_anything_is_neutral() {
        let v = extract_verdict("I could not review this.");
        assert_eq!(v.scores, ReviewScores::uniform(50));
        assert!(v.findings.is_empty());
        assert!(!v.passes());
    }

    #[test]
    fn test_thresholds() {
        let at_threshold = ReviewScores {
            faithfulness: 90,
            style: 85,
            docs: 85,
            corner_cases: 85,
        };
        assert!(at_threshold.passes());

        let low_faith = ReviewScores {
            faithfulness: 89,
            ..at_threshold
        };
        assert!(!low_faith.passes());
        assert_eq!(
            low_faith.failing_dimensions(),
            vec![("faithfulness", 89, FAITHFULNESS_THRESHOLD)]
        );
    }

    #[test]
    fn test_overall_is_rounded_mean() {
        let scores = ReviewScores {
            faithfulness: 90,
            style: 85,
            docs: 85,
            corner_cases: 86,
        };
        assert_eq!(scores.overall(), 87);
    }

    #[test]
    fn test_coerce_dimension() {
        assert_eq!(coerce_dimension(&json!(150)), Some(100));
        assert_eq!(coerce_dimension(&json!(-3)), Some(0));
        assert_eq!(coerce_dimension(&json!("7/10")), Some(70));
        assert_eq!(coerce_dimension(&json!("x/0")), None);
        assert_eq!(coerce_dimension(&json!({"score": 91})), Some(91));
        assert_eq!(coerce_dimension(&json!(null)), None);
        assert_eq!(coerce_dimension(&json!(true)), None);
    }

    #[test]
    fn test_feedback_text_lists_failures() {
        let v = ReviewVerdict {
            scores: ReviewScores {
                faithfulness: 80,
                style: 90,
                docs: 70,
                corner_cases: 90,
            },
            findings: vec!["wrong return type".into()],
            suggestions: vec!["document the error case".into()],
            source: VerdictSource::WholeResponse,
        };
        let text = v.feedback_text();
        assert!(text.contains("faithfulness: 80 (needs 90)"));
        assert!(text.contains("docs: 70 (needs 85)"));
        assert!(!text.contains("style:"));
        assert!(text.contains("- wrong return type"));
        assert!(text.contains("- document the error case"));
    }
}
