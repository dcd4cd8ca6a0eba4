//! Challenger verdict extraction.
//!
//! Challenger output is free text that must contain one JSON decision object.
//! The same parser runs on fresh agent output and on feedback files read back
//! during resume, so a given file always yields the same decision.

use std::sync::LazyLock;

use jsonschema::Validator;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DECISION_SCHEMA: &str = include_str!("../../schemas/decision.schema.json");

static VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(DECISION_SCHEMA).expect("decision schema is JSON");
    jsonschema::validator_for(&schema).expect("decision schema compiles")
});

static FENCED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?[ \t]*\r?\n(.*?)```").expect("fence regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub feedback: String,
}

impl Decision {
    pub fn is_approved(&self) -> bool {
        self.verdict == Verdict::Approved
    }
}

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("no decision object with a \"verdict\" key found in agent output")]
    Missing,
    #[error("decision does not match schema: {0}")]
    Schema(String),
    #[error("decode decision: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Extract the decision from raw challenger output.
///
/// Tried in order: the whole text as JSON, the last fenced code block whose
/// object carries a `verdict` key, the last `{...}` object carrying one.
pub fn parse_decision(raw: &str) -> Result<Decision, DecisionError> {
    let value = find_candidate(raw).ok_or(DecisionError::Missing)?;
    let errors: Vec<String> = VALIDATOR
        .iter_errors(&value)
        .map(|e| e.to_string())
        .collect();
    if !errors.is_empty() {
        return Err(DecisionError::Schema(errors.join("; ")));
    }
    Ok(serde_json::from_value(value)?)
}

fn find_candidate(raw: &str) -> Option<Value> {
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(raw.trim()) {
        return Some(value);
    }

    let fenced = FENCED_RE
        .captures_iter(raw)
        .filter_map(|caps| caps.get(1))
        .filter_map(|body| serde_json::from_str::<Value>(body.as_str().trim()).ok())
        .filter(|value| value.get("verdict").is_some())
        .last();
    if fenced.is_some() {
        return fenced;
    }

    // Scan backwards over opening braces; the first position that decodes to an
    // object with a verdict wins. Trailing text after the object is ignored.
    raw.match_indices('{')
        .map(|(idx, _)| idx)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .find_map(|idx| {
            let mut stream =
                serde_json::Deserializer::from_str(&raw[idx..]).into_iter::<Value>();
            match stream.next() {
                Some(Ok(value)) if value.get("verdict").is_some() => Some(value),
                _ => None,
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json() {
        let d = parse_decision(r#"{"verdict":"approved","feedback":"ship it"}"#).expect("parse");
        assert!(d.is_approved());
        assert_eq!(d.feedback, "ship it");
    }

    #[test]
    fn parses_last_fenced_block() {
        let raw = "Review notes.\n\n```json\n{\"verdict\":\"approved\",\"feedback\":\"old\"}\n```\n\nRevised:\n```json\n{\"verdict\":\"rejected\",\"feedback\":\"missing tests\"}\n```\n";
        let d = parse_decision(raw).expect("parse");
        assert_eq!(d.verdict, Verdict::Rejected);
        assert_eq!(d.feedback, "missing tests");
    }

    #[test]
    fn fenced_blocks_without_verdict_are_skipped() {
        let raw = "Decision:\n```json\n{\"verdict\":\"rejected\",\"feedback\":\"bump the timeout\"}\n```\nExample config:\n```json\n{\"timeout\": 30}\n```\n";
        let d = parse_decision(raw).expect("parse");
        assert_eq!(d.verdict, Verdict::Rejected);
        assert_eq!(d.feedback, "bump the timeout");
    }

    #[test]
    fn parses_inline_object_with_braces_in_feedback() {
        let raw = r#"Overall fine. Decision: {"verdict": "rejected", "feedback": "rename {id} placeholder"} thanks"#;
        let d = parse_decision(raw).expect("parse");
        assert_eq!(d.verdict, Verdict::Rejected);
        assert_eq!(d.feedback, "rename {id} placeholder");
    }

    #[test]
    fn extra_keys_are_tolerated() {
        let d = parse_decision(r#"{"verdict":"approved","feedback":"","score":9}"#).expect("parse");
        assert!(d.is_approved());
    }

    #[test]
    fn missing_object_is_an_error() {
        let err = parse_decision("looks good to me").unwrap_err();
        assert!(matches!(err, DecisionError::Missing));
    }

    #[test]
    fn unknown_verdict_fails_schema() {
        let err = parse_decision(r#"{"verdict":"maybe","feedback":"x"}"#).unwrap_err();
        assert!(matches!(err, DecisionError::Schema(_)), "{err}");
    }

    #[test]
    fn missing_feedback_fails_schema() {
        let err = parse_decision(r#"{"verdict":"approved"}"#).unwrap_err();
        assert!(matches!(err, DecisionError::Schema(_)));
    }
}
