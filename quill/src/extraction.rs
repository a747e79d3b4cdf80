// quill/src/extraction.rs
//!
//! JSON extraction pipeline.
//!
//! Turns the final stream text into a parsed payload by trying an ordered
//! list of strategies. The first strategy whose candidate parses wins; later
//! strategies are never consulted. The display text always comes from the
//! stream tag split, whichever strategy produced the payload.

use crate::stream_tags;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

static FENCED_JSON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[ \t]*(?i:json)[ \t]*\r?\n?(.*?)```").expect("valid fenced json pattern")
});

static FENCED_ANY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n?(.*?)```").expect("valid fenced block pattern")
});

/// Where a parsed payload was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadSource {
    Delimited,
    FencedJson,
    Fenced,
    WholeText,
}

/// Outcome of running the pipeline over one final text.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub display_text: String,
    /// Raw text between the payload tags, if a tag pair was found.
    pub json_text: Option<String>,
    pub json: Option<Value>,
    pub source: Option<PayloadSource>,
}

type Strategy = fn(&str) -> Option<Value>;

const STRATEGIES: &[(PayloadSource, Strategy)] = &[
    (PayloadSource::Delimited, from_delimited),
    (PayloadSource::FencedJson, from_fenced_json),
    (PayloadSource::Fenced, from_fenced_any),
    (PayloadSource::WholeText, from_whole_text),
];

/// Extract the payload and display text from the final stream text.
pub fn extract(full_text: &str) -> Extraction {
    let tagged = stream_tags::split(full_text);

    let found = STRATEGIES
        .iter()
        .find_map(|(source, strategy)| strategy(full_text).map(|value| (*source, value)));

    let (source, json) = match found {
        Some((source, value)) => (Some(source), Some(value)),
        None => (None, None),
    };

    Extraction {
        display_text: tagged.display_text.to_string(),
        json_text: tagged.json_text.map(str::to_string),
        json,
        source,
    }
}

fn parse_candidate(candidate: &str) -> Option<Value> {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return None;
    }
    serde_json::from_str(candidate).ok()
}

fn from_delimited(text: &str) -> Option<Value> {
    stream_tags::split(text).json_text.and_then(parse_candidate)
}

fn from_fenced_json(text: &str) -> Option<Value> {
    FENCED_JSON
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|body| parse_candidate(body.as_str()))
}

fn from_fenced_any(text: &str) -> Option<Value> {
    FENCED_ANY
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|body| parse_candidate(body.as_str()))
}

fn from_whole_text(text: &str) -> Option<Value> {
    parse_candidate(text)
}
