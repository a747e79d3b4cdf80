// quill/src/normalize/schemas.rs
//! Field tables for each job type.
//!
//! Adding a job type means adding a table here and a variant to
//! [`JobType`]; the coercion logic in the parent module stays untouched.

use super::{normalize_with, FieldKind, FieldSpec, NormalizeError, Normalizer, TextFallback};
use crate::job::JobType;
use serde_json::Value;

const SHORT_SCORE: FieldKind = FieldKind::Score { min: 0.0, max: 10.0, default: 0.0 };
const ESSAY_SCORE: FieldKind = FieldKind::Score { min: 0.0, max: 20.0, default: 0.0 };
const STATUS: FieldKind = FieldKind::Status { default: "warn" };
const TEXT: FieldKind = FieldKind::Text(TextFallback::Empty);
const PROSE: FieldKind = FieldKind::Text(TextFallback::DisplayText);

const ISSUE: &[FieldSpec] = &[
    FieldSpec::new("type", TEXT),
    FieldSpec::new("excerpt", TEXT),
    FieldSpec::new("suggestion", TEXT),
    FieldSpec::new("severity", STATUS),
];

const GRAMMAR_ERROR: &[FieldSpec] = &[
    FieldSpec::new("original", TEXT),
    FieldSpec::new("corrected", TEXT),
    FieldSpec::new("explanation", TEXT),
    FieldSpec::new("category", TEXT),
];

const DIMENSION: &[FieldSpec] = &[
    FieldSpec::new("score", ESSAY_SCORE),
    FieldSpec::new("comment", TEXT),
];

const VOCABULARY: &[FieldSpec] = &[
    FieldSpec::new("word", TEXT),
    FieldSpec::new("meaning", TEXT),
    FieldSpec::new("example", TEXT),
];

const CHECKLIST: &[FieldSpec] = &[
    FieldSpec::new("covered", FieldKind::StringList),
    FieldSpec::new("missing", FieldKind::StringList),
];

pub const LOGIC_CHECK: &[FieldSpec] = &[
    FieldSpec::new("status", STATUS),
    FieldSpec::new("score", SHORT_SCORE),
    FieldSpec::new("comment", PROSE),
    FieldSpec::new("issues", FieldKind::ObjectList(ISSUE)),
    FieldSpec::new("suggestions", FieldKind::StringList),
];

pub const GRAMMAR_CHECK: &[FieldSpec] = &[
    FieldSpec::new("status", STATUS),
    FieldSpec::new("score", SHORT_SCORE),
    FieldSpec::new("comment", PROSE),
    FieldSpec::new("errors", FieldKind::ObjectList(GRAMMAR_ERROR)),
    FieldSpec::new("correctedText", TEXT),
];

pub const SCORING: &[FieldSpec] = &[
    FieldSpec::new("score", ESSAY_SCORE),
    FieldSpec::new("band", TEXT),
    FieldSpec::new("comment", PROSE),
    FieldSpec::new("dimensions", FieldKind::ObjectMap(DIMENSION)),
    FieldSpec::new("strengths", FieldKind::StringList),
    FieldSpec::new("weaknesses", FieldKind::StringList),
    FieldSpec::new("vocabulary", FieldKind::ObjectList(VOCABULARY)),
];

pub const LETTER_LOGIC: &[FieldSpec] = &[
    FieldSpec::new("status", STATUS),
    FieldSpec::new("score", SHORT_SCORE),
    FieldSpec::new("comment", PROSE),
    FieldSpec::new("checklist", FieldKind::Object(CHECKLIST)),
    FieldSpec::new("toneAppropriate", FieldKind::Flag { default: false }),
    FieldSpec::new("issues", FieldKind::ObjectList(ISSUE)),
];

pub const LETTER_SCORING: &[FieldSpec] = &[
    FieldSpec::new("score", ESSAY_SCORE),
    FieldSpec::new("comment", PROSE),
    FieldSpec::new("dimensions", FieldKind::ObjectMap(DIMENSION)),
    FieldSpec::new("checklist", FieldKind::Object(CHECKLIST)),
    FieldSpec::new("vocabulary", FieldKind::ObjectList(VOCABULARY)),
];

pub fn schema_for(job_type: JobType) -> &'static [FieldSpec] {
    match job_type {
        JobType::LogicCheck => LOGIC_CHECK,
        JobType::GrammarCheck => GRAMMAR_CHECK,
        JobType::Scoring => SCORING,
        JobType::LetterLogic => LETTER_LOGIC,
        JobType::LetterScoring => LETTER_SCORING,
    }
}

fn logic_check(payload: &Value, display_text: &str) -> Result<Value, NormalizeError> {
    normalize_with(LOGIC_CHECK, payload, display_text)
}

fn grammar_check(payload: &Value, display_text: &str) -> Result<Value, NormalizeError> {
    normalize_with(GRAMMAR_CHECK, payload, display_text)
}

fn scoring(payload: &Value, display_text: &str) -> Result<Value, NormalizeError> {
    normalize_with(SCORING, payload, display_text)
}

fn letter_logic(payload: &Value, display_text: &str) -> Result<Value, NormalizeError> {
    normalize_with(LETTER_LOGIC, payload, display_text)
}

fn letter_scoring(payload: &Value, display_text: &str) -> Result<Value, NormalizeError> {
    normalize_with(LETTER_SCORING, payload, display_text)
}

/// The default normalizer a job of this type runs.
pub fn normalizer_for(job_type: JobType) -> Normalizer {
    match job_type {
        JobType::LogicCheck => logic_check,
        JobType::GrammarCheck => grammar_check,
        JobType::Scoring => scoring,
        JobType::LetterLogic => letter_logic,
        JobType::LetterScoring => letter_scoring,
    }
}
