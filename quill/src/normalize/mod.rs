// quill/src/normalize/mod.rs
//!
//! Response normalizers.
//!
//! Each job type declares its result shape as a table of [`FieldSpec`]s in
//! [`schemas`]. One generic routine interprets the table, so every declared
//! field comes out present and correctly shaped no matter what the model
//! returned: missing strings get their fallback, scores are clamped into the
//! job's range, lists contain only trimmed non-empty strings and nested
//! objects are normalized recursively. Undeclared keys are dropped.

pub mod coerce;
pub mod schemas;

use crate::job::JobType;
use serde_json::{Map, Value};

/// Failure to normalize a payload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NormalizeError {
    #[error("expected a JSON object at the top level, found {0}")]
    NotAnObject(&'static str),
}

/// A normalizer: parsed payload plus display text in, shaped record out.
pub type Normalizer = fn(&Value, &str) -> Result<Value, NormalizeError>;

/// What a text field falls back to when the payload has no usable value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFallback {
    Empty,
    /// Mirror the streamed prose.
    DisplayText,
}

#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    Text(TextFallback),
    Score { min: f64, max: f64, default: f64 },
    Status { default: &'static str },
    Flag { default: bool },
    StringList,
    /// Array of objects; non-object elements are discarded.
    ObjectList(&'static [FieldSpec]),
    /// Single nested object; a non-object value normalizes as `{}`.
    Object(&'static [FieldSpec]),
    /// Object keyed by caller-chosen names whose values share one shape;
    /// entries whose value is not an object are skipped.
    ObjectMap(&'static [FieldSpec]),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub key: &'static str,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub const fn new(key: &'static str, kind: FieldKind) -> Self {
        Self { key, kind }
    }
}

/// Normalize `payload` for `job_type` using its declared schema.
pub fn normalize(job_type: JobType, payload: &Value, display_text: &str) -> Result<Value, NormalizeError> {
    normalize_with(schemas::schema_for(job_type), payload, display_text)
}

/// Normalize `payload` against an explicit field table.
pub fn normalize_with(
    fields: &[FieldSpec],
    payload: &Value,
    display_text: &str,
) -> Result<Value, NormalizeError> {
    let object = payload
        .as_object()
        .ok_or_else(|| NormalizeError::NotAnObject(kind_name(payload)))?;
    Ok(Value::Object(normalize_object(fields, object, display_text)))
}

fn normalize_object(fields: &[FieldSpec], source: &Map<String, Value>, display_text: &str) -> Map<String, Value> {
    let mut out = Map::with_capacity(fields.len());
    for field in fields {
        let raw = source.get(field.key);
        out.insert(field.key.to_string(), normalize_field(field.kind, raw, display_text));
    }
    out
}

fn normalize_field(kind: FieldKind, raw: Option<&Value>, display_text: &str) -> Value {
    match kind {
        FieldKind::Text(fallback) => {
            let text = raw.and_then(coerce::text).unwrap_or_else(|| match fallback {
                TextFallback::Empty => String::new(),
                TextFallback::DisplayText => display_text.to_string(),
            });
            Value::String(text)
        }
        FieldKind::Score { min, max, default } => {
            coerce::number_value(coerce::clamped(raw, min, max, default))
        }
        FieldKind::Status { default } => Value::String(coerce::status(raw, default).to_string()),
        FieldKind::Flag { default } => Value::Bool(coerce::flag(raw, default)),
        FieldKind::StringList => {
            Value::Array(coerce::string_list(raw).into_iter().map(Value::String).collect())
        }
        FieldKind::ObjectList(fields) => Value::Array(
            coerce::object_items(raw)
                .into_iter()
                .map(|item| Value::Object(normalize_object(fields, item, display_text)))
                .collect(),
        ),
        FieldKind::Object(fields) => {
            let empty = Map::new();
            let source = raw.and_then(Value::as_object).unwrap_or(&empty);
            Value::Object(normalize_object(fields, source, display_text))
        }
        FieldKind::ObjectMap(fields) => {
            let mut out = Map::new();
            if let Some(entries) = raw.and_then(Value::as_object) {
                for (key, value) in entries {
                    if let Some(entry) = value.as_object() {
                        out.insert(key.clone(), Value::Object(normalize_object(fields, entry, display_text)));
                    }
                }
            }
            Value::Object(out)
        }
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ITEM: &[FieldSpec] = &[
        FieldSpec::new("name", FieldKind::Text(TextFallback::Empty)),
        FieldSpec::new("level", FieldKind::Score { min: 1.0, max: 5.0, default: 1.0 }),
    ];

    const SAMPLE: &[FieldSpec] = &[
        FieldSpec::new("comment", FieldKind::Text(TextFallback::DisplayText)),
        FieldSpec::new("note", FieldKind::Text(TextFallback::Empty)),
        FieldSpec::new("items", FieldKind::ObjectList(ITEM)),
        FieldSpec::new("main", FieldKind::Object(ITEM)),
        FieldSpec::new("byKey", FieldKind::ObjectMap(ITEM)),
    ];

    #[test]
    fn rejects_non_objects() {
        assert_eq!(
            normalize_with(SAMPLE, &json!([1]), ""),
            Err(NormalizeError::NotAnObject("an array"))
        );
        assert!(normalize_with(SAMPLE, &json!("text"), "").is_err());
        assert!(normalize_with(SAMPLE, &Value::Null, "").is_err());
    }

    #[test]
    fn empty_object_gets_every_field() {
        let out = normalize_with(SAMPLE, &json!({}), "prose").unwrap();
        assert_eq!(
            out,
            json!({
                "comment": "prose",
                "note": "",
                "items": [],
                "main": {"name": "", "level": 1},
                "byKey": {}
            })
        );
    }

    #[test]
    fn nested_shapes_are_coerced() {
        let payload = json!({
            "note": 12,
            "items": [{"name": " a ", "level": 9}, "junk", {"level": "2"}],
            "main": "not an object",
            "byKey": {"x": {"name": "X"}, "y": 3, "z": null},
            "extra": true
        });
        let out = normalize_with(SAMPLE, &payload, "").unwrap();
        assert_eq!(out["note"], json!("12"));
        assert_eq!(
            out["items"],
            json!([{"name": " a ", "level": 5}, {"name": "", "level": 2}])
        );
        assert_eq!(out["main"], json!({"name": "", "level": 1}));
        assert_eq!(out["byKey"], json!({"x": {"name": "X", "level": 1}}));
        assert!(out.get("extra").is_none());
    }
}
