// quill/src/normalize/coerce.rs
//! Primitive coercions shared by every field kind.

use serde_json::{Map, Number, Value};

/// Three-valued verdict used by status fields.
pub const STATUSES: [&str; 3] = ["pass", "warn", "fail"];

/// String form of a value, or `None` for null.
///
/// Numbers and booleans use their display form; arrays and objects are
/// rendered as compact JSON.
pub fn text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Numeric form of a value, if it has a finite one.
pub fn number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Coerce to a number, fall back to `default`, then clamp into `[min, max]`.
pub fn clamped(value: Option<&Value>, min: f64, max: f64, default: f64) -> f64 {
    value
        .and_then(number)
        .unwrap_or(default)
        .clamp(min, max)
}

/// JSON number for `n`, as an integer when it has no fractional part.
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// One of [`STATUSES`], or `default` for anything else.
pub fn status(value: Option<&Value>, default: &'static str) -> &'static str {
    value
        .and_then(Value::as_str)
        .map(|s| s.trim().to_ascii_lowercase())
        .and_then(|s| STATUSES.into_iter().find(|known| *known == s))
        .unwrap_or(default)
}

pub fn flag(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => true,
            "false" | "no" => false,
            _ => default,
        },
        Some(Value::Number(n)) => n.as_f64().map(|n| n != 0.0).unwrap_or(default),
        _ => default,
    }
}

/// Trimmed, non-empty strings.
///
/// A non-array value becomes a single-element list when it has a non-empty
/// string form, otherwise an empty list.
pub fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(text)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(other) => text(other)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .into_iter()
            .collect(),
        None => Vec::new(),
    }
}

/// The plain-object elements of an array; everything else is dropped.
pub fn object_items(value: Option<&Value>) -> Vec<&Map<String, Value>> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_object).collect(),
        _ => Vec::new(),
    }
}
