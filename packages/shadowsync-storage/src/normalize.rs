//! Value normalization applied before anything reaches the raw store.
//!
//! Rules:
//! - null, empty string, `NaN` and empty lists become the `"None"` sentinel
//! - booleans become `"True"` / `"False"`
//! - a list of scalars becomes one value per element, in order
//! - objects, and lists containing objects or lists, become a single JSON string
//! - a field whose normalized value exceeds the byte cap is dropped
//! - sanitized fields lose control characters other than newline and tab

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use crate::domain::NONE_SENTINEL;

pub const DEFAULT_MAX_FIELD_BYTES: usize = 65_535;

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub max_field_bytes: usize,
    pub sanitize_fields: HashSet<String>,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            max_field_bytes: DEFAULT_MAX_FIELD_BYTES,
            sanitize_fields: HashSet::new(),
        }
    }
}

/// Normalized field map plus the names of fields dropped for size.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedFields {
    pub fields: BTreeMap<String, Vec<String>>,
    pub dropped: Vec<String>,
}

pub fn normalize_fields(
    fields: &BTreeMap<String, Value>,
    options: &NormalizeOptions,
) -> NormalizedFields {
    let mut out = NormalizedFields::default();
    for (name, value) in fields {
        let sanitize = options.sanitize_fields.contains(name);
        match normalize_value(value, sanitize, options.max_field_bytes) {
            Some(values) => {
                out.fields.insert(name.clone(), values);
            }
            None => out.dropped.push(name.clone()),
        }
    }
    out
}

/// Normalized values of one field, or `None` when it exceeds `max_bytes`.
pub fn normalize_value(value: &Value, sanitize: bool, max_bytes: usize) -> Option<Vec<String>> {
    let values = match value {
        Value::Array(items) if items.is_empty() => vec![NONE_SENTINEL.to_string()],
        Value::Array(items) if items.iter().all(is_scalar) => items
            .iter()
            .map(|item| scalar_string(item, sanitize))
            .collect(),
        Value::Array(_) | Value::Object(_) => vec![value.to_string()],
        scalar => vec![scalar_string(scalar, sanitize)],
    };

    if values.iter().any(|v| v.len() > max_bytes) {
        None
    } else {
        Some(values)
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

fn scalar_string(value: &Value, sanitize: bool) -> String {
    match value {
        Value::Null => NONE_SENTINEL.to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => {
            let s = if sanitize { sanitize_text(s) } else { s.clone() };
            if s.is_empty() || s.eq_ignore_ascii_case("nan") {
                NONE_SENTINEL.to_string()
            } else {
                s
            }
        }
        other => other.to_string(),
    }
}

/// Strip control and other non-printable characters, keeping newlines and tabs.
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|c| *c == '\n' || *c == '\t' || !(c.is_control() || is_invisible(*c)))
        .collect()
}

fn is_invisible(c: char) -> bool {
    matches!(c, '\u{200B}'..='\u{200F}' | '\u{FEFF}' | '\u{2028}' | '\u{2029}')
}
