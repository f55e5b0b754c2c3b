//! Column type inference over sampled JSON records
//!
//! Given a slice of an API response, propose a field schema usable to
//! auto-create a DataTable. The inference only proposes; the consuming UI
//! may deselect columns before import, and nothing here enforces the
//! selection.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::types::{Field, FieldType};

/// How many records to probe per key before settling on a type.
const SAMPLE_DEPTH: usize = 5;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex"));
static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https?://").expect("url regex"));
static IMAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\.(png|jpe?g|gif|webp|svg|bmp|ico)(\?.*)?$").expect("image regex")
});
static DATETIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}").expect("datetime regex"));
static DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("date regex"));

/// A proposed column. `selected` defaults to true and is toggled by the
/// consumer, not here.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedColumn {
    pub key: String,
    pub column_type: FieldType,
    pub label: String,
    pub selected: bool,
}

/// Classify a string by specificity, most specific first. Plain string is
/// the weakest signal and the fallback.
fn classify_string(s: &str) -> FieldType {
    if EMAIL_RE.is_match(s) {
        FieldType::Email
    } else if URL_RE.is_match(s) {
        if IMAGE_RE.is_match(s) {
            FieldType::Image
        } else {
            FieldType::Url
        }
    } else if DATETIME_RE.is_match(s) {
        FieldType::Datetime
    } else if DATE_RE.is_match(s) {
        FieldType::Date
    } else {
        FieldType::String
    }
}

/// Infer the type for one key by probing up to [`SAMPLE_DEPTH`] records.
///
/// Non-string JSON types win immediately. String classifications are kept
/// from the first non-null string but scanning continues, since a later
/// record may reveal a stronger non-string signal.
fn infer_type(records: &[Value], key: &str) -> FieldType {
    let mut string_type: Option<FieldType> = None;

    for record in records.iter().take(SAMPLE_DEPTH) {
        let value = match record.get(key) {
            Some(v) if !v.is_null() => v,
            _ => continue,
        };
        match value {
            Value::Bool(_) => return FieldType::Boolean,
            Value::Number(_) => return FieldType::Number,
            Value::Array(_) => return FieldType::Array,
            Value::Object(_) => return FieldType::Object,
            Value::String(s) => {
                if string_type.is_none() {
                    string_type = Some(classify_string(s));
                }
            }
            Value::Null => {}
        }
    }
    string_type.unwrap_or(FieldType::String)
}

/// Convert a snake_case or camelCase key into a human label.
pub fn format_label(key: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    for chunk in key.split(['_', '-']) {
        if chunk.is_empty() {
            continue;
        }
        let mut word = String::new();
        for ch in chunk.chars() {
            if ch.is_uppercase() && !word.is_empty() {
                words.push(word);
                word = String::new();
            }
            word.push(ch);
        }
        if !word.is_empty() {
            words.push(word);
        }
    }

    words
        .iter()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Propose columns for a sample payload.
///
/// Anything that is not a non-empty array whose first record is an object
/// yields no columns. Keys are taken from the first record in order.
pub fn detect_columns(sample: &Value) -> Vec<DetectedColumn> {
    let records = match sample.as_array() {
        Some(records) if !records.is_empty() => records,
        _ => return Vec::new(),
    };
    let first = match records[0].as_object() {
        Some(obj) => obj,
        None => return Vec::new(),
    };

    first
        .keys()
        .map(|key| DetectedColumn {
            key: key.clone(),
            column_type: infer_type(records, key),
            label: format_label(key),
            selected: true,
        })
        .collect()
}

/// Produce schema fields for the selected columns only.
pub fn columns_to_schema(columns: &[DetectedColumn]) -> Vec<Field> {
    columns
        .iter()
        .filter(|c| c.selected)
        .map(|c| Field {
            key: c.key.clone(),
            field_type: c.column_type,
            label: c.label.clone(),
            required: false,
        })
        .collect()
}

/// Keep only the selected keys on each record.
///
/// Non-array input yields no rows. A key absent on a specific record is
/// simply absent from the output record; no null-filling.
pub fn extract_selected_data(data: &Value, selected_keys: &[String]) -> Vec<Value> {
    let records = match data.as_array() {
        Some(records) => records,
        None => return Vec::new(),
    };

    records
        .iter()
        .map(|record| {
            let mut out = Map::new();
            if let Some(obj) = record.as_object() {
                for key in selected_keys {
                    if let Some(value) = obj.get(key) {
                        out.insert(key.clone(), value.clone());
                    }
                }
            }
            Value::Object(out)
        })
        .collect()
}
