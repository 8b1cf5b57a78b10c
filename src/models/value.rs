//! Tagged value union for extracted field data.
//!
//! Extraction results are heterogeneous mappings of field name to value.
//! Rather than passing raw JSON around, values are modeled as a closed
//! union and serialized to canonical JSON text for the database. ISO-8601
//! date strings round-trip as `Date`.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A single extracted value.
///
/// Untagged serde representation: serializes to the natural JSON form
/// (`Date` as an ISO-8601 string). Variant order matters for
/// deserialization: `Date` is tried before `Text` so date-shaped strings
/// come back typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Date(NaiveDate),
    Text(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Sentinel recorded for required fields the extractor failed to find.
    pub fn missing() -> Self {
        Value::Text("N/A".to_string())
    }

    /// Convert loose JSON (from a model response) into a typed value.
    ///
    /// Nulls collapse to the empty string; date-shaped strings become
    /// `Date`.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Text(String::new()),
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => match NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
                Ok(date) => Value::Date(date),
                Err(_) => Value::Text(s),
            },
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Render the value as cell text; arrays and objects become their JSON
    /// representation.
    pub fn to_cell_text(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Text(s) => s.clone(),
            Value::Array(_) | Value::Object(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::Array(_) | Value::Object(_))
    }
}
