//! Extraction schemas: named, typed descriptions of the fields an
//! extractor should attempt to populate.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Number,
    Date,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Date => "date",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// One field an extractor should populate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub description: String,
}

/// A named extraction schema. Immutable at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub description: String,
    pub fields: BTreeMap<String, FieldSpec>,
    pub required_fields: BTreeSet<String>,
}

impl Schema {
    /// Type of a field, if the schema declares it.
    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields.get(name).map(|f| f.field_type)
    }
}

/// Schema selection carried by a processing job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaChoice {
    /// Detect the schema from the first page.
    Auto,
    /// Use the named schema.
    Named(String),
}

impl SchemaChoice {
    /// Encode for single-column persistence: `auto` or the schema name.
    pub fn encode(&self) -> String {
        match self {
            Self::Auto => "auto".to_string(),
            Self::Named(name) => name.clone(),
        }
    }

    pub fn decode(s: &str) -> Self {
        if s == "auto" {
            Self::Auto
        } else {
            Self::Named(s.to_string())
        }
    }
}
