//! Built-in extraction schema catalog.
//!
//! The registry is read-only at runtime; adding a schema is a code
//! change. Detection delegates to the vision capability and reports the
//! raw result; the pipeline applies the confidence floor.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{FieldSpec, FieldType, Schema};
use crate::vision::{Detection, VisionError, VisionExtractor};

/// Schema used when detection is inconclusive.
pub const GENERIC_SCHEMA: &str = "generic";

/// Detection results below this confidence fall back to the generic schema.
pub const DETECTION_CONFIDENCE_FLOOR: f64 = 0.5;

/// Catalog of named extraction schemas.
pub struct SchemaRegistry {
    schemas: BTreeMap<String, Schema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        let mut schemas = BTreeMap::new();
        for schema in [invoice_schema(), receipt_schema(), generic_schema()] {
            schemas.insert(schema.name.clone(), schema);
        }
        Self { schemas }
    }

    pub fn list(&self) -> Vec<&Schema> {
        self.schemas.values().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.schemas.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&Schema> {
        self.schemas.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    /// The fallback schema. Always present.
    pub fn generic(&self) -> &Schema {
        self.schemas
            .get(GENERIC_SCHEMA)
            .expect("generic schema is built in")
    }

    /// Ask the vision capability which schema fits a sample page.
    pub async fn detect(
        &self,
        vision: &dyn VisionExtractor,
        page_png: &[u8],
        hint: Option<&str>,
    ) -> Result<Detection, VisionError> {
        vision.detect(page_png, &self.names(), hint).await
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn field(field_type: FieldType, description: &str) -> FieldSpec {
    FieldSpec {
        field_type,
        description: description.to_string(),
    }
}

fn invoice_schema() -> Schema {
    Schema {
        name: "invoice".to_string(),
        description: "Commercial invoice with line items and totals".to_string(),
        fields: BTreeMap::from([
            ("invoice_number".to_string(), field(FieldType::Text, "Invoice identifier")),
            ("invoice_date".to_string(), field(FieldType::Date, "Date of issue")),
            ("due_date".to_string(), field(FieldType::Date, "Payment due date")),
            ("vendor_name".to_string(), field(FieldType::Text, "Issuing company name")),
            ("vendor_address".to_string(), field(FieldType::Text, "Issuing company address")),
            ("customer_name".to_string(), field(FieldType::Text, "Billed party name")),
            ("subtotal".to_string(), field(FieldType::Number, "Pre-tax total")),
            ("tax".to_string(), field(FieldType::Number, "Tax amount")),
            ("total".to_string(), field(FieldType::Number, "Grand total")),
            ("currency".to_string(), field(FieldType::Text, "Currency code")),
            (
                "line_items".to_string(),
                field(
                    FieldType::Array,
                    "Line items: description, quantity, unit_price, amount",
                ),
            ),
        ]),
        required_fields: BTreeSet::from([
            "invoice_number".to_string(),
            "invoice_date".to_string(),
            "total".to_string(),
        ]),
    }
}

fn receipt_schema() -> Schema {
    Schema {
        name: "receipt".to_string(),
        description: "Point-of-sale receipt".to_string(),
        fields: BTreeMap::from([
            ("merchant_name".to_string(), field(FieldType::Text, "Merchant name")),
            ("receipt_date".to_string(), field(FieldType::Date, "Transaction date")),
            ("total".to_string(), field(FieldType::Number, "Amount paid")),
            ("tax".to_string(), field(FieldType::Number, "Tax amount")),
            ("payment_method".to_string(), field(FieldType::Text, "Payment method")),
            (
                "items".to_string(),
                field(FieldType::Array, "Purchased items: description, amount"),
            ),
        ]),
        required_fields: BTreeSet::from(["merchant_name".to_string(), "total".to_string()]),
    }
}

fn generic_schema() -> Schema {
    Schema {
        name: GENERIC_SCHEMA.to_string(),
        description: "Untyped document".to_string(),
        fields: BTreeMap::from([
            ("title".to_string(), field(FieldType::Text, "Document title or heading")),
            ("date".to_string(), field(FieldType::Date, "Most prominent date")),
            ("summary".to_string(), field(FieldType::Text, "One-sentence summary")),
            ("raw_text".to_string(), field(FieldType::Text, "Full visible text")),
        ]),
        required_fields: BTreeSet::new(),
    }
}
