//! Merging per-page extractions into one document result.
//!
//! Scalars keep the highest-confidence value with earliest-page wins on
//! ties; arrays concatenate in page order; objects merge recursively by
//! the same rules. Required fields the extractor never produced are
//! filled with the `"N/A"` sentinel at zero confidence.

use std::collections::BTreeMap;

use crate::models::{PageStatus, Schema, Value};

/// Outcome of extracting one page.
#[derive(Debug, Clone)]
pub struct PageResult {
    /// 1-based page number.
    pub number: u32,
    pub status: PageStatus,
    pub fields: BTreeMap<String, Value>,
    pub confidence: BTreeMap<String, f64>,
    pub error: Option<String>,
}

impl PageResult {
    pub fn failed(number: u32, error: impl Into<String>) -> Self {
        Self {
            number,
            status: PageStatus::Error,
            fields: BTreeMap::new(),
            confidence: BTreeMap::new(),
            error: Some(error.into()),
        }
    }
}

/// Combine page results into document-level fields and confidences.
pub fn merge_pages(
    schema: &Schema,
    pages: &[PageResult],
) -> (BTreeMap<String, Value>, BTreeMap<String, f64>) {
    let mut fields: BTreeMap<String, Value> = BTreeMap::new();
    let mut confidences: BTreeMap<String, f64> = BTreeMap::new();

    let mut ordered: Vec<&PageResult> = pages.iter().collect();
    ordered.sort_by_key(|p| p.number);

    for page in ordered {
        if page.status == PageStatus::Error {
            continue;
        }
        for (name, incoming) in &page.fields {
            let incoming_conf = page.confidence.get(name).copied().unwrap_or(0.5);
            match fields.get(name) {
                None => {
                    fields.insert(name.clone(), incoming.clone());
                    confidences.insert(name.clone(), incoming_conf);
                }
                Some(existing) => {
                    let existing_conf = confidences.get(name).copied().unwrap_or(0.0);
                    let merged =
                        merge_value(existing, incoming, existing_conf, incoming_conf);
                    fields.insert(name.clone(), merged);
                    confidences.insert(name.clone(), existing_conf.max(incoming_conf));
                }
            }
        }
    }

    for required in &schema.required_fields {
        if !fields.contains_key(required) {
            fields.insert(required.clone(), Value::missing());
            confidences.insert(required.clone(), 0.0);
        }
    }

    (fields, confidences)
}

/// Merge two values for the same field.
///
/// `existing` came from an earlier page; ties go to it.
fn merge_value(existing: &Value, incoming: &Value, existing_conf: f64, incoming_conf: f64) -> Value {
    match (existing, incoming) {
        (Value::Array(a), Value::Array(b)) => {
            let mut merged = a.clone();
            merged.extend(b.iter().cloned());
            Value::Array(merged)
        }
        (Value::Object(a), Value::Object(b)) => {
            let mut merged = a.clone();
            for (key, value) in b {
                match merged.get(key) {
                    None => {
                        merged.insert(key.clone(), value.clone());
                    }
                    Some(current) => {
                        let resolved =
                            merge_value(current, value, existing_conf, incoming_conf);
                        merged.insert(key.clone(), resolved);
                    }
                }
            }
            Value::Object(merged)
        }
        _ => {
            if incoming_conf > existing_conf {
                incoming.clone()
            } else {
                existing.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::SchemaRegistry;

    fn page(number: u32, entries: &[(&str, Value, f64)]) -> PageResult {
        PageResult {
            number,
            status: PageStatus::Vision,
            fields: entries
                .iter()
                .map(|(n, v, _)| (n.to_string(), v.clone()))
                .collect(),
            confidence: entries
                .iter()
                .map(|(n, _, c)| (n.to_string(), *c))
                .collect(),
            error: None,
        }
    }

    fn invoice() -> Schema {
        SchemaRegistry::new().get("invoice").unwrap().clone()
    }

    #[test]
    fn scalar_keeps_highest_confidence() {
        let pages = vec![
            page(1, &[("total", Value::Number(10.0), 0.6)]),
            page(2, &[("total", Value::Number(20.0), 0.9)]),
        ];
        let (fields, confidences) = merge_pages(&invoice(), &pages);
        assert_eq!(fields["total"], Value::Number(20.0));
        assert_eq!(confidences["total"], 0.9);
    }

    #[test]
    fn scalar_tie_goes_to_earliest_page() {
        let pages = vec![
            page(1, &[("total", Value::Number(10.0), 0.8)]),
            page(2, &[("total", Value::Number(20.0), 0.8)]),
        ];
        let (fields, _) = merge_pages(&invoice(), &pages);
        assert_eq!(fields["total"], Value::Number(10.0));
    }

    #[test]
    fn arrays_concatenate_in_page_order() {
        let pages = vec![
            page(2, &[("line_items", Value::Array(vec![Value::Number(2.0)]), 0.7)]),
            page(1, &[("line_items", Value::Array(vec![Value::Number(1.0)]), 0.7)]),
        ];
        let (fields, _) = merge_pages(&invoice(), &pages);
        assert_eq!(
            fields["line_items"],
            Value::Array(vec![Value::Number(1.0), Value::Number(2.0)])
        );
    }

    #[test]
    fn objects_merge_recursively() {
        let a = Value::Object(BTreeMap::from([
            ("city".to_string(), Value::Text("Berlin".to_string())),
        ]));
        let b = Value::Object(BTreeMap::from([
            ("city".to_string(), Value::Text("Munich".to_string())),
            ("zip".to_string(), Value::Text("80331".to_string())),
        ]));
        let pages = vec![
            page(1, &[("vendor_address", a, 0.9)]),
            page(2, &[("vendor_address", b, 0.4)]),
        ];
        let (fields, _) = merge_pages(&invoice(), &pages);
        let Value::Object(merged) = &fields["vendor_address"] else {
            panic!("expected object")
        };
        // Existing key wins at higher confidence; new keys merge in.
        assert_eq!(merged["city"], Value::Text("Berlin".to_string()));
        assert_eq!(merged["zip"], Value::Text("80331".to_string()));
    }

    #[test]
    fn missing_required_fields_get_sentinel() {
        let pages = vec![page(1, &[("total", Value::Number(5.0), 0.9)])];
        let (fields, confidences) = merge_pages(&invoice(), &pages);
        assert_eq!(fields["invoice_number"], Value::missing());
        assert_eq!(confidences["invoice_number"], 0.0);
        assert_eq!(fields["invoice_date"], Value::missing());
        // Found fields keep their extraction.
        assert_eq!(fields["total"], Value::Number(5.0));
    }

    #[test]
    fn error_pages_contribute_nothing() {
        let mut bad = page(1, &[("total", Value::Number(99.0), 1.0)]);
        bad.status = PageStatus::Error;
        let good = page(2, &[("total", Value::Number(7.0), 0.6)]);

        let (fields, _) = merge_pages(&invoice(), &[bad, good]);
        assert_eq!(fields["total"], Value::Number(7.0));
    }

    #[test]
    fn no_pages_yields_only_sentinels() {
        let (fields, confidences) = merge_pages(&invoice(), &[]);
        assert_eq!(fields.len(), invoice().required_fields.len());
        assert!(confidences.values().all(|c| *c == 0.0));
    }
}
