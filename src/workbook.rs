//! Workbook synthesis from extraction results.
//!
//! Three shapes: a single document (Data / Metadata / Summary), a batch
//! (one sheet per document plus a combined sheet with provenance), and
//! template mode (one wide table whose columns are the union of all
//! field names in first-seen-then-frequency order).

use std::collections::HashMap;

use chrono::Datelike;
use rust_xlsxwriter::{ExcelDateTime, Format, Workbook, Worksheet, XlsxError};

use crate::models::{Document, Value};

const MIN_COLUMN_WIDTH: f64 = 10.0;
const MAX_COLUMN_WIDTH: f64 = 60.0;

/// Produces xlsx workbooks from documents.
pub struct WorkbookWriter;

impl WorkbookWriter {
    /// Workbook for one completed document: `Data`, `Metadata`, `Summary`.
    pub fn single(doc: &Document, include_metadata: bool) -> Result<Vec<u8>, XlsxError> {
        let mut workbook = Workbook::new();
        let formats = Formats::new();

        let sheet = workbook.add_worksheet();
        sheet.set_name("Data")?;
        write_data_sheet(sheet, doc, &formats)?;

        if include_metadata {
            let sheet = workbook.add_worksheet();
            sheet.set_name("Metadata")?;
            write_metadata_sheet(sheet, doc, &formats)?;
        }

        let sheet = workbook.add_worksheet();
        sheet.set_name("Summary")?;
        write_summary_sheet(sheet, doc, &formats)?;

        workbook.save_to_buffer()
    }

    /// Workbook for a batch: `Data_<id>` per document plus `Combined`.
    pub fn batch(docs: &[Document]) -> Result<Vec<u8>, XlsxError> {
        let mut workbook = Workbook::new();
        let formats = Formats::new();

        for doc in docs {
            let sheet = workbook.add_worksheet();
            sheet.set_name(format!("Data_{}", doc.id))?;
            write_data_sheet(sheet, doc, &formats)?;
        }

        let sheet = workbook.add_worksheet();
        sheet.set_name("Combined")?;
        write_combined_sheet(sheet, docs, &formats)?;

        workbook.save_to_buffer()
    }

    /// Template-mode workbook: `Template` wide table plus `Template Info`.
    ///
    /// Only documents carrying extraction results contribute columns and
    /// rows; the column order is deterministic for a given input order.
    pub fn template(docs: &[Document]) -> Result<Vec<u8>, XlsxError> {
        let mut workbook = Workbook::new();
        let formats = Formats::new();
        let columns = template_projection(docs);

        let sheet = workbook.add_worksheet();
        sheet.set_name("Template")?;
        write_template_sheet(sheet, docs, &columns, &formats)?;

        let sheet = workbook.add_worksheet();
        sheet.set_name("Template Info")?;
        write_template_info_sheet(sheet, docs, &columns, &formats)?;

        workbook.save_to_buffer()
    }
}

/// Union of field names across completed documents, ordered by
/// `(first_seen asc, frequency desc, name asc)`.
pub fn template_projection(docs: &[Document]) -> Vec<String> {
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    let mut frequency: HashMap<String, usize> = HashMap::new();

    for (index, doc) in completed(docs).enumerate() {
        for name in doc.extracted_fields.iter().flat_map(|f| f.keys()) {
            first_seen.entry(name.clone()).or_insert(index);
            *frequency.entry(name.clone()).or_insert(0) += 1;
        }
    }

    let mut names: Vec<String> = first_seen.keys().cloned().collect();
    names.sort_by(|a, b| {
        first_seen[a]
            .cmp(&first_seen[b])
            .then(frequency[b].cmp(&frequency[a]))
            .then(a.cmp(b))
    });
    names
}

fn completed(docs: &[Document]) -> impl Iterator<Item = &Document> {
    docs.iter().filter(|d| d.extracted_fields.is_some())
}

struct Formats {
    header: Format,
    date: Format,
}

impl Formats {
    fn new() -> Self {
        Self {
            header: Format::new().set_bold(),
            date: Format::new().set_num_format("yyyy-mm-dd"),
        }
    }
}

/// Tracks content widths so columns can be auto-sized with a ceiling.
struct ColumnWidths {
    widths: Vec<f64>,
}

impl ColumnWidths {
    fn new() -> Self {
        Self { widths: Vec::new() }
    }

    fn note(&mut self, col: u16, text: &str) {
        let col = col as usize;
        if self.widths.len() <= col {
            self.widths.resize(col + 1, MIN_COLUMN_WIDTH);
        }
        let width = (text.chars().count() as f64 + 2.0).clamp(MIN_COLUMN_WIDTH, MAX_COLUMN_WIDTH);
        if width > self.widths[col] {
            self.widths[col] = width;
        }
    }

    fn apply(&self, sheet: &mut Worksheet) -> Result<(), XlsxError> {
        for (col, width) in self.widths.iter().enumerate() {
            sheet.set_column_width(col as u16, *width)?;
        }
        Ok(())
    }
}

/// Write one typed value into a cell.
fn write_value(
    sheet: &mut Worksheet,
    row: u32,
    col: u16,
    value: &Value,
    widths: &mut ColumnWidths,
    formats: &Formats,
) -> Result<(), XlsxError> {
    widths.note(col, &value.to_cell_text());
    match value {
        Value::Number(n) => sheet.write_number(row, col, *n)?,
        Value::Bool(b) => sheet.write_boolean(row, col, *b)?,
        Value::Date(d) => {
            let excel_date =
                ExcelDateTime::from_ymd(d.year() as u16, d.month() as u8, d.day() as u8)?;
            sheet.write_datetime_with_format(row, col, &excel_date, &formats.date)?
        }
        other => sheet.write_string(row, col, other.to_cell_text())?,
    };
    Ok(())
}

fn write_header(
    sheet: &mut Worksheet,
    titles: &[&str],
    widths: &mut ColumnWidths,
    formats: &Formats,
) -> Result<(), XlsxError> {
    for (col, title) in titles.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *title, &formats.header)?;
        widths.note(col as u16, title);
    }
    sheet.set_freeze_panes(1, 0)?;
    Ok(())
}

/// Field rows ordered by confidence descending, then name; surfaces the
/// extractor's best answers first.
fn ordered_fields(doc: &Document) -> Vec<(&String, &Value, f64)> {
    let Some(fields) = &doc.extracted_fields else {
        return Vec::new();
    };
    let mut rows: Vec<(&String, &Value, f64)> = fields
        .iter()
        .map(|(name, value)| {
            let confidence = doc
                .confidence_scores
                .as_ref()
                .and_then(|c| c.get(name))
                .copied()
                .unwrap_or(0.0);
            (name, value, confidence)
        })
        .collect();
    rows.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(b.0)));
    rows
}

fn write_data_sheet(
    sheet: &mut Worksheet,
    doc: &Document,
    formats: &Formats,
) -> Result<(), XlsxError> {
    let mut widths = ColumnWidths::new();
    write_header(sheet, &["Field", "Value", "Confidence"], &mut widths, formats)?;

    for (row, (name, value, confidence)) in ordered_fields(doc).into_iter().enumerate() {
        let row = row as u32 + 1;
        sheet.write_string(row, 0, name)?;
        widths.note(0, name);
        write_value(sheet, row, 1, value, &mut widths, formats)?;
        sheet.write_number(row, 2, confidence)?;
    }
    widths.apply(sheet)
}

fn write_metadata_sheet(
    sheet: &mut Worksheet,
    doc: &Document,
    formats: &Formats,
) -> Result<(), XlsxError> {
    let mut widths = ColumnWidths::new();
    write_header(sheet, &["Property", "Value"], &mut widths, formats)?;

    let average_confidence = doc
        .confidence_scores
        .as_ref()
        .filter(|c| !c.is_empty())
        .map(|c| c.values().sum::<f64>() / c.len() as f64);

    let mut rows: Vec<(String, String)> = vec![
        ("Document ID".to_string(), doc.id.to_string()),
        ("Original Filename".to_string(), doc.original_filename.clone()),
        ("Content Hash".to_string(), doc.content_hash.clone()),
        ("Size (bytes)".to_string(), doc.byte_len.to_string()),
        (
            "Page Count".to_string(),
            doc.page_count.map(|n| n.to_string()).unwrap_or_default(),
        ),
        ("Status".to_string(), doc.status.as_str().to_string()),
        (
            "Average Confidence".to_string(),
            average_confidence
                .map(|c| format!("{c:.2}"))
                .unwrap_or_default(),
        ),
    ];

    if let Some(meta) = &doc.processing_meta {
        if let Some(model) = &meta.model {
            rows.push(("Model".to_string(), model.clone()));
        }
        if let Some(worker) = &meta.worker {
            rows.push(("Worker".to_string(), worker.clone()));
        }
        if let Some(duration) = meta.duration_ms {
            rows.push(("Duration (ms)".to_string(), duration.to_string()));
        }
        for (page, status) in &meta.page_statuses {
            rows.push((format!("Page {page}"), status.as_str().to_string()));
        }
        for warning in &meta.warnings {
            rows.push(("Warning".to_string(), warning.clone()));
        }
    }

    for (index, (property, value)) in rows.iter().enumerate() {
        let row = index as u32 + 1;
        sheet.write_string(row, 0, property)?;
        sheet.write_string(row, 1, value)?;
        widths.note(0, property);
        widths.note(1, value);
    }
    widths.apply(sheet)
}

fn write_summary_sheet(
    sheet: &mut Worksheet,
    doc: &Document,
    formats: &Formats,
) -> Result<(), XlsxError> {
    let mut widths = ColumnWidths::new();
    write_header(sheet, &["Field", "Confidence", "Bar"], &mut widths, formats)?;

    for (row, (name, _, confidence)) in ordered_fields(doc).into_iter().enumerate() {
        let row = row as u32 + 1;
        let bar = "█".repeat((confidence * 10.0).round() as usize);
        sheet.write_string(row, 0, name)?;
        sheet.write_number(row, 1, confidence)?;
        sheet.write_string(row, 2, &bar)?;
        widths.note(0, name);
        widths.note(2, &bar);
    }
    widths.apply(sheet)
}

fn write_combined_sheet(
    sheet: &mut Worksheet,
    docs: &[Document],
    formats: &Formats,
) -> Result<(), XlsxError> {
    let mut widths = ColumnWidths::new();
    write_header(
        sheet,
        &["Document ID", "Filename", "Field", "Value", "Confidence"],
        &mut widths,
        formats,
    )?;

    let mut row = 1u32;
    for doc in docs {
        for (name, value, confidence) in ordered_fields(doc) {
            sheet.write_number(row, 0, doc.id as f64)?;
            sheet.write_string(row, 1, &doc.original_filename)?;
            sheet.write_string(row, 2, name)?;
            write_value(sheet, row, 3, value, &mut widths, formats)?;
            sheet.write_number(row, 4, confidence)?;
            widths.note(1, &doc.original_filename);
            widths.note(2, name);
            row += 1;
        }
    }
    widths.apply(sheet)
}

fn write_template_sheet(
    sheet: &mut Worksheet,
    docs: &[Document],
    columns: &[String],
    formats: &Formats,
) -> Result<(), XlsxError> {
    let mut widths = ColumnWidths::new();

    let mut titles: Vec<&str> = vec!["Document ID"];
    titles.extend(columns.iter().map(|c| c.as_str()));
    write_header(sheet, &titles, &mut widths, formats)?;

    for (index, doc) in completed(docs).enumerate() {
        let row = index as u32 + 1;
        sheet.write_number(row, 0, doc.id as f64)?;
        let Some(fields) = &doc.extracted_fields else {
            continue;
        };
        for (offset, column) in columns.iter().enumerate() {
            // A missing column stays an empty cell: the document's schema
            // simply never had this field.
            if let Some(value) = fields.get(column) {
                write_value(sheet, row, offset as u16 + 1, value, &mut widths, formats)?;
            }
        }
    }
    widths.apply(sheet)
}

fn write_template_info_sheet(
    sheet: &mut Worksheet,
    docs: &[Document],
    columns: &[String],
    formats: &Formats,
) -> Result<(), XlsxError> {
    let mut widths = ColumnWidths::new();
    write_header(sheet, &["Property", "Value"], &mut widths, formats)?;

    let ids: Vec<String> = completed(docs).map(|d| d.id.to_string()).collect();
    let rows: Vec<(String, String)> = vec![
        (
            "Column Ordering".to_string(),
            "first seen ascending, then frequency descending, then name".to_string(),
        ),
        ("Source Documents".to_string(), ids.join(", ")),
        ("Column Count".to_string(), columns.len().to_string()),
        ("Columns".to_string(), columns.join(", ")),
    ];

    for (index, (property, value)) in rows.iter().enumerate() {
        let row = index as u32 + 1;
        sheet.write_string(row, 0, property)?;
        sheet.write_string(row, 1, value)?;
        widths.note(0, property);
        widths.note(1, value);
    }
    widths.apply(sheet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentStatus, ProcessingMeta};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn completed_doc(id: i64, fields: &[(&str, Value)]) -> Document {
        let now = Utc::now();
        Document {
            id,
            content_hash: format!("hash{id}"),
            original_filename: format!("doc{id}.pdf"),
            stored_filename: format!("ha/hash{id}.pdf"),
            byte_len: 1000,
            page_count: Some(1),
            status: DocumentStatus::Completed,
            progress: 1.0,
            attempt: 1,
            extracted_fields: Some(
                fields
                    .iter()
                    .map(|(n, v)| (n.to_string(), v.clone()))
                    .collect(),
            ),
            confidence_scores: Some(
                fields.iter().map(|(n, _)| (n.to_string(), 0.9)).collect(),
            ),
            processing_meta: Some(ProcessingMeta::default()),
            error_message: None,
            current_worker: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn template_projection_orders_by_first_seen_then_frequency_then_name() {
        // A: {invoice_number, total}; B: {invoice_number, date, total};
        // C: {name, total}.
        let a = completed_doc(
            1,
            &[
                ("invoice_number", Value::Text("A-1".into())),
                ("total", Value::Number(10.0)),
            ],
        );
        let b = completed_doc(
            2,
            &[
                ("invoice_number", Value::Text("B-1".into())),
                ("date", Value::Text("2024-01-01".into())),
                ("total", Value::Number(20.0)),
            ],
        );
        let c = completed_doc(
            3,
            &[
                ("name", Value::Text("Carol".into())),
                ("total", Value::Number(30.0)),
            ],
        );

        let columns = template_projection(&[a, b, c]);
        assert_eq!(columns, vec!["invoice_number", "total", "date", "name"]);
    }

    #[test]
    fn template_projection_is_deterministic_and_skips_incomplete() {
        let mut pending = completed_doc(9, &[("ghost", Value::Bool(true))]);
        pending.extracted_fields = None;
        pending.status = DocumentStatus::Pending;

        let a = completed_doc(1, &[("x", Value::Number(1.0))]);
        let docs = vec![pending, a];

        let first = template_projection(&docs);
        let second = template_projection(&docs);
        assert_eq!(first, vec!["x"]);
        assert_eq!(first, second);
    }

    #[test]
    fn single_workbook_is_valid_zip() {
        let mut doc = completed_doc(
            1,
            &[
                ("invoice_number", Value::Text("INV-7".into())),
                ("invoice_date", Value::Date(chrono::NaiveDate::from_ymd_opt(2024, 5, 1).unwrap())),
                ("total", Value::Number(99.0)),
                ("paid", Value::Bool(true)),
                (
                    "line_items",
                    Value::Array(vec![Value::Text("widget".into())]),
                ),
            ],
        );
        let meta = doc.processing_meta.as_mut().unwrap();
        meta.model = Some("test-model".to_string());
        meta.duration_ms = Some(1234);

        let bytes = WorkbookWriter::single(&doc, true).unwrap();
        // xlsx is a zip container.
        assert_eq!(&bytes[..2], b"PK");
        assert!(bytes.len() > 500);
    }

    #[test]
    fn batch_workbook_handles_multiple_documents() {
        let a = completed_doc(1, &[("total", Value::Number(1.0))]);
        let b = completed_doc(2, &[("total", Value::Number(2.0))]);
        let bytes = WorkbookWriter::batch(&[a, b]).unwrap();
        assert_eq!(&bytes[..2], b"PK");
    }

    #[test]
    fn template_workbook_builds_from_mixed_set() {
        let a = completed_doc(1, &[("total", Value::Number(1.0))]);
        let mut failed = completed_doc(2, &[("total", Value::Number(2.0))]);
        failed.extracted_fields = None;
        failed.status = DocumentStatus::Failed;

        let bytes = WorkbookWriter::template(&[a, failed]).unwrap();
        assert_eq!(&bytes[..2], b"PK");
    }

    #[test]
    fn ordered_fields_puts_highest_confidence_first() {
        let mut doc = completed_doc(1, &[("aa", Value::Number(1.0)), ("zz", Value::Number(2.0))]);
        let scores: &mut BTreeMap<String, f64> = doc.confidence_scores.as_mut().unwrap();
        scores.insert("aa".to_string(), 0.2);
        scores.insert("zz".to_string(), 0.95);

        let rows = ordered_fields(&doc);
        assert_eq!(rows[0].0, "zz");
        assert_eq!(rows[1].0, "aa");
    }
}
