//! Spreadsheet export operations.

use std::sync::Arc;

use super::ServiceError;
use crate::models::{Document, DocumentStatus};
use crate::repository::DocumentRepository;
use crate::workbook::WorkbookWriter;

/// Builds downloadable workbooks from stored extraction results.
pub struct ExportService {
    repo: Arc<DocumentRepository>,
}

impl ExportService {
    pub fn new(repo: Arc<DocumentRepository>) -> Self {
        Self { repo }
    }

    fn fetch(&self, id: i64) -> Result<Document, ServiceError> {
        self.repo
            .get(id)
            .map_err(|e| ServiceError::Storage(e.to_string()))?
            .ok_or(ServiceError::NotFound(id))
    }

    /// Workbook for one completed document.
    pub fn single(&self, id: i64, include_metadata: bool) -> Result<(Vec<u8>, String), ServiceError> {
        let doc = self.fetch(id)?;
        if doc.status != DocumentStatus::Completed {
            return Err(ServiceError::InvalidState(format!(
                "document {id} is {}, not completed",
                doc.status.as_str()
            )));
        }
        let bytes = WorkbookWriter::single(&doc, include_metadata)?;
        Ok((bytes, format!("document_{id}.xlsx")))
    }

    /// Workbook with one sheet per completed document plus a combined
    /// sheet. Every requested id must exist.
    pub fn batch(&self, ids: &[i64]) -> Result<(Vec<u8>, String), ServiceError> {
        let docs = self.completed_set(ids)?;
        let bytes = WorkbookWriter::batch(&docs)?;
        Ok((bytes, "documents_batch.xlsx".to_string()))
    }

    /// Template-mode aggregation of the completed documents in the set.
    pub fn template(&self, ids: &[i64]) -> Result<(Vec<u8>, String), ServiceError> {
        let docs = self.completed_set(ids)?;
        let bytes = WorkbookWriter::template(&docs)?;
        Ok((bytes, "documents_template.xlsx".to_string()))
    }

    fn completed_set(&self, ids: &[i64]) -> Result<Vec<Document>, ServiceError> {
        if ids.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "document_ids must not be empty".to_string(),
            ));
        }

        let mut completed = Vec::new();
        for &id in ids {
            let doc = self.fetch(id)?;
            if doc.status == DocumentStatus::Completed {
                completed.push(doc);
            }
        }
        if completed.is_empty() {
            return Err(ServiceError::InvalidState(
                "no completed documents in the requested set".to_string(),
            ));
        }
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewDocument, ProcessingMeta, Value};
    use crate::repository::{JobOptions, JobQueue};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn setup(dir: &std::path::Path) -> (Arc<DocumentRepository>, JobQueue, ExportService) {
        let db = dir.join("export.db");
        let repo = Arc::new(DocumentRepository::new(&db).unwrap());
        let queue = JobQueue::new(&db).unwrap();
        let export = ExportService::new(Arc::clone(&repo));
        (repo, queue, export)
    }

    fn complete_one(repo: &DocumentRepository, hash: &str, fields: &[(&str, Value)]) -> i64 {
        let doc = repo
            .insert(&NewDocument {
                content_hash: hash.to_string(),
                original_filename: format!("{hash}.pdf"),
                stored_filename: format!("{}/{hash}.pdf", &hash[..2]),
                byte_len: 100,
            })
            .unwrap();
        let started = repo.start_attempt(doc.id, &JobOptions::default()).unwrap();
        let attempt = started.job.doc_attempt;
        repo.begin_processing(doc.id, attempt, "w").unwrap();

        let fields: BTreeMap<String, Value> = fields
            .iter()
            .map(|(n, v)| (n.to_string(), v.clone()))
            .collect();
        let confidences = fields.keys().map(|k| (k.clone(), 0.8)).collect();
        repo.complete(doc.id, attempt, &fields, &confidences, &ProcessingMeta::default())
            .unwrap();
        doc.id
    }

    #[test]
    fn single_requires_completed() {
        let dir = tempdir().unwrap();
        let (repo, _queue, export) = setup(dir.path());

        let pending = repo
            .insert(&NewDocument {
                content_hash: "pending".to_string(),
                original_filename: "p.pdf".to_string(),
                stored_filename: "pe/pending.pdf".to_string(),
                byte_len: 10,
            })
            .unwrap();

        let err = export.single(pending.id, true).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
        assert!(matches!(export.single(404, true), Err(ServiceError::NotFound(404))));
    }

    #[test]
    fn single_produces_workbook() {
        let dir = tempdir().unwrap();
        let (repo, _queue, export) = setup(dir.path());
        let id = complete_one(&repo, "aaaa", &[("total", Value::Number(5.0))]);

        let (bytes, filename) = export.single(id, true).unwrap();
        assert_eq!(&bytes[..2], b"PK");
        assert_eq!(filename, format!("document_{id}.xlsx"));
    }

    #[test]
    fn batch_skips_incomplete_but_requires_existence() {
        let dir = tempdir().unwrap();
        let (repo, _queue, export) = setup(dir.path());
        let done = complete_one(&repo, "bbbb", &[("total", Value::Number(1.0))]);
        let pending = repo
            .insert(&NewDocument {
                content_hash: "cccc".to_string(),
                original_filename: "c.pdf".to_string(),
                stored_filename: "cc/cccc.pdf".to_string(),
                byte_len: 10,
            })
            .unwrap();

        assert!(export.batch(&[done, pending.id]).is_ok());
        assert!(matches!(
            export.batch(&[done, 12345]),
            Err(ServiceError::NotFound(12345))
        ));
        assert!(matches!(
            export.batch(&[pending.id]),
            Err(ServiceError::InvalidState(_))
        ));
        assert!(matches!(
            export.batch(&[]),
            Err(ServiceError::InvalidRequest(_))
        ));
    }

    #[test]
    fn template_aggregates_completed_documents() {
        let dir = tempdir().unwrap();
        let (repo, _queue, export) = setup(dir.path());
        let a = complete_one(
            &repo,
            "dddd",
            &[("invoice_number", Value::Text("1".into())), ("total", Value::Number(1.0))],
        );
        let b = complete_one(
            &repo,
            "eeee",
            &[("name", Value::Text("x".into())), ("total", Value::Number(2.0))],
        );

        let (bytes, filename) = export.template(&[a, b]).unwrap();
        assert_eq!(&bytes[..2], b"PK");
        assert_eq!(filename, "documents_template.xlsx");
    }
}
