//! Document repository for SQLite persistence.
//!
//! Rows here are the source of truth for document state. Every mutation
//! a worker performs is a conditional write keyed on `(id, attempt)` so
//! a stale worker cannot clobber a newer attempt.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, Row, TransactionBehavior};
use tracing::{debug, info};

use super::queue::JobQueue;
use super::{
    connect, format_ts, now_ts, parse_datetime, to_option, Job, JobOptions, RepositoryError,
    Result,
};
use crate::models::{Document, DocumentStatus, NewDocument, ProcessingMeta, Value};

const DOCUMENT_COLUMNS: &str = "id, content_hash, original_filename, stored_filename, byte_len, \
     page_count, status, progress, attempt, extracted_fields, confidence_scores, \
     processing_meta, error_message, current_worker, created_at, updated_at";

/// Outcome of `start_attempt`: the job now driving the document.
#[derive(Debug, Clone)]
pub struct StartedAttempt {
    pub job: Job,
    /// False when an existing queued job was reused (no-op restart).
    pub newly_queued: bool,
}

/// SQLite-backed document repository.
pub struct DocumentRepository {
    db_path: PathBuf,
}

impl DocumentRepository {
    pub fn new(db_path: &Path) -> Result<Self> {
        let repo = Self {
            db_path: db_path.to_path_buf(),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    fn connect(&self) -> Result<Connection> {
        connect(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content_hash TEXT NOT NULL UNIQUE,
                original_filename TEXT NOT NULL,
                stored_filename TEXT NOT NULL,
                byte_len INTEGER NOT NULL,
                page_count INTEGER,
                status TEXT NOT NULL DEFAULT 'pending',
                progress REAL NOT NULL DEFAULT 0,
                attempt INTEGER NOT NULL DEFAULT 0,
                extracted_fields TEXT,
                confidence_scores TEXT,
                processing_meta TEXT,
                error_message TEXT,
                current_worker TEXT,
                heartbeat_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tombstones (
                document_id INTEGER PRIMARY KEY,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_status
                ON documents(status);
            CREATE INDEX IF NOT EXISTS idx_documents_created
                ON documents(created_at DESC, id DESC);
        "#,
        )?;
        Ok(())
    }

    /// Insert a fresh document in `Pending`.
    pub fn insert(&self, new: &NewDocument) -> Result<Document> {
        let conn = self.connect()?;
        let now = now_ts();
        conn.execute(
            r#"
            INSERT INTO documents (content_hash, original_filename, stored_filename,
                                   byte_len, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
            params![
                new.content_hash,
                new.original_filename,
                new.stored_filename,
                new.byte_len as i64,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(document_id = id, hash = %new.content_hash, "inserted document");
        self.get(id)?
            .ok_or_else(|| RepositoryError::NotFound(format!("document {id}")))
    }

    pub fn get(&self, id: i64) -> Result<Option<Document>> {
        let conn = self.connect()?;
        Self::get_with(&conn, id)
    }

    fn get_with(conn: &Connection, id: i64) -> Result<Option<Document>> {
        let row = to_option(conn.query_row(
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"),
            params![id],
            map_document,
        ))?;
        row.transpose()
    }

    pub fn get_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let conn = self.connect()?;
        let row = to_option(conn.query_row(
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE content_hash = ?1"),
            params![content_hash],
            map_document,
        ))?;
        row.transpose()
    }

    /// Page of documents ordered newest-first with a stable id tiebreaker.
    pub fn list(
        &self,
        skip: u32,
        limit: u32,
        status: Option<DocumentStatus>,
    ) -> Result<Vec<Document>> {
        let conn = self.connect()?;
        let mut out = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE status = ?1 \
                     ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3"
                ))?;
                let rows = stmt.query_map(params![status.as_str(), limit, skip], map_document)?;
                for row in rows {
                    out.push(row??);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM documents \
                     ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2"
                ))?;
                let rows = stmt.query_map(params![limit, skip], map_document)?;
                for row in rows {
                    out.push(row??);
                }
            }
        }
        Ok(out)
    }

    pub fn count(&self, status: Option<DocumentStatus>) -> Result<u64> {
        let conn = self.connect()?;
        let count: i64 = match status {
            Some(status) => conn.query_row(
                "SELECT COUNT(*) FROM documents WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?,
        };
        Ok(count as u64)
    }

    /// Document counts per status, for the health endpoint.
    pub fn counts_by_status(&self) -> Result<BTreeMap<String, u64>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM documents GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (status, count) = row?;
            out.insert(status, count as u64);
        }
        Ok(out)
    }

    /// Begin a new processing attempt: reset state to `Pending` and
    /// enqueue the job, in one transaction.
    ///
    /// A document already holding a queued job restarts as a no-op; a
    /// document currently `Processing` is a conflict.
    pub fn start_attempt(&self, id: i64, options: &JobOptions) -> Result<StartedAttempt> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let doc = Self::get_with(&tx, id)?
            .ok_or_else(|| RepositoryError::NotFound(format!("document {id}")))?;

        if doc.status == DocumentStatus::Processing {
            return Err(RepositoryError::Conflict(format!(
                "document {id} is already processing"
            )));
        }

        if let Some(existing) = JobQueue::active_job(&tx, id)? {
            tx.commit()?;
            return Ok(StartedAttempt {
                job: existing,
                newly_queued: false,
            });
        }

        let attempt = doc.attempt + 1;
        tx.execute(
            r#"
            UPDATE documents
            SET status = 'pending', progress = 0, attempt = ?1,
                error_message = NULL, current_worker = NULL, heartbeat_at = NULL,
                updated_at = ?2
            WHERE id = ?3
            "#,
            params![attempt, now_ts(), id],
        )?;
        let job = JobQueue::insert_job(&tx, id, attempt, options)?;
        tx.commit()?;

        info!(document_id = id, attempt, "queued processing attempt");
        Ok(StartedAttempt {
            job,
            newly_queued: true,
        })
    }

    /// Conditional `Pending -> Processing` transition for one attempt.
    /// Returns false when another worker won the race.
    pub fn begin_processing(&self, id: i64, attempt: i64, worker: &str) -> Result<bool> {
        let conn = self.connect()?;
        let now = now_ts();
        let updated = conn.execute(
            r#"
            UPDATE documents
            SET status = 'processing', current_worker = ?1, heartbeat_at = ?2,
                progress = 0, updated_at = ?2
            WHERE id = ?3 AND attempt = ?4 AND status = 'pending' AND current_worker IS NULL
            "#,
            params![worker, now, id, attempt],
        )?;
        Ok(updated == 1)
    }

    /// Monotonic progress update within one attempt.
    pub fn set_progress(&self, id: i64, attempt: i64, progress: f64) -> Result<bool> {
        let conn = self.connect()?;
        let now = now_ts();
        let updated = conn.execute(
            r#"
            UPDATE documents
            SET progress = MAX(progress, ?1), heartbeat_at = ?2, updated_at = ?2
            WHERE id = ?3 AND attempt = ?4 AND status = 'processing'
            "#,
            params![progress.clamp(0.0, 1.0), now, id, attempt],
        )?;
        Ok(updated == 1)
    }

    pub fn set_page_count(&self, id: i64, attempt: i64, page_count: u32) -> Result<bool> {
        let conn = self.connect()?;
        let updated = conn.execute(
            "UPDATE documents SET page_count = ?1, updated_at = ?2 \
             WHERE id = ?3 AND attempt = ?4 AND status = 'processing'",
            params![page_count, now_ts(), id, attempt],
        )?;
        Ok(updated == 1)
    }

    pub fn heartbeat(&self, id: i64, attempt: i64) -> Result<bool> {
        let conn = self.connect()?;
        let updated = conn.execute(
            "UPDATE documents SET heartbeat_at = ?1 \
             WHERE id = ?2 AND attempt = ?3 AND status = 'processing'",
            params![now_ts(), id, attempt],
        )?;
        Ok(updated == 1)
    }

    /// Persist extraction results and transition to `Completed`.
    pub fn complete(
        &self,
        id: i64,
        attempt: i64,
        fields: &BTreeMap<String, Value>,
        confidences: &BTreeMap<String, f64>,
        meta: &ProcessingMeta,
    ) -> Result<bool> {
        let conn = self.connect()?;
        let updated = conn.execute(
            r#"
            UPDATE documents
            SET status = 'completed', progress = 1.0,
                extracted_fields = ?1, confidence_scores = ?2, processing_meta = ?3,
                error_message = NULL, current_worker = NULL, updated_at = ?4
            WHERE id = ?5 AND attempt = ?6 AND status = 'processing'
            "#,
            params![
                serde_json::to_string(fields)?,
                serde_json::to_string(confidences)?,
                serde_json::to_string(meta)?,
                now_ts(),
                id,
                attempt,
            ],
        )?;
        Ok(updated == 1)
    }

    /// Transition to `Failed` with a descriptive message.
    ///
    /// Accepts both `processing` (pipeline failure) and `pending`
    /// (delivery budget spent before another claim) rows.
    pub fn fail(
        &self,
        id: i64,
        attempt: i64,
        message: &str,
        meta: Option<&ProcessingMeta>,
    ) -> Result<bool> {
        let conn = self.connect()?;
        let meta_json = meta.map(serde_json::to_string).transpose()?;
        let updated = conn.execute(
            r#"
            UPDATE documents
            SET status = 'failed', error_message = ?1,
                processing_meta = COALESCE(?2, processing_meta),
                current_worker = NULL, updated_at = ?3
            WHERE id = ?4 AND attempt = ?5 AND status IN ('pending', 'processing')
            "#,
            params![message, meta_json, now_ts(), id, attempt],
        )?;
        Ok(updated == 1)
    }

    /// Hand a `Processing` document back to `Pending` after a transient
    /// failure so a later job delivery can claim it again.
    pub fn release_processing(&self, id: i64, attempt: i64) -> Result<bool> {
        let conn = self.connect()?;
        let updated = conn.execute(
            r#"
            UPDATE documents
            SET status = 'pending', current_worker = NULL, heartbeat_at = NULL, updated_at = ?1
            WHERE id = ?2 AND attempt = ?3 AND status = 'processing'
            "#,
            params![now_ts(), id, attempt],
        )?;
        Ok(updated == 1)
    }

    /// Remove a document: tombstone it, cancel its unclaimed job, delete
    /// the row. Returns the deleted document so callers can drop the blob.
    pub fn delete(&self, id: i64) -> Result<Option<Document>> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(doc) = Self::get_with(&tx, id)? else {
            tx.commit()?;
            return Ok(None);
        };

        let now = now_ts();
        tx.execute(
            "INSERT OR IGNORE INTO tombstones (document_id, created_at) VALUES (?1, ?2)",
            params![id, now],
        )?;
        // A claimed job stays live so the worker can observe the tombstone
        // and ack; an unclaimed job is cancelled here.
        tx.execute(
            r#"
            UPDATE jobs SET done = 1
            WHERE document_id = ?1 AND done = 0
              AND (lease_token IS NULL OR lease_expires_at <= ?2)
            "#,
            params![id, now],
        )?;
        tx.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        tx.commit()?;

        info!(document_id = id, "deleted document");
        Ok(Some(doc))
    }

    /// Whether in-flight work for this document should abort.
    ///
    /// True when the row was deleted or a tombstone exists.
    pub fn is_cancelled(&self, id: i64) -> Result<bool> {
        let conn = self.connect()?;
        let tombstoned: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tombstones WHERE document_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if tombstoned > 0 {
            return Ok(true);
        }
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(exists == 0)
    }

    /// Reset `Processing` rows whose worker heartbeat went stale.
    /// Returns the affected document ids so their jobs can be released.
    pub fn reset_stale(&self, heartbeat_timeout: Duration) -> Result<Vec<i64>> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let cutoff = format_ts(Utc::now() - heartbeat_timeout);

        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM documents \
                 WHERE status = 'processing' AND (heartbeat_at IS NULL OR heartbeat_at < ?1)",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        for id in &ids {
            tx.execute(
                "UPDATE documents SET status = 'pending', current_worker = NULL, \
                 heartbeat_at = NULL, updated_at = ?1 WHERE id = ?2",
                params![now_ts(), id],
            )?;
        }
        tx.commit()?;

        if !ids.is_empty() {
            info!(count = ids.len(), "reset stale processing documents");
        }
        Ok(ids)
    }
}

fn map_document(row: &Row<'_>) -> rusqlite::Result<Result<Document>> {
    Ok(build_document(row))
}

fn build_document(row: &Row<'_>) -> Result<Document> {
    let status_raw: String = row.get(6)?;
    let extracted: Option<String> = row.get(9)?;
    let confidences: Option<String> = row.get(10)?;
    let meta: Option<String> = row.get(11)?;
    let created_at: String = row.get(14)?;
    let updated_at: String = row.get(15)?;

    Ok(Document {
        id: row.get(0)?,
        content_hash: row.get(1)?,
        original_filename: row.get(2)?,
        stored_filename: row.get(3)?,
        byte_len: row.get::<_, i64>(4)? as u64,
        page_count: row.get::<_, Option<i64>>(5)?.map(|n| n as u32),
        status: DocumentStatus::from_str(&status_raw).unwrap_or(DocumentStatus::Failed),
        progress: row.get(7)?,
        attempt: row.get(8)?,
        extracted_fields: extracted.as_deref().map(serde_json::from_str).transpose()?,
        confidence_scores: confidences.as_deref().map(serde_json::from_str).transpose()?,
        processing_meta: meta.as_deref().map(serde_json::from_str).transpose()?,
        error_message: row.get(12)?,
        current_worker: row.get(13)?,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}
