//! Durable job queue over SQLite.
//!
//! FIFO per visible set, at-least-once delivery through time-bounded
//! leases, per-job delivery counters. A partial unique index keeps at
//! most one live job per document.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row, TransactionBehavior};
use tracing::debug;

use super::{connect, format_ts, now_ts, parse_datetime, to_option, RepositoryError, Result};
use crate::models::SchemaChoice;

/// Default ceiling on deliveries before a job is abandoned.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default lease length granted on claim.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

/// Options attached to a processing job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    pub schema: SchemaChoice,
    pub template_mode: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            schema: SchemaChoice::Auto,
            template_mode: false,
        }
    }
}

/// A queued unit of work: advance one document through the pipeline.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub document_id: i64,
    /// Document attempt this job drives; guards stale-worker writes.
    pub doc_attempt: i64,
    /// Deliveries consumed so far (including the current one, once claimed).
    pub deliveries: u32,
    pub options: JobOptions,
    pub enqueued_at: DateTime<Utc>,
}

/// Exclusive, time-bounded right to process one job.
#[derive(Debug, Clone)]
pub struct Lease {
    pub token: String,
    pub job: Job,
}

/// Result of a negative acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// The job went back to the visible set.
    Requeued,
    /// Delivery budget spent; the job was removed.
    Exhausted,
}

/// SQLite-backed job queue.
pub struct JobQueue {
    db_path: PathBuf,
    max_attempts: u32,
    lease_duration: Duration,
}

impl JobQueue {
    pub fn new(db_path: &Path) -> Result<Self> {
        let queue = Self {
            db_path: db_path.to_path_buf(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lease_duration: DEFAULT_LEASE,
        };
        queue.init_schema()?;
        Ok(queue)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    fn connect(&self) -> Result<Connection> {
        connect(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id INTEGER NOT NULL,
                doc_attempt INTEGER NOT NULL,
                deliveries INTEGER NOT NULL DEFAULT 0,
                schema_choice TEXT NOT NULL,
                template_mode INTEGER NOT NULL DEFAULT 0,
                enqueued_at TEXT NOT NULL,
                visible_at TEXT NOT NULL,
                lease_token TEXT,
                lease_expires_at TEXT,
                done INTEGER NOT NULL DEFAULT 0
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_active_document
                ON jobs(document_id) WHERE done = 0;
            CREATE INDEX IF NOT EXISTS idx_jobs_ready
                ON jobs(done, visible_at);
        "#,
        )?;
        Ok(())
    }

    /// Insert a job row inside an existing transaction.
    ///
    /// Used by `DocumentRepository::start_attempt` so the pending
    /// transition and the enqueue commit together.
    pub(crate) fn insert_job(
        conn: &Connection,
        document_id: i64,
        doc_attempt: i64,
        options: &JobOptions,
    ) -> Result<Job> {
        let now = now_ts();
        conn.execute(
            r#"
            INSERT INTO jobs (document_id, doc_attempt, schema_choice, template_mode,
                              enqueued_at, visible_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
            params![
                document_id,
                doc_attempt,
                options.schema.encode(),
                options.template_mode as i64,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Job {
            id,
            document_id,
            doc_attempt,
            deliveries: 0,
            options: options.clone(),
            enqueued_at: parse_datetime(&now),
        })
    }

    /// Fetch the live job for a document, if any.
    pub(crate) fn active_job(conn: &Connection, document_id: i64) -> Result<Option<Job>> {
        to_option(conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE document_id = ?1 AND done = 0"),
            params![document_id],
            map_job,
        ))
    }

    /// Durably enqueue a job. Returns the existing live job unchanged if
    /// the document already has one.
    pub fn enqueue(&self, document_id: i64, doc_attempt: i64, options: &JobOptions) -> Result<Job> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(existing) = Self::active_job(&tx, document_id)? {
            tx.commit()?;
            return Ok(existing);
        }
        let job = Self::insert_job(&tx, document_id, doc_attempt, options)?;
        tx.commit()?;
        Ok(job)
    }

    /// Claim the next visible job, without blocking.
    pub fn try_claim(&self) -> Result<Option<Lease>> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_ts();

        let candidate = to_option(tx.query_row(
            &format!(
                r#"
                SELECT {JOB_COLUMNS} FROM jobs
                WHERE done = 0 AND visible_at <= ?1
                  AND (lease_token IS NULL OR lease_expires_at <= ?1)
                ORDER BY enqueued_at ASC, id ASC
                LIMIT 1
                "#
            ),
            params![now],
            map_job,
        ))?;

        let Some(mut job) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        let token = uuid::Uuid::new_v4().to_string();
        let expires = format_ts(Utc::now() + self.lease_duration);
        let updated = tx.execute(
            r#"
            UPDATE jobs
            SET lease_token = ?1, lease_expires_at = ?2, deliveries = deliveries + 1
            WHERE id = ?3 AND done = 0
              AND (lease_token IS NULL OR lease_expires_at <= ?4)
            "#,
            params![token, expires, job.id, now],
        )?;
        tx.commit()?;

        if updated == 1 {
            job.deliveries += 1;
            debug!(job_id = job.id, document_id = job.document_id, "claimed job");
            Ok(Some(Lease { token, job }))
        } else {
            Ok(None)
        }
    }

    /// Claim the next job, waiting up to `timeout` for one to appear.
    pub async fn claim(&self, timeout: Duration) -> Result<Option<Lease>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(lease) = self.try_claim()? {
                return Ok(Some(lease));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Remove the leased job.
    pub fn ack(&self, token: &str) -> Result<bool> {
        let conn = self.connect()?;
        let updated = conn.execute(
            "UPDATE jobs SET done = 1 WHERE lease_token = ?1 AND done = 0",
            params![token],
        )?;
        Ok(updated == 1)
    }

    /// Return the leased job to the visible set, optionally after a delay.
    ///
    /// Once the delivery budget is spent the nack is promoted to removal
    /// and `Exhausted` is returned; the caller is responsible for marking
    /// the document failed.
    pub fn nack(&self, token: &str, delay: Option<Duration>) -> Result<NackOutcome> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = to_option(tx.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE lease_token = ?1 AND done = 0"),
            params![token],
            map_job,
        ))?;
        let Some(job) = job else {
            tx.commit()?;
            return Err(RepositoryError::NotFound(format!("lease {token}")));
        };

        if job.deliveries >= self.max_attempts {
            tx.execute("UPDATE jobs SET done = 1 WHERE id = ?1", params![job.id])?;
            tx.commit()?;
            debug!(job_id = job.id, "delivery budget spent, removing job");
            return Ok(NackOutcome::Exhausted);
        }

        let visible = format_ts(Utc::now() + delay.unwrap_or(Duration::ZERO));
        tx.execute(
            r#"
            UPDATE jobs
            SET lease_token = NULL, lease_expires_at = NULL, visible_at = ?1
            WHERE id = ?2
            "#,
            params![visible, job.id],
        )?;
        tx.commit()?;
        Ok(NackOutcome::Requeued)
    }

    /// Push the lease expiry out to `extension` from now.
    pub fn extend_lease(&self, token: &str, extension: Duration) -> Result<bool> {
        let conn = self.connect()?;
        let expires = format_ts(Utc::now() + extension);
        let updated = conn.execute(
            "UPDATE jobs SET lease_expires_at = ?1 WHERE lease_token = ?2 AND done = 0",
            params![expires, token],
        )?;
        Ok(updated == 1)
    }

    /// Current expiry of a lease.
    pub fn lease_expires(&self, token: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.connect()?;
        let raw: Option<Option<String>> = to_option(conn.query_row(
            "SELECT lease_expires_at FROM jobs WHERE lease_token = ?1 AND done = 0",
            params![token],
            |row| row.get(0),
        ))?;
        Ok(raw.flatten().map(|s| parse_datetime(&s)))
    }

    /// Make a document's live job claimable again (stale-worker recovery).
    pub fn release_document(&self, document_id: i64) -> Result<bool> {
        let conn = self.connect()?;
        let updated = conn.execute(
            r#"
            UPDATE jobs
            SET lease_token = NULL, lease_expires_at = NULL, visible_at = ?1
            WHERE document_id = ?2 AND done = 0
            "#,
            params![now_ts(), document_id],
        )?;
        Ok(updated > 0)
    }

    /// Number of live jobs.
    pub fn depth(&self) -> Result<u64> {
        let conn = self.connect()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM jobs WHERE done = 0", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

const JOB_COLUMNS: &str =
    "id, document_id, doc_attempt, deliveries, schema_choice, template_mode, enqueued_at";

fn map_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let schema_choice: String = row.get(4)?;
    let enqueued_at: String = row.get(6)?;
    Ok(Job {
        id: row.get(0)?,
        document_id: row.get(1)?,
        doc_attempt: row.get(2)?,
        deliveries: row.get::<_, i64>(3)? as u32,
        options: JobOptions {
            schema: SchemaChoice::decode(&schema_choice),
            template_mode: row.get::<_, i64>(5)? != 0,
        },
        enqueued_at: parse_datetime(&enqueued_at),
    })
}
