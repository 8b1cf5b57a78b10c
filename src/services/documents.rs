//! Document lifecycle operations: upload, processing control, status,
//! deletion.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::ServiceError;
use crate::models::{Document, DocumentStatus, NewDocument, SchemaChoice, StatusSnapshot};
use crate::progress::ProgressBus;
use crate::repository::{DocumentRepository, JobOptions, JobQueue, RepositoryError};
use crate::schemas::SchemaRegistry;
use crate::storage::BlobStore;

/// Result of an upload: the document, and whether it is new.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub document: Document,
    /// False when identical bytes were already known.
    pub created: bool,
}

/// Caller-facing processing options.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessOptions {
    /// Schema name, or absent for auto-detection.
    pub schema: Option<String>,
    #[serde(default)]
    pub template_mode: bool,
}

/// Acknowledgement of a queued processing attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessAck {
    pub document_id: i64,
    pub enqueued_at: DateTime<Utc>,
    /// False when an already-queued job was reused.
    pub newly_queued: bool,
}

/// Per-document outcome of a batch enqueue.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProcessItem {
    pub document_id: i64,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Facade over upload, queueing, status, and deletion.
pub struct DocumentService {
    repo: Arc<DocumentRepository>,
    queue: Arc<JobQueue>,
    blobs: Arc<BlobStore>,
    registry: Arc<SchemaRegistry>,
    bus: ProgressBus,
    max_upload_bytes: u64,
}

impl DocumentService {
    pub fn new(
        repo: Arc<DocumentRepository>,
        queue: Arc<JobQueue>,
        blobs: Arc<BlobStore>,
        registry: Arc<SchemaRegistry>,
        bus: ProgressBus,
        max_upload_bytes: u64,
    ) -> Self {
        Self {
            repo,
            queue,
            blobs,
            registry,
            bus,
            max_upload_bytes,
        }
    }

    /// Accept an upload: size and magic-byte checks, dedup by content
    /// hash, blob write, pending row. Does not enqueue.
    pub fn upload(&self, bytes: &[u8], original_name: &str) -> Result<UploadOutcome, ServiceError> {
        if bytes.len() as u64 > self.max_upload_bytes {
            return Err(ServiceError::UploadTooLarge {
                size: bytes.len() as u64,
                limit: self.max_upload_bytes,
            });
        }
        if !is_pdf(bytes) {
            return Err(ServiceError::InvalidFile(
                "content is not a PDF".to_string(),
            ));
        }

        let hash = Document::compute_hash(bytes);
        if let Some(existing) = self
            .repo
            .get_by_hash(&hash)
            .map_err(|e| ServiceError::Storage(e.to_string()))?
        {
            return Ok(UploadOutcome {
                document: existing,
                created: false,
            });
        }

        let (hash, stored_filename) = self.blobs.put(bytes)?;
        let new = NewDocument {
            content_hash: hash.clone(),
            original_filename: original_name.to_string(),
            stored_filename,
            byte_len: bytes.len() as u64,
        };

        match self.repo.insert(&new) {
            Ok(document) => {
                info!(document_id = document.id, filename = original_name, "document uploaded");
                Ok(UploadOutcome {
                    document,
                    created: true,
                })
            }
            // A concurrent identical upload can win the insert race; the
            // content hash is unique so the winner's row is ours too.
            Err(RepositoryError::Database(_)) => {
                match self
                    .repo
                    .get_by_hash(&hash)
                    .map_err(|e| ServiceError::Storage(e.to_string()))?
                {
                    Some(existing) => Ok(UploadOutcome {
                        document: existing,
                        created: false,
                    }),
                    None => Err(ServiceError::Storage(
                        "insert failed without a duplicate row".to_string(),
                    )),
                }
            }
            Err(e) => Err(ServiceError::Storage(e.to_string())),
        }
    }

    /// Queue a processing attempt for a document.
    pub fn start_processing(
        &self,
        id: i64,
        options: &ProcessOptions,
    ) -> Result<ProcessAck, ServiceError> {
        let schema = match &options.schema {
            None => SchemaChoice::Auto,
            Some(name) => {
                if !self.registry.contains(name) {
                    return Err(ServiceError::UnknownSchema(name.clone()));
                }
                SchemaChoice::Named(name.clone())
            }
        };

        let job_options = JobOptions {
            schema,
            template_mode: options.template_mode,
        };
        let started = self
            .repo
            .start_attempt(id, &job_options)
            .map_err(|e| ServiceError::from_repository(e, id))?;

        Ok(ProcessAck {
            document_id: id,
            enqueued_at: started.job.enqueued_at,
            newly_queued: started.newly_queued,
        })
    }

    /// Queue processing for many documents; failures are reported per
    /// document rather than failing the batch.
    pub fn batch_process(
        &self,
        document_ids: &[i64],
        schema: Option<&str>,
    ) -> Vec<BatchProcessItem> {
        let options = ProcessOptions {
            schema: schema.map(|s| s.to_string()),
            template_mode: false,
        };
        document_ids
            .iter()
            .map(|&id| match self.start_processing(id, &options) {
                Ok(_) => BatchProcessItem {
                    document_id: id,
                    accepted: true,
                    error: None,
                },
                Err(e) => BatchProcessItem {
                    document_id: id,
                    accepted: false,
                    error: Some(e.to_string()),
                },
            })
            .collect()
    }

    pub fn get(&self, id: i64) -> Result<Document, ServiceError> {
        self.repo
            .get(id)
            .map_err(|e| ServiceError::Storage(e.to_string()))?
            .ok_or(ServiceError::NotFound(id))
    }

    pub fn status(&self, id: i64) -> Result<StatusSnapshot, ServiceError> {
        Ok(self.get(id)?.snapshot())
    }

    /// Current snapshot plus a live event subscription.
    ///
    /// The subscription is taken before the snapshot read so no event
    /// published in between is lost.
    pub async fn stream(
        &self,
        id: i64,
    ) -> Result<(StatusSnapshot, broadcast::Receiver<StatusSnapshot>), ServiceError> {
        // Existence check first so unknown ids don't leave channels behind.
        self.get(id)?;
        let rx = self.bus.subscribe(id).await;
        let snapshot = self.status(id)?;
        Ok((snapshot, rx))
    }

    /// Page of documents, newest first.
    pub fn list(
        &self,
        skip: u32,
        limit: u32,
        status: Option<&str>,
    ) -> Result<(Vec<Document>, u64), ServiceError> {
        let status = status
            .map(|raw| {
                DocumentStatus::from_str(raw)
                    .ok_or_else(|| ServiceError::InvalidRequest(format!("unknown status '{raw}'")))
            })
            .transpose()?;

        let limit = limit.clamp(1, 100);
        let items = self
            .repo
            .list(skip, limit, status)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let total = self
            .repo
            .count(status)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        Ok((items, total))
    }

    /// Delete a document, its blob, and its queued work. In-flight
    /// processing observes the tombstone and aborts.
    pub async fn delete(&self, id: i64) -> Result<(), ServiceError> {
        let Some(doc) = self
            .repo
            .delete(id)
            .map_err(|e| ServiceError::Storage(e.to_string()))?
        else {
            return Err(ServiceError::NotFound(id));
        };

        if let Err(e) = self.blobs.remove(&doc.content_hash) {
            warn!(document_id = id, error = %e, "blob removal failed");
        }

        // Close any live status streams with a terminal event.
        self.bus
            .publish(StatusSnapshot {
                document_id: id,
                status: DocumentStatus::Failed,
                progress: doc.progress,
                page_count: doc.page_count,
                extracted_data: None,
                confidence_scores: None,
                error_message: Some("Cancelled".to_string()),
            })
            .await;
        Ok(())
    }

    /// Queue depth and document counts for the health surface.
    pub fn health(&self) -> Result<(u64, std::collections::BTreeMap<String, u64>), ServiceError> {
        let depth = self
            .queue
            .depth()
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        let counts = self
            .repo
            .counts_by_status()
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        Ok((depth, counts))
    }
}

/// PDF magic-byte check.
fn is_pdf(bytes: &[u8]) -> bool {
    infer::get(bytes)
        .map(|kind| kind.mime_type() == "application/pdf")
        .unwrap_or(false)
}
