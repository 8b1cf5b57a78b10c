//! Document model: the persistent record of one uploaded PDF and its
//! processing state.
//!
//! Documents are content-addressed: the SHA-256 hash of the stored bytes
//! is unique, so re-uploading identical bytes resolves to the existing
//! record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::Value;

/// Processing status of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions within an attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// How a page's extraction was ultimately obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Vision,
    OcrFallback,
    Error,
}

impl PageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vision => "vision",
            Self::OcrFallback => "ocr_fallback",
            Self::Error => "error",
        }
    }
}

/// Processing metadata captured by the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingMeta {
    /// Vision model identifier used for extraction.
    pub model: Option<String>,
    /// Identity of the worker that ran the attempt.
    pub worker: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Outcome per page, keyed by 1-based page number.
    #[serde(default)]
    pub page_statuses: BTreeMap<u32, PageStatus>,
    /// Non-fatal issues recorded along the way.
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// A document and its processing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Database row ID.
    pub id: i64,
    /// SHA-256 hash of the stored bytes.
    pub content_hash: String,
    /// Filename supplied at upload.
    pub original_filename: String,
    /// Blob-store-relative path of the stored bytes.
    pub stored_filename: String,
    /// Size in bytes.
    pub byte_len: u64,
    /// Known after rasterization.
    pub page_count: Option<u32>,
    pub status: DocumentStatus,
    /// 0.0–1.0, monotonic within one attempt.
    pub progress: f64,
    /// Attempt counter; bumped each time processing is (re)started.
    pub attempt: i64,
    pub extracted_fields: Option<BTreeMap<String, Value>>,
    pub confidence_scores: Option<BTreeMap<String, f64>>,
    pub processing_meta: Option<ProcessingMeta>,
    pub error_message: Option<String>,
    /// Worker currently holding the document, if any.
    pub current_worker: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Compute the SHA-256 hash of content.
    pub fn compute_hash(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        hex::encode(hasher.finalize())
    }

    /// Status snapshot served to clients.
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            document_id: self.id,
            status: self.status,
            progress: self.progress,
            page_count: self.page_count,
            extracted_data: self.extracted_fields.clone(),
            confidence_scores: self.confidence_scores.clone(),
            error_message: self.error_message.clone(),
        }
    }
}

/// Fields needed to insert a fresh document row.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub content_hash: String,
    pub original_filename: String,
    pub stored_filename: String,
    pub byte_len: u64,
}

/// Point-in-time view of a document's processing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub document_id: i64,
    pub status: DocumentStatus,
    pub progress: f64,
    pub page_count: Option<u32>,
    pub extracted_data: Option<BTreeMap<String, Value>>,
    pub confidence_scores: Option<BTreeMap<String, f64>>,
    pub error_message: Option<String>,
}
