//! Service layer: the request-driven facade over repositories, storage,
//! and the queue. HTTP handlers stay thin; the rules live here.

mod documents;
mod export;

pub use documents::{
    BatchProcessItem, DocumentService, ProcessAck, ProcessOptions, UploadOutcome,
};
pub use export::ExportService;

use thiserror::Error;

use crate::repository::RepositoryError;

/// Errors surfaced to API callers.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid file: {0}")]
    InvalidFile(String),

    #[error("Upload of {size} bytes exceeds limit of {limit} bytes")]
    UploadTooLarge { size: u64, limit: u64 },

    #[error("Unknown schema: {0}")]
    UnknownSchema(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Document {0} not found")]
    NotFound(i64),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Rate limited by the vision service")]
    RateLimited,

    #[error("Workbook error: {0}")]
    Workbook(#[from] rust_xlsxwriter::XlsxError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ServiceError {
    /// Fold repository errors into the caller-facing taxonomy.
    fn from_repository(e: RepositoryError, document_id: i64) -> Self {
        match e {
            RepositoryError::NotFound(_) => Self::NotFound(document_id),
            RepositoryError::Conflict(message) => Self::InvalidState(message),
            other => Self::Storage(other.to_string()),
        }
    }
}
