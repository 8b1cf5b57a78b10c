//! Pipeline error classification.

use thiserror::Error;

/// Failures that end the document's processing for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    DocumentTooLarge,
    Unreadable,
    AllPagesFailedExtraction,
    Timeout,
    Cancelled,
}

impl TerminalKind {
    /// Stable name stored as the document's error message.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentTooLarge => "DocumentTooLarge",
            Self::Unreadable => "Unreadable",
            Self::AllPagesFailedExtraction => "AllPagesFailedExtraction",
            Self::Timeout => "Timeout",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// Failures worth re-delivering the job for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryableKind {
    VisionUnavailable,
    VisionRateLimited,
    StoreUnavailable,
}

impl RetryableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VisionUnavailable => "VisionUnavailable",
            Self::VisionRateLimited => "VisionRateLimited",
            Self::StoreUnavailable => "StoreUnavailable",
        }
    }
}

/// A classified stage failure.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{} ({message})", .kind.as_str())]
    Retryable { kind: RetryableKind, message: String },

    #[error("{} ({message})", .kind.as_str())]
    Terminal { kind: TerminalKind, message: String },
}

impl StageError {
    pub fn terminal(kind: TerminalKind, message: impl Into<String>) -> Self {
        Self::Terminal {
            kind,
            message: message.into(),
        }
    }

    pub fn retryable(kind: RetryableKind, message: impl Into<String>) -> Self {
        Self::Retryable {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::terminal(TerminalKind::Cancelled, "document was deleted")
    }
}
