//! Vision-model extraction capability.
//!
//! The pipeline consumes this through the `VisionExtractor` trait; the
//! production implementation speaks a chat-completions style HTTP API.

mod client;
mod prompts;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

pub use client::{HttpVisionExtractor, VisionConfig};
pub use prompts::{detection_prompt, extraction_prompt};

use crate::models::{Schema, Value};

/// Result of extracting one page.
#[derive(Debug, Clone, Default)]
pub struct PageExtraction {
    pub fields: BTreeMap<String, Value>,
    /// Per-field confidence in [0, 1].
    pub confidence: BTreeMap<String, f64>,
}

/// Result of schema detection against a sample page.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Detection {
    pub schema_name: String,
    pub confidence: f64,
    #[serde(default)]
    pub suggested_fields: Vec<String>,
}

/// Errors from the vision capability.
#[derive(Debug, Error)]
pub enum VisionError {
    #[error("Vision service unavailable: {0}")]
    Unavailable(String),

    #[error("Vision service rate limited")]
    RateLimited,

    #[error("Vision call timed out")]
    Timeout,

    #[error("Invalid model response: {0}")]
    InvalidResponse(String),
}

impl VisionError {
    /// Whether the failure is infrastructure-shaped (worth retrying the
    /// whole job) rather than content-shaped.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::RateLimited | Self::Timeout)
    }
}

/// Extracts structured fields from page images.
#[async_trait]
pub trait VisionExtractor: Send + Sync {
    /// Extract the schema's fields from one page image.
    async fn extract(&self, page_png: &[u8], schema: &Schema)
        -> Result<PageExtraction, VisionError>;

    /// Identify which of the named schemas fits a sample page.
    async fn detect(
        &self,
        page_png: &[u8],
        known_schemas: &[String],
        hint: Option<&str>,
    ) -> Result<Detection, VisionError>;
}
