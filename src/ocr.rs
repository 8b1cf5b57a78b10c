//! OCR fallback via the Tesseract command-line binary.
//!
//! When the vision model gives up on a page, its text is recovered with
//! plain OCR and stored under a single `raw_text` field at reduced
//! confidence.

use std::path::Path;
use std::process::Command;

use tempfile::TempDir;
use thiserror::Error;

/// Confidence assigned to OCR-recovered text.
pub const OCR_CONFIDENCE: f64 = 0.3;

/// Field name OCR-recovered text is stored under.
pub const OCR_TEXT_FIELD: &str = "raw_text";

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("OCR failed: {0}")]
    OcrFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Recovers text from a page image.
pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, png: &[u8]) -> Result<String, OcrError>;
}

/// Tesseract OCR backend.
pub struct TesseractFallback {
    language: String,
}

impl TesseractFallback {
    pub fn new() -> Self {
        Self {
            language: "eng".to_string(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    fn run_tesseract(&self, image_path: &Path) -> Result<String, OcrError> {
        let output = Command::new("tesseract")
            .arg(image_path)
            .arg("stdout")
            .args(["-l", &self.language])
            .output();

        match output {
            Ok(output) => {
                if output.status.success() {
                    Ok(String::from_utf8_lossy(&output.stdout).to_string())
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    Err(OcrError::OcrFailed(format!("tesseract failed: {stderr}")))
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(OcrError::BackendNotAvailable(
                    "tesseract not found (install tesseract-ocr)".to_string(),
                ))
            }
            Err(e) => Err(OcrError::Io(e)),
        }
    }
}

impl Default for TesseractFallback {
    fn default() -> Self {
        Self::new()
    }
}

impl TextRecognizer for TesseractFallback {
    fn recognize(&self, png: &[u8]) -> Result<String, OcrError> {
        let temp = TempDir::new()?;
        let image_path = temp.path().join("page.png");
        std::fs::write(&image_path, png)?;

        let text = self.run_tesseract(&image_path)?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(OcrError::OcrFailed("no text recognized".to_string()));
        }
        Ok(trimmed.to_string())
    }
}
