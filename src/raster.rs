//! PDF rasterization via Poppler's pdftoppm.
//!
//! Pages are rendered to PNG through a `pdftoppm` subprocess; the page
//! count comes from parsing the PDF structure directly so oversized
//! documents are rejected before any rendering work happens.

use std::path::Path;
use std::process::Command;

use tempfile::TempDir;
use thiserror::Error;

/// Errors raised while turning a PDF into page images.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("External tool not found: {0}")]
    ToolNotFound(String),

    #[error("Unreadable document: {0}")]
    Unreadable(String),

    #[error("Rasterization failed: {0}")]
    RenderFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One rendered page.
#[derive(Debug, Clone)]
pub struct RasterPage {
    /// 1-based page number.
    pub number: u32,
    /// PNG-encoded image data.
    pub png: Vec<u8>,
}

/// Renders PDF pages to PNG images.
pub trait Rasterizer: Send + Sync {
    /// Number of pages without rendering anything.
    fn page_count(&self, pdf: &[u8]) -> Result<u32, RasterError>;

    /// Render every page, in order.
    fn rasterize(&self, pdf: &[u8]) -> Result<Vec<RasterPage>, RasterError>;
}

/// pdftoppm-backed rasterizer.
pub struct PdftoppmRasterizer {
    dpi: u32,
}

impl PdftoppmRasterizer {
    pub fn new() -> Self {
        Self { dpi: 200 }
    }

    pub fn with_dpi(mut self, dpi: u32) -> Self {
        self.dpi = dpi;
        self
    }

    fn run_pdftoppm(&self, pdf_path: &Path, out_prefix: &Path) -> Result<(), RasterError> {
        let output = Command::new("pdftoppm")
            .arg("-png")
            .args(["-r", &self.dpi.to_string()])
            .arg(pdf_path)
            .arg(out_prefix)
            .output();

        match output {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(RasterError::RenderFailed(format!("pdftoppm failed: {stderr}")))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RasterError::ToolNotFound(
                "pdftoppm not found (install poppler-utils)".to_string(),
            )),
            Err(e) => Err(RasterError::Io(e)),
        }
    }
}

impl Default for PdftoppmRasterizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Rasterizer for PdftoppmRasterizer {
    fn page_count(&self, pdf: &[u8]) -> Result<u32, RasterError> {
        let doc = lopdf::Document::load_mem(pdf)
            .map_err(|e| RasterError::Unreadable(format!("failed to parse PDF: {e}")))?;
        Ok(doc.get_pages().len() as u32)
    }

    fn rasterize(&self, pdf: &[u8]) -> Result<Vec<RasterPage>, RasterError> {
        // Parse first so corrupt input surfaces as Unreadable rather than
        // a subprocess error.
        let expected = self.page_count(pdf)?;

        let temp = TempDir::new()?;
        let pdf_path = temp.path().join("input.pdf");
        std::fs::write(&pdf_path, pdf)?;
        let out_prefix = temp.path().join("page");

        self.run_pdftoppm(&pdf_path, &out_prefix)?;

        // pdftoppm names outputs page-1.png, page-01.png, ... depending on
        // the page count; collect and order by the parsed page number.
        let mut pages = Vec::new();
        for entry in std::fs::read_dir(temp.path())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(number) = parse_page_number(&name) else {
                continue;
            };
            let png = std::fs::read(entry.path())?;
            pages.push(RasterPage { number, png });
        }
        pages.sort_by_key(|p| p.number);

        if pages.len() as u32 != expected {
            return Err(RasterError::RenderFailed(format!(
                "rendered {} pages, expected {expected}",
                pages.len()
            )));
        }
        Ok(pages)
    }
}

/// Parse the page number out of a pdftoppm output filename
/// (`page-07.png` -> 7).
fn parse_page_number(filename: &str) -> Option<u32> {
    let stem = filename.strip_suffix(".png")?;
    let digits = stem.rsplit('-').next()?;
    digits.parse().ok()
}
