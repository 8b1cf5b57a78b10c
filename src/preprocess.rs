//! Image enhancement ahead of vision extraction.
//!
//! Pages are grayscaled, contrast-normalized, and downscaled so the
//! largest dimension stays within the model's input budget. Enhancement
//! failures are non-fatal: the pipeline passes the raw page through and
//! records a warning.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat};
use thiserror::Error;

/// Largest output dimension in pixels.
pub const DEFAULT_MAX_DIMENSION: u32 = 2048;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Image decode failed: {0}")]
    Decode(String),

    #[error("Image encode failed: {0}")]
    Encode(String),
}

/// Page image enhancer.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    max_dimension: u32,
}

impl Preprocessor {
    pub fn new() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }

    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension;
        self
    }

    /// Enhance one PNG page; returns PNG bytes.
    pub fn enhance(&self, png: &[u8]) -> Result<Vec<u8>, PreprocessError> {
        let decoded = image::load_from_memory(png)
            .map_err(|e| PreprocessError::Decode(e.to_string()))?;

        let gray = decoded.into_luma8();
        let normalized = normalize_contrast(gray);
        let mut out = DynamicImage::ImageLuma8(normalized);

        if out.width().max(out.height()) > self.max_dimension {
            out = out.resize(self.max_dimension, self.max_dimension, FilterType::Lanczos3);
        }

        let mut buffer = Cursor::new(Vec::new());
        out.write_to(&mut buffer, ImageFormat::Png)
            .map_err(|e| PreprocessError::Encode(e.to_string()))?;
        Ok(buffer.into_inner())
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Linear contrast stretch over the observed luma range.
fn normalize_contrast(mut image: GrayImage) -> GrayImage {
    let (mut min, mut max) = (u8::MAX, u8::MIN);
    for pixel in image.pixels() {
        min = min.min(pixel.0[0]);
        max = max.max(pixel.0[0]);
    }
    // Flat or near-flat images have nothing to stretch.
    if max.saturating_sub(min) < 16 {
        return image;
    }

    let range = (max - min) as f32;
    for pixel in image.pixels_mut() {
        let stretched = ((pixel.0[0] - min) as f32 / range * 255.0).round();
        pixel.0[0] = stretched as u8;
    }
    image
}
