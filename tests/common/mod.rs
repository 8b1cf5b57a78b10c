//! Shared fixtures: minimal PDFs, scripted capability stubs, and a
//! wired-up harness over a temp directory.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use tempfile::TempDir;

use docloom::models::{Schema, Value};
use docloom::ocr::{OcrError, TextRecognizer};
use docloom::pipeline::{EngineConfig, PipelineEngine};
use docloom::preprocess::Preprocessor;
use docloom::progress::ProgressBus;
use docloom::raster::{RasterError, RasterPage, Rasterizer};
use docloom::rate_limit::RateLimiter;
use docloom::repository::{DocumentRepository, JobQueue};
use docloom::schemas::SchemaRegistry;
use docloom::services::DocumentService;
use docloom::storage::BlobStore;
use docloom::vision::{Detection, PageExtraction, VisionError, VisionExtractor};

/// Build a minimal n-page PDF.
pub fn minimal_pdf(pages: usize) -> Vec<u8> {
    use lopdf::{dictionary, Document, Object, Stream};

    let mut doc = Document::with_version("1.4");
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut page_ids = Vec::new();
    for i in 0..pages {
        let content = format!("BT /F1 12 Tf 100 700 Td (Page {}) Tj ET", i + 1);
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Resources" => resources_id,
            "Contents" => content_id,
        });
        page_ids.push(page_id);
    }

    let kids: Vec<Object> = page_ids.iter().map(|&id| id.into()).collect();
    let pages_id = doc.add_object(dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => Object::Integer(pages as i64),
    });
    for page_id in &page_ids {
        if let Ok(Object::Dictionary(dict)) = doc.get_object_mut(*page_id) {
            dict.set("Parent", pages_id);
        }
    }
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).unwrap();
    buffer
}

/// Encode a small grayscale PNG whose width encodes a page number.
pub fn page_png(page: u32) -> Vec<u8> {
    let image = GrayImage::from_pixel(10 + page, 10, Luma([200]));
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(image)
        .write_to(&mut buffer, ImageFormat::Png)
        .unwrap();
    buffer.into_inner()
}

/// Recover the page number a stub PNG encodes. Survives the
/// preprocessor because small flat images re-encode at the same size.
pub fn page_of(png: &[u8]) -> u32 {
    let decoded = image::load_from_memory(png).expect("stub png decodes");
    decoded.width() - 10
}

/// Rasterizer stub: real page counting, synthetic page images.
pub struct StubRasterizer;

impl Rasterizer for StubRasterizer {
    fn page_count(&self, pdf: &[u8]) -> Result<u32, RasterError> {
        let doc = lopdf::Document::load_mem(pdf)
            .map_err(|e| RasterError::Unreadable(e.to_string()))?;
        Ok(doc.get_pages().len() as u32)
    }

    fn rasterize(&self, pdf: &[u8]) -> Result<Vec<RasterPage>, RasterError> {
        let count = self.page_count(pdf)?;
        Ok((1..=count)
            .map(|number| RasterPage {
                number,
                png: page_png(number),
            })
            .collect())
    }
}

/// Scripted behavior for one page.
#[derive(Debug, Clone)]
pub enum PageScript {
    /// Extraction succeeds with these fields.
    Fields(Vec<(&'static str, serde_json::Value, f64)>),
    /// The model returns unparseable output every time.
    Malformed,
    /// The service is down.
    Unavailable,
}

/// Vision stub driven by a per-page script.
pub struct ScriptedVision {
    pages: HashMap<u32, PageScript>,
    detection: Option<Detection>,
    pub extract_calls: AtomicU32,
    pub schemas_seen: Mutex<Vec<String>>,
}

impl ScriptedVision {
    pub fn new(pages: HashMap<u32, PageScript>) -> Self {
        Self {
            pages,
            detection: None,
            extract_calls: AtomicU32::new(0),
            schemas_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_detection(mut self, detection: Detection) -> Self {
        self.detection = Some(detection);
        self
    }

    /// Every page succeeds with the same fields.
    pub fn uniform(fields: Vec<(&'static str, serde_json::Value, f64)>, pages: u32) -> Self {
        let pages = (1..=pages)
            .map(|n| (n, PageScript::Fields(fields.clone())))
            .collect();
        Self::new(pages)
    }
}

#[async_trait]
impl VisionExtractor for ScriptedVision {
    async fn extract(
        &self,
        page_png: &[u8],
        schema: &Schema,
    ) -> Result<PageExtraction, VisionError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        self.schemas_seen.lock().unwrap().push(schema.name.clone());

        let page = page_of(page_png);
        match self.pages.get(&page) {
            Some(PageScript::Fields(entries)) => {
                let mut fields = BTreeMap::new();
                let mut confidence = BTreeMap::new();
                for (name, value, score) in entries {
                    fields.insert(name.to_string(), Value::from_json(value.clone()));
                    confidence.insert(name.to_string(), *score);
                }
                Ok(PageExtraction { fields, confidence })
            }
            Some(PageScript::Malformed) => Err(VisionError::InvalidResponse(
                "model returned malformed JSON".to_string(),
            )),
            Some(PageScript::Unavailable) => {
                Err(VisionError::Unavailable("connection refused".to_string()))
            }
            None => Err(VisionError::InvalidResponse(format!(
                "no script for page {page}"
            ))),
        }
    }

    async fn detect(
        &self,
        _page_png: &[u8],
        _known_schemas: &[String],
        _hint: Option<&str>,
    ) -> Result<Detection, VisionError> {
        match &self.detection {
            Some(detection) => Ok(detection.clone()),
            None => Ok(Detection {
                schema_name: "invoice".to_string(),
                confidence: 0.9,
                suggested_fields: Vec::new(),
            }),
        }
    }
}

/// OCR stub returning fixed text, or failing.
pub struct StubOcr {
    pub text: Option<&'static str>,
}

impl TextRecognizer for StubOcr {
    fn recognize(&self, _png: &[u8]) -> Result<String, OcrError> {
        match self.text {
            Some(text) => Ok(text.to_string()),
            None => Err(OcrError::OcrFailed("nothing recognized".to_string())),
        }
    }
}

/// Fully wired test environment over a temp directory.
pub struct Harness {
    pub dir: TempDir,
    pub repo: Arc<DocumentRepository>,
    pub queue: Arc<JobQueue>,
    pub blobs: Arc<BlobStore>,
    pub bus: ProgressBus,
    pub registry: Arc<SchemaRegistry>,
    pub service: DocumentService,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("docloom.db");
        let repo = Arc::new(DocumentRepository::new(&db).unwrap());
        let queue = Arc::new(JobQueue::new(&db).unwrap());
        let blobs = Arc::new(BlobStore::new(dir.path().join("blobs")));
        let bus = ProgressBus::new();
        let registry = Arc::new(SchemaRegistry::new());
        let service = DocumentService::new(
            Arc::clone(&repo),
            Arc::clone(&queue),
            Arc::clone(&blobs),
            Arc::clone(&registry),
            bus.clone(),
            10 * 1024 * 1024,
        );
        Self {
            dir,
            repo,
            queue,
            blobs,
            bus,
            registry,
            service,
        }
    }

    /// Engine config with fast retry timings.
    pub fn engine_config() -> EngineConfig {
        EngineConfig {
            max_pages: 100,
            page_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            model_name: "test-model".to_string(),
            max_page_retries: 2,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(4),
        }
    }

    /// Engine with fast retry timings and stubbed capabilities.
    pub fn engine(
        &self,
        vision: Arc<dyn VisionExtractor>,
        ocr: Arc<dyn TextRecognizer>,
    ) -> PipelineEngine {
        self.engine_with_config(vision, ocr, Self::engine_config())
    }

    /// Engine with a custom config.
    pub fn engine_with_config(
        &self,
        vision: Arc<dyn VisionExtractor>,
        ocr: Arc<dyn TextRecognizer>,
        config: EngineConfig,
    ) -> PipelineEngine {
        PipelineEngine::new(
            Arc::clone(&self.repo),
            Arc::clone(&self.queue),
            Arc::clone(&self.blobs),
            Arc::new(StubRasterizer),
            Preprocessor::new(),
            vision,
            ocr,
            Arc::clone(&self.registry),
            Arc::new(RateLimiter::per_minute(100_000)),
            self.bus.clone(),
            config,
        )
    }
}

/// Standard successful invoice extraction script.
pub fn invoice_fields() -> Vec<(&'static str, serde_json::Value, f64)> {
    vec![
        ("invoice_number", serde_json::json!("INV-100"), 0.97),
        ("invoice_date", serde_json::json!("2024-06-01"), 0.95),
        ("total", serde_json::json!(1250.5), 0.92),
    ]
}
