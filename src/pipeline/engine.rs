//! The pipeline engine: advances one document from claimed job to
//! terminal state.
//!
//! Between stages the engine checks the cancellation tombstone, reports
//! progress, and extends the queue lease when it runs short. All
//! document writes are conditional on `(id, attempt)`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{info, warn};

use super::error::{RetryableKind, StageError, TerminalKind};
use super::merge::{merge_pages, PageResult};
use crate::models::{PageStatus, ProcessingMeta, Schema, SchemaChoice, Value};
use crate::ocr::{TextRecognizer, OCR_CONFIDENCE, OCR_TEXT_FIELD};
use crate::progress::ProgressBus;
use crate::raster::{RasterPage, Rasterizer};
use crate::rate_limit::RateLimiter;
use crate::preprocess::Preprocessor;
use crate::repository::{DocumentRepository, JobQueue, Lease, RepositoryError};
use crate::schemas::{SchemaRegistry, DETECTION_CONFIDENCE_FLOOR};
use crate::storage::BlobStore;
use crate::vision::{PageExtraction, VisionError, VisionExtractor};

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_pages: u32,
    /// Per-model-call ceiling for one page.
    pub page_timeout: Duration,
    /// Extend the lease when less than this much remains.
    pub heartbeat_interval: Duration,
    pub model_name: String,
    /// Vision retries per page before OCR fallback.
    pub max_page_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_pages: 100,
            page_timeout: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(15),
            model_name: "unknown".to_string(),
            max_page_retries: 2,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// What the worker should do with the job after a run.
#[derive(Debug)]
pub enum RunOutcome {
    /// Results persisted; ack.
    Completed,
    /// Another worker owns this attempt; ack the spurious delivery.
    LostRace,
    /// Tombstone observed; ack without touching the document.
    Cancelled,
    /// Document marked failed; ack.
    Failed(TerminalKind),
    /// Transient failure; nack for redelivery.
    Retry(RetryableKind, String),
}

/// Stateless orchestrator for the document pipeline.
pub struct PipelineEngine {
    repo: Arc<DocumentRepository>,
    queue: Arc<JobQueue>,
    blobs: Arc<BlobStore>,
    raster: Arc<dyn Rasterizer>,
    preprocessor: Preprocessor,
    vision: Arc<dyn VisionExtractor>,
    ocr: Arc<dyn TextRecognizer>,
    registry: Arc<SchemaRegistry>,
    limiter: Arc<RateLimiter>,
    bus: ProgressBus,
    config: EngineConfig,
}

impl PipelineEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<DocumentRepository>,
        queue: Arc<JobQueue>,
        blobs: Arc<BlobStore>,
        raster: Arc<dyn Rasterizer>,
        preprocessor: Preprocessor,
        vision: Arc<dyn VisionExtractor>,
        ocr: Arc<dyn TextRecognizer>,
        registry: Arc<SchemaRegistry>,
        limiter: Arc<RateLimiter>,
        bus: ProgressBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            repo,
            queue,
            blobs,
            raster,
            preprocessor,
            vision,
            ocr,
            registry,
            limiter,
            bus,
            config,
        }
    }

    /// Drive one claimed job to an outcome.
    pub async fn run(&self, lease: &Lease, worker_id: &str) -> RunOutcome {
        let id = lease.job.document_id;
        let attempt = lease.job.doc_attempt;

        // Stage 1: load and take ownership.
        match self.repo.is_cancelled(id) {
            Ok(true) => return RunOutcome::Cancelled,
            Ok(false) => {}
            Err(e) => return RunOutcome::Retry(RetryableKind::StoreUnavailable, e.to_string()),
        }
        match self.repo.begin_processing(id, attempt, worker_id) {
            Ok(true) => {}
            Ok(false) => return RunOutcome::LostRace,
            Err(e) => return RunOutcome::Retry(RetryableKind::StoreUnavailable, e.to_string()),
        }

        let started = Instant::now();
        let mut meta = ProcessingMeta {
            model: Some(self.config.model_name.clone()),
            worker: Some(worker_id.to_string()),
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        let result = self.process(lease, &mut meta).await;
        meta.duration_ms = Some(started.elapsed().as_millis() as u64);

        match result {
            Ok((fields, confidences)) => {
                match self.repo.complete(id, attempt, &fields, &confidences, &meta) {
                    Ok(true) => {
                        info!(document_id = id, attempt, "document completed");
                        self.publish_current(id).await;
                        RunOutcome::Completed
                    }
                    // The attempt moved on under us; nothing to persist.
                    Ok(false) => RunOutcome::Cancelled,
                    Err(e) => {
                        RunOutcome::Retry(RetryableKind::StoreUnavailable, e.to_string())
                    }
                }
            }
            Err(StageError::Terminal {
                kind: TerminalKind::Cancelled,
                ..
            }) => {
                info!(document_id = id, "processing cancelled");
                RunOutcome::Cancelled
            }
            Err(StageError::Terminal { kind, message }) => {
                meta.warnings.push(message);
                if let Err(e) = self.repo.fail(id, attempt, kind.as_str(), Some(&meta)) {
                    warn!(document_id = id, error = %e, "failed to record terminal error");
                }
                self.publish_current(id).await;
                RunOutcome::Failed(kind)
            }
            Err(StageError::Retryable { kind, message }) => {
                // Hand the attempt back so a later delivery can claim it.
                if let Err(e) = self.repo.release_processing(id, attempt) {
                    warn!(document_id = id, error = %e, "failed to release document");
                }
                RunOutcome::Retry(kind, message)
            }
        }
    }

    /// Stages 1b-7. Returns merged fields and confidences.
    async fn process(
        &self,
        lease: &Lease,
        meta: &mut ProcessingMeta,
    ) -> Result<(BTreeMap<String, Value>, BTreeMap<String, f64>), StageError> {
        let id = lease.job.document_id;
        let attempt = lease.job.doc_attempt;

        self.checkpoint(lease, 0.02).await?;

        let doc = self
            .repo
            .get(id)
            .map_err(store_err)?
            .ok_or_else(StageError::cancelled)?;
        let pdf = self
            .blobs
            .get(&doc.content_hash)
            .map_err(|e| StageError::terminal(TerminalKind::Unreadable, e.to_string()))?;

        // Stage 2: rasterize. The page budget is checked before any
        // rendering work happens.
        let page_total = self.page_count(&pdf).await?;
        if page_total > self.config.max_pages {
            return Err(StageError::terminal(
                TerminalKind::DocumentTooLarge,
                format!("{page_total} pages exceeds limit {}", self.config.max_pages),
            ));
        }
        let pages = self.rasterize(&pdf).await?;
        self.repo
            .set_page_count(id, attempt, pages.len() as u32)
            .map_err(store_err)?;
        self.checkpoint(lease, 0.10).await?;

        // Stage 3: enhance. Failures are non-fatal per page.
        let total = pages.len();
        let mut enhanced: Vec<RasterPage> = Vec::with_capacity(total);
        for (i, page) in pages.into_iter().enumerate() {
            let number = page.number;
            match self.enhance(page.png.clone()).await {
                Ok(png) => enhanced.push(RasterPage { number, png }),
                Err(e) => {
                    meta.warnings
                        .push(format!("page {number}: enhancement failed: {e}"));
                    enhanced.push(page);
                }
            }
            self.checkpoint(lease, 0.10 + 0.20 * (i + 1) as f64 / total as f64)
                .await?;
        }

        // Stage 4: resolve the schema.
        let schema = self.resolve_schema(&lease.job.options.schema, &enhanced, meta).await?;
        self.checkpoint(lease, 0.35).await?;

        // Stage 5: extract each page, vision first, OCR as fallback.
        let mut results: Vec<PageResult> = Vec::with_capacity(total);
        let mut infrastructure_failures = 0usize;
        for (i, page) in enhanced.iter().enumerate() {
            let (result, infrastructure) = self.extract_page(page, &schema).await;
            if let Some(reason) = result.error.as_deref() {
                warn!(document_id = id, page = page.number, reason, "page extraction degraded");
                if result.status == PageStatus::Error {
                    meta.warnings
                        .push(format!("page {}: {reason}", page.number));
                }
            }
            if infrastructure {
                infrastructure_failures += 1;
            }
            meta.page_statuses.insert(page.number, result.status);
            results.push(result);
            self.checkpoint(lease, 0.35 + 0.55 * (i + 1) as f64 / total as f64)
                .await?;
        }

        let succeeded = results.iter().filter(|r| r.status != PageStatus::Error).count();
        if succeeded == 0 {
            // A total blackout of the vision service is an infrastructure
            // problem, not a statement about the document.
            if infrastructure_failures == results.len() && !results.is_empty() {
                return Err(StageError::retryable(
                    RetryableKind::VisionUnavailable,
                    "vision service unavailable for every page",
                ));
            }
            return Err(StageError::terminal(
                TerminalKind::AllPagesFailedExtraction,
                format!("all {} pages failed extraction", results.len()),
            ));
        }

        // Stage 6: merge.
        let (fields, confidences) = merge_pages(&schema, &results);
        self.checkpoint(lease, 0.95).await?;

        Ok((fields, confidences))
    }

    async fn page_count(&self, pdf: &[u8]) -> Result<u32, StageError> {
        let raster = Arc::clone(&self.raster);
        let bytes = pdf.to_vec();
        tokio::task::spawn_blocking(move || raster.page_count(&bytes))
            .await
            .map_err(|e| StageError::terminal(TerminalKind::Unreadable, e.to_string()))?
            .map_err(classify_raster_error)
    }

    async fn rasterize(&self, pdf: &[u8]) -> Result<Vec<RasterPage>, StageError> {
        let raster = Arc::clone(&self.raster);
        let bytes = pdf.to_vec();
        let pages = tokio::task::spawn_blocking(move || raster.rasterize(&bytes))
            .await
            .map_err(|e| StageError::terminal(TerminalKind::Unreadable, e.to_string()))?
            .map_err(classify_raster_error)?;
        if pages.is_empty() {
            return Err(StageError::terminal(
                TerminalKind::Unreadable,
                "document has no pages",
            ));
        }
        Ok(pages)
    }

    async fn enhance(&self, png: Vec<u8>) -> Result<Vec<u8>, String> {
        let preprocessor = self.preprocessor.clone();
        tokio::task::spawn_blocking(move || preprocessor.enhance(&png))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())
    }

    /// Stage 4: named schema, or detection against the first page with
    /// the generic fallback below the confidence floor.
    async fn resolve_schema(
        &self,
        choice: &SchemaChoice,
        pages: &[RasterPage],
        meta: &mut ProcessingMeta,
    ) -> Result<Schema, StageError> {
        match choice {
            SchemaChoice::Named(name) => match self.registry.get(name) {
                Some(schema) => Ok(schema.clone()),
                None => {
                    meta.warnings
                        .push(format!("unknown schema '{name}', using generic"));
                    Ok(self.registry.generic().clone())
                }
            },
            SchemaChoice::Auto => {
                let first = &pages[0];
                self.limiter.acquire().await;
                let detection = tokio::time::timeout(
                    self.config.page_timeout,
                    self.registry.detect(self.vision.as_ref(), &first.png, None),
                )
                .await;

                match detection {
                    Ok(Ok(detection)) if detection.confidence >= DETECTION_CONFIDENCE_FLOOR => {
                        match self.registry.get(&detection.schema_name) {
                            Some(schema) => {
                                info!(
                                    schema = %detection.schema_name,
                                    confidence = detection.confidence,
                                    "schema detected"
                                );
                                Ok(schema.clone())
                            }
                            None => {
                                meta.warnings.push(format!(
                                    "detector proposed unknown schema '{}'",
                                    detection.schema_name
                                ));
                                Ok(self.registry.generic().clone())
                            }
                        }
                    }
                    Ok(Ok(detection)) => {
                        meta.warnings.push(format!(
                            "detection confidence {:.2} below floor, using generic",
                            detection.confidence
                        ));
                        Ok(self.registry.generic().clone())
                    }
                    Ok(Err(e)) => {
                        meta.warnings
                            .push(format!("schema detection failed: {e}, using generic"));
                        Ok(self.registry.generic().clone())
                    }
                    Err(_) => {
                        meta.warnings
                            .push("schema detection timed out, using generic".to_string());
                        Ok(self.registry.generic().clone())
                    }
                }
            }
        }
    }

    /// Stage 5 for one page: bounded vision retries, then OCR.
    ///
    /// The second return value marks failures that were purely
    /// infrastructure-shaped (service down, rate limited, timed out).
    async fn extract_page(&self, page: &RasterPage, schema: &Schema) -> (PageResult, bool) {
        match self.extract_with_retries(&page.png, schema).await {
            Ok(extraction) => (
                PageResult {
                    number: page.number,
                    status: PageStatus::Vision,
                    fields: extraction.fields,
                    confidence: extraction.confidence,
                    error: None,
                },
                false,
            ),
            Err(vision_err) => {
                let ocr = Arc::clone(&self.ocr);
                let png = page.png.clone();
                let recognized =
                    tokio::task::spawn_blocking(move || ocr.recognize(&png)).await;

                match recognized {
                    Ok(Ok(text)) => {
                        let mut fields = BTreeMap::new();
                        fields.insert(OCR_TEXT_FIELD.to_string(), Value::Text(text));
                        let mut confidence = BTreeMap::new();
                        confidence.insert(OCR_TEXT_FIELD.to_string(), OCR_CONFIDENCE);
                        (
                            PageResult {
                                number: page.number,
                                status: PageStatus::OcrFallback,
                                fields,
                                confidence,
                                error: Some(format!("vision failed, used OCR: {vision_err}")),
                            },
                            false,
                        )
                    }
                    Ok(Err(ocr_err)) => {
                        let infrastructure = vision_err.is_infrastructure();
                        (
                            PageResult::failed(
                                page.number,
                                format!("vision: {vision_err}; ocr: {ocr_err}"),
                            ),
                            infrastructure,
                        )
                    }
                    Err(join_err) => (
                        PageResult::failed(
                            page.number,
                            format!("vision: {vision_err}; ocr task failed: {join_err}"),
                        ),
                        vision_err.is_infrastructure(),
                    ),
                }
            }
        }
    }

    async fn extract_with_retries(
        &self,
        png: &[u8],
        schema: &Schema,
    ) -> Result<PageExtraction, VisionError> {
        let mut delay = self.config.backoff_base;
        let mut last = VisionError::Unavailable("no attempts made".to_string());

        for attempt in 0..=self.config.max_page_retries {
            self.limiter.acquire().await;
            let call = tokio::time::timeout(
                self.config.page_timeout,
                self.vision.extract(png, schema),
            )
            .await;

            match call {
                Ok(Ok(extraction)) => return Ok(extraction),
                Ok(Err(e)) => last = e,
                Err(_) => last = VisionError::Timeout,
            }

            if attempt < self.config.max_page_retries {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.config.backoff_cap);
            }
        }
        Err(last)
    }

    /// Stage boundary: cancellation check, progress report, lease upkeep.
    async fn checkpoint(&self, lease: &Lease, progress: f64) -> Result<(), StageError> {
        let id = lease.job.document_id;
        let attempt = lease.job.doc_attempt;

        if self.repo.is_cancelled(id).map_err(store_err)? {
            return Err(StageError::cancelled());
        }

        let progress = round2(progress);
        self.repo
            .set_progress(id, attempt, progress)
            .map_err(store_err)?;
        self.publish_current(id).await;

        if let Ok(Some(expires)) = self.queue.lease_expires(&lease.token) {
            let remaining = (expires - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if remaining < self.config.heartbeat_interval {
                let _ = self
                    .queue
                    .extend_lease(&lease.token, self.queue.lease_duration());
            }
        }
        Ok(())
    }

    async fn publish_current(&self, id: i64) {
        if let Ok(Some(doc)) = self.repo.get(id) {
            self.bus.publish(doc.snapshot()).await;
        }
    }
}

fn store_err(e: RepositoryError) -> StageError {
    StageError::retryable(RetryableKind::StoreUnavailable, e.to_string())
}

/// Corrupt input is the document's fault; a missing renderer binary or
/// an IO failure is the worker's.
fn classify_raster_error(e: crate::raster::RasterError) -> StageError {
    use crate::raster::RasterError;
    match e {
        RasterError::Unreadable(_) | RasterError::RenderFailed(_) => {
            StageError::terminal(TerminalKind::Unreadable, e.to_string())
        }
        RasterError::ToolNotFound(_) | RasterError::Io(_) => {
            StageError::retryable(RetryableKind::StoreUnavailable, e.to_string())
        }
    }
}

/// Progress is reported to two decimal places.
fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round2_truncates_to_cents() {
        assert_eq!(round2(0.123456), 0.12);
        assert_eq!(round2(0.999), 1.0);
        assert_eq!(round2(0.345), 0.35);
    }
}
