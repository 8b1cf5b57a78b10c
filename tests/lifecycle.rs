//! End-to-end lifecycle tests: upload through pipeline to export,
//! against a real temp database with stubbed capabilities.

mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{invoice_fields, minimal_pdf, Harness, PageScript, ScriptedVision, StubOcr};
use docloom::models::{DocumentStatus, PageStatus, SchemaChoice, Value};
use docloom::pipeline::{RunOutcome, TerminalKind};
use docloom::repository::NackOutcome;
use docloom::services::ProcessOptions;
use docloom::vision::Detection;
use docloom::workbook::WorkbookWriter;

fn named_invoice() -> ProcessOptions {
    ProcessOptions {
        schema: Some("invoice".to_string()),
        template_mode: false,
    }
}

#[tokio::test]
async fn happy_path_invoice_completes() {
    let harness = Harness::new();
    let vision = Arc::new(ScriptedVision::uniform(invoice_fields(), 1));
    let engine = harness.engine(vision, Arc::new(StubOcr { text: None }));

    let doc = harness
        .service
        .upload(&minimal_pdf(1), "invoice.pdf")
        .unwrap()
        .document;
    assert_eq!(doc.status, DocumentStatus::Pending);

    harness
        .service
        .start_processing(doc.id, &named_invoice())
        .unwrap();

    let lease = harness.queue.try_claim().unwrap().expect("job queued");
    let outcome = engine.run(&lease, "test-worker").await;
    assert!(matches!(outcome, RunOutcome::Completed));
    harness.queue.ack(&lease.token).unwrap();

    let done = harness.repo.get(doc.id).unwrap().unwrap();
    assert_eq!(done.status, DocumentStatus::Completed);
    assert_eq!(done.progress, 1.0);
    assert_eq!(done.page_count, Some(1));

    let fields = done.extracted_fields.as_ref().unwrap();
    assert_eq!(fields["invoice_number"], Value::Text("INV-100".to_string()));
    assert_eq!(fields["total"], Value::Number(1250.5));
    // No required invoice field is missing.
    assert_ne!(fields["invoice_number"], Value::missing());
    assert_ne!(fields["invoice_date"], Value::missing());
    assert_ne!(fields["total"], Value::missing());

    let meta = done.processing_meta.as_ref().unwrap();
    assert_eq!(meta.page_statuses[&1], PageStatus::Vision);
    assert_eq!(meta.model.as_deref(), Some("test-model"));
    assert!(meta.duration_ms.is_some());

    // The job queue drained.
    assert_eq!(harness.queue.depth().unwrap(), 0);

    // And the workbook export works end to end.
    let bytes = WorkbookWriter::single(&done, true).unwrap();
    assert_eq!(&bytes[..2], b"PK");
}

#[tokio::test]
async fn per_page_ocr_fallback_still_completes() {
    let harness = Harness::new();
    let mut pages = HashMap::new();
    pages.insert(1, PageScript::Fields(invoice_fields()));
    pages.insert(2, PageScript::Malformed);
    pages.insert(3, PageScript::Fields(invoice_fields()));
    let vision = Arc::new(ScriptedVision::new(pages));
    let engine = harness.engine(
        vision,
        Arc::new(StubOcr {
            text: Some("recovered page text"),
        }),
    );

    let doc = harness
        .service
        .upload(&minimal_pdf(3), "three-pages.pdf")
        .unwrap()
        .document;
    harness
        .service
        .start_processing(doc.id, &named_invoice())
        .unwrap();

    let lease = harness.queue.try_claim().unwrap().unwrap();
    let outcome = engine.run(&lease, "test-worker").await;
    assert!(matches!(outcome, RunOutcome::Completed));
    harness.queue.ack(&lease.token).unwrap();

    let done = harness.repo.get(doc.id).unwrap().unwrap();
    assert_eq!(done.status, DocumentStatus::Completed);

    let meta = done.processing_meta.as_ref().unwrap();
    assert_eq!(meta.page_statuses[&1], PageStatus::Vision);
    assert_eq!(meta.page_statuses[&2], PageStatus::OcrFallback);
    assert_eq!(meta.page_statuses[&3], PageStatus::Vision);

    // OCR text landed in the merged fields at fallback confidence.
    let fields = done.extracted_fields.as_ref().unwrap();
    assert_eq!(
        fields["raw_text"],
        Value::Text("recovered page text".to_string())
    );
}

#[tokio::test]
async fn all_pages_failing_fails_the_document() {
    let harness = Harness::new();
    let mut pages = HashMap::new();
    pages.insert(1, PageScript::Malformed);
    pages.insert(2, PageScript::Malformed);
    let vision = Arc::new(ScriptedVision::new(pages));
    let engine = harness.engine(vision, Arc::new(StubOcr { text: None }));

    let doc = harness
        .service
        .upload(&minimal_pdf(2), "hopeless.pdf")
        .unwrap()
        .document;
    harness
        .service
        .start_processing(doc.id, &named_invoice())
        .unwrap();

    let lease = harness.queue.try_claim().unwrap().unwrap();
    let outcome = engine.run(&lease, "test-worker").await;
    assert!(matches!(
        outcome,
        RunOutcome::Failed(TerminalKind::AllPagesFailedExtraction)
    ));
    harness.queue.ack(&lease.token).unwrap();

    let failed = harness.repo.get(doc.id).unwrap().unwrap();
    assert_eq!(failed.status, DocumentStatus::Failed);
    assert_eq!(
        failed.error_message.as_deref(),
        Some("AllPagesFailedExtraction")
    );
    assert!(failed.progress < 1.0);
}

#[tokio::test]
async fn vision_call_budget_is_bounded() {
    let harness = Harness::new();
    let mut pages = HashMap::new();
    pages.insert(1, PageScript::Malformed);
    pages.insert(2, PageScript::Malformed);
    let vision = Arc::new(ScriptedVision::new(pages));
    let engine = harness.engine(
        Arc::clone(&vision) as Arc<dyn docloom::vision::VisionExtractor>,
        Arc::new(StubOcr {
            text: Some("fallback"),
        }),
    );

    let doc = harness
        .service
        .upload(&minimal_pdf(2), "budget.pdf")
        .unwrap()
        .document;
    harness
        .service
        .start_processing(doc.id, &named_invoice())
        .unwrap();

    let lease = harness.queue.try_claim().unwrap().unwrap();
    let _ = engine.run(&lease, "test-worker").await;

    // pages x (1 initial + 2 retries) and not one call more.
    assert_eq!(vision.extract_calls.load(Ordering::SeqCst), 2 * 3);
}

#[tokio::test]
async fn cancellation_mid_flight_aborts_and_cleans_up() {
    let harness = Harness::new();
    let vision = Arc::new(ScriptedVision::uniform(invoice_fields(), 1));
    let engine = harness.engine(vision, Arc::new(StubOcr { text: None }));

    let doc = harness
        .service
        .upload(&minimal_pdf(1), "doomed.pdf")
        .unwrap()
        .document;
    let hash = doc.content_hash.clone();
    harness
        .service
        .start_processing(doc.id, &named_invoice())
        .unwrap();

    // Claim first, then delete: the tombstone is observed at the next
    // stage boundary.
    let lease = harness.queue.try_claim().unwrap().unwrap();
    harness.service.delete(doc.id).await.unwrap();

    let outcome = engine.run(&lease, "test-worker").await;
    assert!(matches!(outcome, RunOutcome::Cancelled));
    harness.queue.ack(&lease.token).unwrap();

    assert!(harness.repo.get(doc.id).unwrap().is_none());
    assert!(!harness.blobs.contains(&hash));
    assert_eq!(harness.queue.depth().unwrap(), 0);
}

#[tokio::test]
async fn transient_outage_retries_then_exhausts() {
    let harness = Harness::new();
    let mut pages = HashMap::new();
    pages.insert(1, PageScript::Unavailable);
    let vision = Arc::new(ScriptedVision::new(pages));
    let engine = harness.engine(vision, Arc::new(StubOcr { text: None }));

    let doc = harness
        .service
        .upload(&minimal_pdf(1), "outage.pdf")
        .unwrap()
        .document;
    harness
        .service
        .start_processing(doc.id, &named_invoice())
        .unwrap();

    // Deliveries 1 and 2: transient failure, requeued.
    for _ in 0..2 {
        let lease = harness.queue.try_claim().unwrap().unwrap();
        let outcome = engine.run(&lease, "test-worker").await;
        assert!(matches!(outcome, RunOutcome::Retry(_, _)));
        assert_eq!(
            harness.queue.nack(&lease.token, None).unwrap(),
            NackOutcome::Requeued
        );
    }

    // Delivery 3: budget spent; the document is failed by the caller.
    let lease = harness.queue.try_claim().unwrap().unwrap();
    let outcome = engine.run(&lease, "test-worker").await;
    assert!(matches!(outcome, RunOutcome::Retry(_, _)));
    assert_eq!(
        harness.queue.nack(&lease.token, None).unwrap(),
        NackOutcome::Exhausted
    );
    harness
        .repo
        .fail(doc.id, lease.job.doc_attempt, "VisionUnavailable: attempts exhausted", None)
        .unwrap();

    let failed = harness.repo.get(doc.id).unwrap().unwrap();
    assert_eq!(failed.status, DocumentStatus::Failed);
    assert!(failed.error_message.unwrap().contains("VisionUnavailable"));
    assert_eq!(harness.queue.depth().unwrap(), 0);
}

#[tokio::test]
async fn progress_is_monotonic_and_streamed() {
    let harness = Harness::new();
    let vision = Arc::new(ScriptedVision::uniform(invoice_fields(), 3));
    let engine = harness.engine(vision, Arc::new(StubOcr { text: None }));

    let doc = harness
        .service
        .upload(&minimal_pdf(3), "progress.pdf")
        .unwrap()
        .document;
    harness
        .service
        .start_processing(doc.id, &named_invoice())
        .unwrap();

    let mut rx = harness.bus.subscribe(doc.id).await;
    let lease = harness.queue.try_claim().unwrap().unwrap();
    let outcome = engine.run(&lease, "test-worker").await;
    assert!(matches!(outcome, RunOutcome::Completed));

    let mut last = -1.0f64;
    let mut saw_terminal = false;
    while let Ok(snapshot) =
        tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
    {
        let snapshot = snapshot.expect("channel open until terminal");
        assert!(
            snapshot.progress >= last,
            "progress went backwards: {last} -> {}",
            snapshot.progress
        );
        last = snapshot.progress;
        if snapshot.status.is_terminal() {
            saw_terminal = true;
            assert_eq!(snapshot.progress, 1.0);
            break;
        }
    }
    assert!(saw_terminal);
}

#[tokio::test]
async fn auto_detection_respects_confidence_floor() {
    // At the floor exactly: detected schema is used.
    let harness = Harness::new();
    let vision = Arc::new(
        ScriptedVision::uniform(invoice_fields(), 1).with_detection(Detection {
            schema_name: "receipt".to_string(),
            confidence: 0.5,
            suggested_fields: Vec::new(),
        }),
    );
    let engine = harness.engine(
        Arc::clone(&vision) as Arc<dyn docloom::vision::VisionExtractor>,
        Arc::new(StubOcr { text: None }),
    );

    let doc = harness
        .service
        .upload(&minimal_pdf(1), "auto.pdf")
        .unwrap()
        .document;
    harness
        .service
        .start_processing(doc.id, &ProcessOptions::default())
        .unwrap();
    let lease = harness.queue.try_claim().unwrap().unwrap();
    assert_eq!(lease.job.options.schema, SchemaChoice::Auto);
    engine.run(&lease, "w").await;
    assert_eq!(vision.schemas_seen.lock().unwrap()[0], "receipt");

    // Strictly below the floor: generic fallback.
    let harness = Harness::new();
    let vision = Arc::new(
        ScriptedVision::uniform(invoice_fields(), 1).with_detection(Detection {
            schema_name: "receipt".to_string(),
            confidence: 0.49,
            suggested_fields: Vec::new(),
        }),
    );
    let engine = harness.engine(
        Arc::clone(&vision) as Arc<dyn docloom::vision::VisionExtractor>,
        Arc::new(StubOcr { text: None }),
    );
    let doc = harness
        .service
        .upload(&minimal_pdf(1), "auto2.pdf")
        .unwrap()
        .document;
    harness
        .service
        .start_processing(doc.id, &ProcessOptions::default())
        .unwrap();
    let lease = harness.queue.try_claim().unwrap().unwrap();
    engine.run(&lease, "w").await;
    assert_eq!(vision.schemas_seen.lock().unwrap()[0], "generic");
}

#[tokio::test]
async fn oversized_document_fails_terminal() {
    let harness = Harness::new();
    let vision = Arc::new(ScriptedVision::uniform(invoice_fields(), 5));
    let config = docloom::pipeline::EngineConfig {
        max_pages: 2,
        ..Harness::engine_config()
    };
    let engine =
        harness.engine_with_config(vision, Arc::new(StubOcr { text: None }), config);

    let doc = harness
        .service
        .upload(&minimal_pdf(3), "fat.pdf")
        .unwrap()
        .document;
    harness
        .service
        .start_processing(doc.id, &named_invoice())
        .unwrap();

    let lease = harness.queue.try_claim().unwrap().unwrap();
    let outcome = engine.run(&lease, "w").await;
    assert!(matches!(
        outcome,
        RunOutcome::Failed(TerminalKind::DocumentTooLarge)
    ));

    let failed = harness.repo.get(doc.id).unwrap().unwrap();
    assert_eq!(failed.error_message.as_deref(), Some("DocumentTooLarge"));
}

#[tokio::test]
async fn reprocessing_overwrites_prior_extraction() {
    let harness = Harness::new();
    let vision = Arc::new(ScriptedVision::uniform(invoice_fields(), 1));
    let engine = harness.engine(
        Arc::clone(&vision) as Arc<dyn docloom::vision::VisionExtractor>,
        Arc::new(StubOcr { text: None }),
    );

    let doc = harness
        .service
        .upload(&minimal_pdf(1), "again.pdf")
        .unwrap()
        .document;

    for _ in 0..2 {
        harness
            .service
            .start_processing(doc.id, &named_invoice())
            .unwrap();
        let lease = harness.queue.try_claim().unwrap().unwrap();
        let outcome = engine.run(&lease, "w").await;
        assert!(matches!(outcome, RunOutcome::Completed));
        harness.queue.ack(&lease.token).unwrap();
    }

    let done = harness.repo.get(doc.id).unwrap().unwrap();
    assert_eq!(done.status, DocumentStatus::Completed);
    assert_eq!(done.attempt, 2);
    assert!(done.extracted_fields.is_some());
}
