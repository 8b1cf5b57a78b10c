//! Worker pool: claims jobs, drives the pipeline engine, and keeps the
//! queue honest.
//!
//! Each worker processes one document at a time. A janitor task resets
//! documents whose worker heartbeat went stale and makes their jobs
//! claimable again, so a crashed worker's work is never lost.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::pipeline::{PipelineEngine, RunOutcome};
use crate::progress::ProgressBus;
use crate::repository::{DocumentRepository, JobQueue, Lease, NackOutcome};

/// Tunables for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    /// How long one claim call waits before looping.
    pub claim_timeout: Duration,
    /// Heartbeats older than this mark a worker dead.
    pub heartbeat_timeout: Duration,
    pub janitor_interval: Duration,
    /// Wall-clock ceiling for one document.
    pub document_timeout: Duration,
    /// Base delay for redelivery after a transient failure.
    pub retry_delay_base: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            claim_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(60),
            janitor_interval: Duration::from_secs(15),
            document_timeout: Duration::from_secs(3600),
            retry_delay_base: Duration::from_secs(2),
        }
    }
}

/// Long-running pool of pipeline workers.
pub struct WorkerPool {
    engine: Arc<PipelineEngine>,
    repo: Arc<DocumentRepository>,
    queue: Arc<JobQueue>,
    bus: ProgressBus,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        engine: Arc<PipelineEngine>,
        repo: Arc<DocumentRepository>,
        queue: Arc<JobQueue>,
        bus: ProgressBus,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            engine,
            repo,
            queue,
            bus,
            config,
        }
    }

    /// Run workers and janitor until `shutdown` flips to true. In-flight
    /// documents finish before a worker exits.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut handles = Vec::new();

        for index in 0..self.config.concurrency.max(1) {
            let pool = Arc::clone(&self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pool.worker_loop(index, shutdown).await;
            }));
        }

        let janitor_pool = Arc::clone(&self);
        let janitor_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            janitor_pool.janitor_loop(janitor_shutdown).await;
        }));

        for handle in handles {
            let _ = handle.await;
        }
        info!("worker pool stopped");
    }

    async fn worker_loop(&self, index: usize, mut shutdown: watch::Receiver<bool>) {
        let worker_id = format!("worker-{}-{index}", std::process::id());
        info!(worker = %worker_id, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let claimed = tokio::select! {
                claimed = self.queue.claim(self.config.claim_timeout) => claimed,
                _ = shutdown.changed() => break,
            };

            match claimed {
                Ok(Some(lease)) => self.handle(lease, &worker_id).await,
                Ok(None) => {}
                Err(e) => {
                    error!(worker = %worker_id, error = %e, "claim failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!(worker = %worker_id, "worker stopped");
    }

    async fn handle(&self, lease: Lease, worker_id: &str) {
        let document_id = lease.job.document_id;
        let attempt = lease.job.doc_attempt;

        let outcome = match tokio::time::timeout(
            self.config.document_timeout,
            self.engine.run(&lease, worker_id),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(document_id, "document timed out");
                if let Err(e) = self.repo.fail(document_id, attempt, "Timeout", None) {
                    error!(document_id, error = %e, "failed to record timeout");
                }
                self.publish_current(document_id).await;
                self.ack(&lease);
                return;
            }
        };

        match outcome {
            RunOutcome::Completed
            | RunOutcome::Cancelled
            | RunOutcome::LostRace
            | RunOutcome::Failed(_) => self.ack(&lease),
            RunOutcome::Retry(kind, message) => {
                warn!(
                    document_id,
                    kind = kind.as_str(),
                    reason = %message,
                    delivery = lease.job.deliveries,
                    "transient failure, redelivering"
                );
                let delay = retry_delay(self.config.retry_delay_base, lease.job.deliveries);
                match self.queue.nack(&lease.token, Some(delay)) {
                    Ok(NackOutcome::Requeued) => {}
                    Ok(NackOutcome::Exhausted) => {
                        let reason = format!("{}: {message}", kind.as_str());
                        if let Err(e) = self.repo.fail(document_id, attempt, &reason, None) {
                            error!(document_id, error = %e, "failed to record exhaustion");
                        }
                        self.publish_current(document_id).await;
                    }
                    Err(e) => error!(document_id, error = %e, "nack failed"),
                }
            }
        }
    }

    fn ack(&self, lease: &Lease) {
        if let Err(e) = self.queue.ack(&lease.token) {
            error!(job_id = lease.job.id, error = %e, "ack failed");
        }
    }

    async fn publish_current(&self, document_id: i64) {
        if let Ok(Some(doc)) = self.repo.get(document_id) {
            self.bus.publish(doc.snapshot()).await;
        }
    }

    async fn janitor_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.janitor_interval) => {}
                _ = shutdown.changed() => break,
            }

            match self.repo.reset_stale(self.config.heartbeat_timeout) {
                Ok(ids) => {
                    for id in ids {
                        if let Err(e) = self.queue.release_document(id) {
                            warn!(document_id = id, error = %e, "failed to release job");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "janitor sweep failed"),
            }
        }
    }
}

/// Exponential redelivery delay: base doubled per prior delivery, capped
/// at five minutes.
fn retry_delay(base: Duration, deliveries: u32) -> Duration {
    let factor = 1u32 << deliveries.saturating_sub(1).min(8);
    (base * factor).min(Duration::from_secs(300))
}
