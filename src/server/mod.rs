//! HTTP API server.
//!
//! Thin axum adapter over the service layer: routing, extraction,
//! error-to-status mapping, and SSE streaming of progress snapshots.

mod error;
mod handlers;
mod routes;

pub use error::ApiError;
pub use routes::create_router;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::Settings;
use crate::progress::ProgressBus;
use crate::repository::{DocumentRepository, JobQueue};
use crate::schemas::SchemaRegistry;
use crate::services::{DocumentService, ExportService};
use crate::storage::BlobStore;
use crate::vision::{HttpVisionExtractor, VisionConfig, VisionExtractor};

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub documents: Arc<DocumentService>,
    pub export: Arc<ExportService>,
    pub registry: Arc<SchemaRegistry>,
    pub vision: Arc<dyn VisionExtractor>,
    pub max_upload_bytes: u64,
}

impl AppState {
    pub fn new(settings: &Settings, bus: ProgressBus) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&settings.data_dir)?;
        let db_path = settings.db_path();
        let repo = Arc::new(DocumentRepository::new(&db_path)?);
        let queue = Arc::new(JobQueue::new(&db_path)?);
        let blobs = Arc::new(BlobStore::new(settings.blobs_dir()));
        let registry = Arc::new(SchemaRegistry::new());

        let vision: Arc<dyn VisionExtractor> = Arc::new(HttpVisionExtractor::new(VisionConfig {
            api_url: settings.vision_api_url.clone(),
            api_key: settings.vision_api_key.clone(),
            model: settings.vision_model.clone(),
            timeout: settings.page_timeout,
        }));

        let documents = Arc::new(DocumentService::new(
            Arc::clone(&repo),
            Arc::clone(&queue),
            blobs,
            Arc::clone(&registry),
            bus,
            settings.max_upload_bytes,
        ));
        let export = Arc::new(ExportService::new(repo));

        Ok(Self {
            documents,
            export,
            registry,
            vision,
            max_upload_bytes: settings.max_upload_bytes,
        })
    }
}

/// Start the API server. Runs until ctrl-c.
pub async fn serve(settings: &Settings) -> anyhow::Result<()> {
    let state = AppState::new(settings, ProgressBus::new())?;
    let app = create_router(state);

    let addr: SocketAddr = settings.bind_addr.parse()?;
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
