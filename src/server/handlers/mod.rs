//! HTTP handlers.

mod documents;
mod schemas;

pub use documents::{
    batch_process, delete_document, document_status, download_batch, download_single,
    download_template, list_documents, process_document, stream_document, upload_document,
};
pub use schemas::{detect_schema, get_schema, list_schemas};

use axum::extract::State;
use axum::Json;

use super::{ApiError, AppState};

/// Health probe: static liveness plus queue and document counts.
pub async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let (queue_depth, documents) = state.documents.health()?;
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "queue_depth": queue_depth,
        "documents": documents,
    })))
}
