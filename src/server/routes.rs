//! Router configuration for the API server.

use axum::extract::DefaultBodyLimit;
use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use super::handlers;
use super::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    // Multipart framing adds overhead beyond the document itself.
    let body_limit = state.max_upload_bytes as usize + 1024 * 1024;

    let api = Router::new()
        .route("/documents/upload", post(handlers::upload_document))
        .route("/documents/process/:id", post(handlers::process_document))
        .route("/documents/:id/status", get(handlers::document_status))
        .route("/documents/:id/stream", get(handlers::stream_document))
        .route("/documents/", get(handlers::list_documents))
        .route("/documents", get(handlers::list_documents))
        .route("/documents/:id", delete(handlers::delete_document))
        .route(
            "/documents/:id/download/excel",
            get(handlers::download_single),
        )
        .route(
            "/documents/batch/download/excel",
            get(handlers::download_batch),
        )
        .route(
            "/documents/template/download/excel",
            get(handlers::download_template),
        )
        .route("/documents/batch/process", post(handlers::batch_process))
        .route("/schemas/", get(handlers::list_schemas))
        .route("/schemas", get(handlers::list_schemas))
        .route("/schemas/:name", get(handlers::get_schema))
        .route("/schemas/detect", post(handlers::detect_schema))
        .route("/health", get(handlers::health));

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
