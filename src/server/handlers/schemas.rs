//! Schema endpoints: catalog listing and detection.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use base64::Engine;
use serde::Deserialize;

use super::{ApiError, AppState};
use crate::services::ServiceError;
use crate::vision::VisionError;

/// `GET /schemas/`.
pub async fn list_schemas(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "schemas": state.registry.list() }))
}

/// `GET /schemas/{name}`.
pub async fn get_schema(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&name) {
        Some(schema) => Json(schema.clone()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("schema '{name}' not found") })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct DetectRequest {
    pub sample_image_base64: String,
    pub description: Option<String>,
}

/// `POST /schemas/detect` - run detection against a sample page image.
pub async fn detect_schema(
    State(state): State<AppState>,
    Json(request): Json<DetectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let image = base64::engine::general_purpose::STANDARD
        .decode(request.sample_image_base64.as_bytes())
        .map_err(|e| ServiceError::InvalidRequest(format!("bad base64 image: {e}")))?;

    let detection = state
        .registry
        .detect(
            state.vision.as_ref(),
            &image,
            request.description.as_deref(),
        )
        .await
        .map_err(|e| match e {
            VisionError::RateLimited => ServiceError::RateLimited,
            other => ServiceError::Storage(format!("detection failed: {other}")),
        })?;

    Ok(Json(detection))
}
