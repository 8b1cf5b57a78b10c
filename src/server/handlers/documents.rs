//! Document endpoints: upload, processing control, status, streaming,
//! listing, deletion, and spreadsheet downloads.

use std::convert::Infallible;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::{ApiError, AppState};
use crate::models::{Document, StatusSnapshot};
use crate::services::{ProcessOptions, ServiceError};

/// Document shape returned by the API.
#[derive(Debug, Serialize)]
pub struct DocumentResponse {
    pub id: i64,
    pub content_hash: String,
    pub filename: String,
    pub size: u64,
    pub page_count: Option<u32>,
    pub status: String,
    pub progress: f64,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&Document> for DocumentResponse {
    fn from(doc: &Document) -> Self {
        Self {
            id: doc.id,
            content_hash: doc.content_hash.clone(),
            filename: doc.original_filename.clone(),
            size: doc.byte_len,
            page_count: doc.page_count,
            status: doc.status.as_str().to_string(),
            progress: doc.progress,
            error_message: doc.error_message.clone(),
            created_at: doc.created_at.to_rfc3339(),
            updated_at: doc.updated_at.to_rfc3339(),
        }
    }
}

/// `POST /documents/upload` - multipart form with a `file` field.
pub async fn upload_document(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::InvalidRequest(format!("bad multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .unwrap_or("upload.pdf")
            .to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ServiceError::InvalidRequest(format!("failed to read upload: {e}")))?;

        let outcome = state.documents.upload(&data, &filename)?;
        let status = if outcome.created {
            StatusCode::CREATED
        } else {
            StatusCode::OK
        };
        return Ok((status, Json(DocumentResponse::from(&outcome.document))));
    }

    Err(ServiceError::InvalidRequest("missing 'file' form field".to_string()).into())
}

/// `POST /documents/process/{id}`.
pub async fn process_document(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Option<Json<ProcessOptions>>,
) -> Result<impl IntoResponse, ApiError> {
    let options = body.map(|Json(options)| options).unwrap_or_default();
    let ack = state.documents.start_processing(id, &options)?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

#[derive(Debug, Deserialize)]
pub struct BatchProcessRequest {
    pub document_ids: Vec<i64>,
    pub schema: Option<String>,
}

/// `POST /documents/batch/process`.
pub async fn batch_process(
    State(state): State<AppState>,
    Json(request): Json<BatchProcessRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.document_ids.is_empty() {
        return Err(
            ServiceError::InvalidRequest("document_ids must not be empty".to_string()).into(),
        );
    }
    let items = state
        .documents
        .batch_process(&request.document_ids, request.schema.as_deref());
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "items": items }))))
}

/// `GET /documents/{id}/status`.
pub async fn document_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<StatusSnapshot>, ApiError> {
    Ok(Json(state.documents.status(id)?))
}

struct StreamState {
    initial: Option<StatusSnapshot>,
    rx: broadcast::Receiver<StatusSnapshot>,
    done: bool,
}

fn snapshot_event(snapshot: &StatusSnapshot) -> Event {
    Event::default()
        .json_data(snapshot)
        .unwrap_or_else(|_| Event::default().data("{}"))
}

/// `GET /documents/{id}/stream` - SSE feed of status snapshots.
///
/// Emits the current snapshot, then one event per change, ending after
/// a terminal status.
pub async fn stream_document(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (snapshot, rx) = state.documents.stream(id).await?;

    let stream = futures::stream::unfold(
        StreamState {
            initial: Some(snapshot),
            rx,
            done: false,
        },
        |mut ctx| async move {
            if ctx.done {
                return None;
            }
            if let Some(snapshot) = ctx.initial.take() {
                ctx.done = snapshot.status.is_terminal();
                return Some((Ok(snapshot_event(&snapshot)), ctx));
            }
            loop {
                match ctx.rx.recv().await {
                    Ok(snapshot) => {
                        ctx.done = snapshot.status.is_terminal();
                        return Some((Ok(snapshot_event(&snapshot)), ctx));
                    }
                    // A slow consumer lost intermediate snapshots; newer
                    // ones are still coming.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub skip: Option<u32>,
    pub limit: Option<u32>,
    pub status: Option<String>,
}

/// `GET /documents/`.
pub async fn list_documents(
    State(state): State<AppState>,
    Query(params): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let skip = params.skip.unwrap_or(0);
    let limit = params.limit.unwrap_or(20);
    let (items, total) = state.documents.list(skip, limit, params.status.as_deref())?;

    let items: Vec<DocumentResponse> = items.iter().map(DocumentResponse::from).collect();
    Ok(Json(serde_json::json!({
        "items": items,
        "total": total,
        "skip": skip,
        "limit": limit.clamp(1, 100),
    })))
}

/// `DELETE /documents/{id}`.
pub async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.documents.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

fn xlsx_response(bytes: Vec<u8>, filename: &str) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, XLSX_MIME.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
}

#[derive(Debug, Deserialize)]
pub struct SingleDownloadQuery {
    pub include_metadata: Option<bool>,
}

/// `GET /documents/{id}/download/excel`.
pub async fn download_single(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<SingleDownloadQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let include_metadata = params.include_metadata.unwrap_or(true);
    let (bytes, filename) = state.export.single(id, include_metadata)?;
    Ok(xlsx_response(bytes, &filename))
}

#[derive(Debug, Deserialize)]
pub struct DocumentIdsQuery {
    /// Comma-separated document ids.
    pub document_ids: String,
}

fn parse_ids(raw: &str) -> Result<Vec<i64>, ApiError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>().map_err(|_| {
                ApiError::from(ServiceError::InvalidRequest(format!(
                    "invalid document id '{s}'"
                )))
            })
        })
        .collect()
}

/// `GET /documents/batch/download/excel`.
pub async fn download_batch(
    State(state): State<AppState>,
    Query(params): Query<DocumentIdsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let ids = parse_ids(&params.document_ids)?;
    let (bytes, filename) = state.export.batch(&ids)?;
    Ok(xlsx_response(bytes, &filename))
}

/// `GET /documents/template/download/excel`.
pub async fn download_template(
    State(state): State<AppState>,
    Query(params): Query<DocumentIdsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let ids = parse_ids(&params.document_ids)?;
    let (bytes, filename) = state.export.template(&ids)?;
    Ok(xlsx_response(bytes, &filename))
}
