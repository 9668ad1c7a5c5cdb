//! Download Routes
//!
//! - GET /api/download/:code - Stream the artifact behind a retrieval code

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::Response,
    routing::get,
    Router,
};

use crate::error::{AppError, Result};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/download/:code", get(download))
}

/// GET /api/download/:code
///
/// Expired codes answer 410 and are left for the sweeper.
async fn download(State(state): State<AppState>, Path(code): Path<String>) -> Result<Response> {
    let retrieved = state.relay().retrieval().retrieve(&code).await?;
    let disposition = retrieved.content_disposition();

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, retrieved.size)
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(Body::from_stream(retrieved.stream))
        .map_err(|e| AppError::Internal(format!("Failed to build download response: {e}")))
}
