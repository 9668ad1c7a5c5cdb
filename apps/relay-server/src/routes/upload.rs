//! Upload Routes
//!
//! Endpoints:
//! - POST /api/upload-chunk - Store one chunk (multipart `chunk`, `chunkIndex`, `fileName`)
//! - POST /api/merge-file?fileName= - Fold the stored chunks and mint a code

use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::relay::ChunkReceipt;
use crate::state::AppState;

// ============================================================================
// Router
// ============================================================================

/// Create the upload router. `max_chunk_bytes` bounds the multipart body.
pub fn router(max_chunk_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/upload-chunk", post(upload_chunk))
        .layer(DefaultBodyLimit::max(max_chunk_bytes))
        .route("/merge-file", post(merge_file))
}

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ChunkUploadResponse {
    pub message: &'static str,
    #[serde(flatten)]
    pub receipt: ChunkReceipt,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeQuery {
    pub file_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MergeResponse {
    pub code: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/upload-chunk
async fn upload_chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ChunkUploadResponse>> {
    let mut chunk = None;
    let mut chunk_index = None;
    let mut file_name = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "chunk" => chunk = Some(field.bytes().await?),
            "chunkIndex" => {
                let raw = field.text().await?;
                let index = raw.trim().parse::<u64>().map_err(|_| {
                    AppError::BadRequest(format!("Invalid chunkIndex: {raw:?}"))
                })?;
                chunk_index = Some(index);
            }
            "fileName" => file_name = Some(field.text().await?),
            other => {
                tracing::debug!(field = %other, "Ignoring unknown multipart field");
            }
        }
    }

    let chunk = chunk.ok_or_else(|| AppError::BadRequest("Missing chunk".into()))?;
    let chunk_index =
        chunk_index.ok_or_else(|| AppError::BadRequest("Missing chunkIndex".into()))?;
    let file_name = file_name.ok_or_else(|| AppError::BadRequest("Missing fileName".into()))?;

    let receipt = state
        .relay()
        .chunks()
        .put(&file_name, chunk_index, &chunk)
        .await?;

    Ok(Json(ChunkUploadResponse {
        message: "Chunk uploaded",
        receipt,
    }))
}

/// POST /api/merge-file?fileName=
async fn merge_file(
    State(state): State<AppState>,
    Query(query): Query<MergeQuery>,
) -> Result<Json<MergeResponse>> {
    let file_name = query
        .file_name
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing fileName".into()))?;

    let outcome = state.relay().reassembler().merge(&file_name).await?;

    Ok(Json(MergeResponse { code: outcome.code }))
}

// ============================================================================
// Tests
// ============================================================================
