//! Cleanup Routes
//!
//! - GET /api/cleanup - Run one expiry sweep on demand

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::relay::SweepReport;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/cleanup", get(cleanup))
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub message: String,
    #[serde(flatten)]
    pub report: SweepReport,
}

/// GET /api/cleanup
///
/// Always 200; per-entry failures are logged and reported in `failed`.
async fn cleanup(State(state): State<AppState>) -> Json<CleanupResponse> {
    let report = state.relay().sweeper().sweep_at(chrono::Utc::now()).await;

    Json(CleanupResponse {
        message: format!("{} entries removed", report.removed),
        report,
    })
}
