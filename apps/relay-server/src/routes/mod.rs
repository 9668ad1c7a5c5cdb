//! Route modules for the relay server

pub mod cleanup;
pub mod download;
pub mod health;
pub mod upload;

use axum::Router;

use crate::state::AppState;

/// Build the application router
pub fn router(state: AppState) -> Router {
    let max_chunk_bytes = state.config().relay.max_chunk_bytes;

    let api = upload::router(max_chunk_bytes)
        .merge(download::router())
        .merge(cleanup::router());

    Router::new()
        .nest("/health", health::router())
        .nest("/api", api)
        .with_state(state)
}
