//! Axum Router Configuration
//!
//! This module defines the HTTP routing for the application: the WebSocket
//! endpoint, the Prometheus scrape endpoint and a health probe.

use crate::{state::AppState, ws::ws_handler};
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use std::sync::Arc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health))
        .with_state(app_state)
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

async fn health() -> &'static str {
    "ok"
}
