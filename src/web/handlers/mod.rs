pub mod clips;
pub mod stream;

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::state::{AppState, StreamStatus};

// ============================================================================
// Health & Status
// ============================================================================

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub build_date: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        build_date: env!("BUILD_DATE"),
    })
}

/// Capture state, viewer counts and clip buffer fill
pub async fn stream_status(State(state): State<Arc<AppState>>) -> Json<StreamStatus> {
    Json(state.stream_status())
}
