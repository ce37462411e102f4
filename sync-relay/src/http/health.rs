//! Health check endpoint.

use crate::server::SyncRelay;
use axum::{Extension, Json};
use std::sync::Arc;
use sync_types::HealthResponse;

/// Health check handler.
pub async fn health_handler(Extension(relay): Extension<Arc<SyncRelay>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: relay.uptime_seconds(),
    })
}
