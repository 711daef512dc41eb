//! Plain HTTP endpoints: service banner, liveness and a CORS probe.

use crate::AppState;
use axum::{Extension, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Service banner.
pub async fn index_handler() -> Json<Value> {
    Json(json!({
        "status": "Cadence voice server is running",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Health check handler.
///
/// Returns `200 OK` with server status, version and the number of live
/// sessions. Used by load balancers, monitoring and CI.
pub async fn health_handler(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.registry.len()
    }))
}

/// Lets a browser client check that its origin passes CORS.
pub async fn test_cors_handler() -> Json<Value> {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    Json(json!({
        "status": "CORS test successful",
        "timestamp": timestamp_ms
    }))
}
