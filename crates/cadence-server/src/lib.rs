//! Cadence server library logic.

pub mod api;
pub mod api_ws;
pub mod config;

use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Extension, Router,
};
use cadence_conversation::SessionRegistry;
use cadence_voice::{ConversationOptions, PortFactory};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Live sessions.
    pub registry: SessionRegistry,
    /// Builds the transcriber, agent and synthesizer for each conversation.
    pub ports: Arc<dyn PortFactory>,
    /// Options every conversation is bound with.
    pub conversation: ConversationOptions,
    /// Origins allowed by CORS. Empty allows any origin.
    pub cors_origins: Vec<String>,
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let cors = cors_layer(&state.cors_origins);

    Router::new()
        .route("/", get(api::index_handler))
        .route("/health", get(api::health_handler))
        .route("/api/health", get(api::health_handler))
        .route("/test-cors", get(api::test_cors_handler))
        .route("/ws", get(api_ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(Extension(Arc::new(state)))
}
