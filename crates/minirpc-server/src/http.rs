//! HTTP server implementation using Axum.

use crate::bridge::handle_bridge;
use crate::debug::handle_debug;
use axum::{
    extract::DefaultBodyLimit,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use minirpc_core::{Registry, ServerConfig};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Application state shared across handlers.
pub struct AppState {
    /// Registry shared with the TCP server and the debug page
    pub registry: Arc<Registry>,
}

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Build the router serving the bridge, the debug page and the health check.
pub fn router(registry: Arc<Registry>) -> Router {
    let state = Arc::new(AppState { registry });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(ServerConfig::HEALTH_PATH, get(handle_health))
        .route(ServerConfig::RPC_PATH, post(handle_bridge))
        .route(ServerConfig::DEBUG_PATH, get(handle_debug))
        .layer(DefaultBodyLimit::max(ServerConfig::MAX_HTTP_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_http_server(registry: Arc<Registry>, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let app = router(registry);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("HTTP server listening on {}", actual_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    Ok(actual_addr)
}
