//! Axum HTTP server for health, metrics and cache introspection

use std::net::SocketAddr;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::handlers;
use crate::cache::DynamicCache;
use crate::error::{Error, Result};

/// State shared by the handlers
#[derive(Clone)]
pub struct ApiState {
    pub cache: DynamicCache,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/api/v1/cache", get(handlers::cache))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the REST API server
pub async fn run_server(addr: SocketAddr, cache: DynamicCache) -> Result<()> {
    let app = router(ApiState { cache });
    info!("REST API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}
