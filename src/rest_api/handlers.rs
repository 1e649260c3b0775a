//! Request handlers for the REST API

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use prometheus_client::encoding::text::encode;
use tracing::error;

use super::dto::{CacheResponse, ErrorResponse, HealthResponse};
use super::server::ApiState;
use crate::controller::metrics::REGISTRY;

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Prometheus text exposition of the operator registry
pub async fn metrics() -> impl IntoResponse {
    let mut buffer = String::new();
    match encode(&mut buffer, &REGISTRY) {
        Ok(()) => (StatusCode::OK, buffer).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

pub async fn cache(State(state): State<ApiState>) -> Json<CacheResponse> {
    let entries = state.cache.snapshot();
    Json(CacheResponse {
        informers: entries.len(),
        entries,
    })
}
