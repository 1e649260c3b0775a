//! REST API module for operational introspection
//!
//! Serves health, Prometheus metrics and a snapshot of the dynamic cache.

mod dto;
mod handlers;
mod server;

pub use dto::{CacheResponse, HealthResponse};
pub use server::{router, run_server, ApiState};
