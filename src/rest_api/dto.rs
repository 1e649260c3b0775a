//! Response bodies of the REST API

use serde::Serialize;

use crate::cache::CacheEntry;

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Dynamic cache registrations, one entry per watched kind
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CacheResponse {
    pub informers: usize,
    pub entries: Vec<CacheEntry>,
}

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}
