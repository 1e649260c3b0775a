//! Package operator
//!
//! Rolls out ObjectDeployments as immutable, revisioned ObjectSets whose
//! phases are applied in order and gated on availability probes. Large
//! phases are split into content-addressed ObjectSlices. Child objects are
//! observed through a dynamic cache that watches only the kinds in use.

pub mod cache;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod rest_api;
pub mod store;

pub use error::{Error, Result};
