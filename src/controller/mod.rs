//! Controller module for ObjectDeployment and ObjectSet reconciliation
//!
//! This module contains the controller runtime, the revision and slicing
//! logic, phase rollout with availability probes, and the shared helpers for
//! conditions, finalizers and optimistic concurrency.

pub mod chunker;
pub mod conditions;
mod deployment;
pub mod finalizers;
pub mod metrics;
mod objectset;
pub mod ownership;
pub mod probes;
mod reconcile;
pub mod retry;
mod runtime;
pub mod slices;

pub use chunker::Chunker;
pub use deployment::{list_revisions, template_hash, DeploymentController, DeploymentSettings};
pub use objectset::ObjectSetController;
pub use reconcile::{run_chain, ReconcileResult, Reconciler};
pub use retry::retry_on_conflict;
pub use runtime::{run_controller, ControllerState};
pub use slices::SliceStore;
