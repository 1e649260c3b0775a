//! Custom Resource Definitions for the package operator
//!
//! This module defines the Kubernetes CRDs for phased, revisioned object rollout.

mod object_deployment;
mod object_set;
mod object_slice;
mod types;


pub use object_deployment::{ObjectDeployment, ObjectDeploymentSpec, ObjectDeploymentStatus};
pub use object_set::{LifecycleState, ObjectSet, ObjectSetPhase, ObjectSetSpec, ObjectSetStatus};
pub use object_slice::{ObjectSlice, ObjectSliceSpec};
pub use types::*;

pub use crate::cache::LABEL_CACHE;

/// Names the ObjectDeployment an ObjectSet, ObjectSlice or child object belongs to
pub const LABEL_DEPLOYMENT: &str = "package-operator.run/deployment";
/// Revision number of the ObjectSet that applied a child object
pub const LABEL_REVISION: &str = "package-operator.run/revision";
/// Marks an object that is only observed, never written
pub const ANNOTATION_EXTERNAL: &str = "package-operator.run/external";
