//! ObjectSlice Custom Resource Definition
//!
//! Out-of-line storage for the objects of an oversized phase. Slices are
//! named by a hash of their content and are never modified once created.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ObjectSetObject;

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "package-operator.run",
    version = "v1alpha1",
    kind = "ObjectSlice",
    namespaced,
    shortname = "oslice"
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSliceSpec {
    pub objects: Vec<ObjectSetObject>,
}
