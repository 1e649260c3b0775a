//! ObjectSet Custom Resource Definition
//!
//! An ObjectSet is one immutable revision of an ObjectDeployment. Its phases
//! are applied in order, each gated on the availability probes.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, ControlledObjectReference, ObjectSetProbe, ObjectSetTemplatePhase,
    CONDITION_AVAILABLE,
};
use super::LABEL_DEPLOYMENT;

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "package-operator.run",
    version = "v1alpha1",
    kind = "ObjectSet",
    namespaced,
    status = "ObjectSetStatus",
    shortname = "os",
    printcolumn = r#"{"name":"Revision","type":"integer","jsonPath":".spec.revision"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetSpec {
    /// Monotonic revision number within the owning deployment
    pub revision: i64,

    #[serde(default)]
    pub lifecycle_state: LifecycleState,

    /// Set when the revision is sealed. Phases never change afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_hash: Option<String>,

    #[serde(default)]
    pub phases: Vec<ObjectSetTemplatePhase>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability_probes: Vec<ObjectSetProbe>,
}

/// Requested lifecycle of a revision
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LifecycleState {
    #[default]
    Active,
    /// Stop writing to child objects, only report status
    Paused,
    /// Tear down child objects still controlled by this revision
    Archived,
}

/// Observed progress of a revision
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ObjectSetPhase {
    #[default]
    Pending,
    Progressing,
    Available,
    Paused,
    Archived,
    Terminating,
}

/// Status subresource for ObjectSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetStatus {
    #[serde(default)]
    pub phase: ObjectSetPhase,

    /// Phase that is currently being rolled out or blocked.
    /// Always serialized so a merge patch can clear it.
    #[serde(default)]
    pub active_phase: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Objects this revision is the controller of
    #[serde(default)]
    pub controller_of: Vec<ControlledObjectReference>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ObjectSet {
    /// A sealed revision carries its template hash and has final phases
    pub fn is_sealed(&self) -> bool {
        self.spec.template_hash.is_some()
    }

    pub fn is_archived(&self) -> bool {
        self.spec.lifecycle_state == LifecycleState::Archived
    }

    pub fn deployment_name(&self) -> Option<&str> {
        self.labels().get(LABEL_DEPLOYMENT).map(String::as_str)
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// Available=True, computed for the current generation
    pub fn is_available(&self) -> bool {
        self.conditions().iter().any(|c| {
            c.type_ == CONDITION_AVAILABLE
                && c.is_true()
                && c.observed_generation
                    .map_or(true, |g| Some(g) == self.metadata.generation)
        })
    }

    pub fn controller_of(&self) -> &[ControlledObjectReference] {
        self.status
            .as_ref()
            .map(|s| s.controller_of.as_slice())
            .unwrap_or_default()
    }
}
