//! Shared types for object set templates
//!
//! These types are used across the CRD definitions and controller logic.

use std::collections::BTreeMap;

use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Schema for fields holding arbitrary Kubernetes objects or selectors
pub(crate) fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

/// Template for creating new ObjectSets
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetTemplate {
    /// Metadata stamped onto every ObjectSet created from this template
    #[serde(default)]
    pub metadata: TemplateMetadata,
    /// Phases and probes
    #[serde(default)]
    pub spec: ObjectSetTemplateSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Ordered phases plus the probes gating them
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetTemplateSpec {
    /// Reconcile phases, applied in order
    #[serde(default)]
    pub phases: Vec<ObjectSetTemplatePhase>,

    /// Availability probes check objects that are part of the package.
    /// Failing probes prevent the reconciliation of objects in later phases.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability_probes: Vec<ObjectSetProbe>,
}

impl ObjectSetTemplateSpec {
    /// Names of all slices referenced by any phase
    pub fn slice_names(&self) -> impl Iterator<Item = &str> {
        self.phases
            .iter()
            .flat_map(|p| p.slices.iter().map(String::as_str))
    }
}

/// A named, ordered group of objects
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetTemplatePhase {
    /// Name of the phase. Must be unique within a template.
    pub name: String,

    /// Objects stored inline
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<ObjectSetObject>,

    /// Names of ObjectSlices holding the rest of this phase's objects.
    /// Expanded after the inline objects, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slices: Vec<String>,
}

impl ObjectSetTemplatePhase {
    pub fn inline(name: &str, objects: Vec<ObjectSetObject>) -> Self {
        Self {
            name: name.to_string(),
            objects,
            slices: vec![],
        }
    }
}

/// An object that is part of a phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetObject {
    /// The full object manifest (apiVersion, kind, metadata, ...)
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub object: serde_json::Value,

    /// Conditions of the live object to copy into the ObjectSet status
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub condition_mappings: Vec<ConditionMapping>,
}

impl ObjectSetObject {
    pub fn new(object: serde_json::Value) -> Self {
        Self {
            object,
            condition_mappings: vec![],
        }
    }
}

/// Maps a condition type of a child object to a prefixed type on the ObjectSet
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConditionMapping {
    /// Condition type on the live object, e.g. "Available"
    pub source_type: String,
    /// Condition type on the ObjectSet. Must contain a "/" prefix, e.g. "my-prefix/Available"
    pub destination_type: String,
}

/// Binds probes to the objects matched by a selector
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetProbe {
    pub selector: ProbeSelector,
    pub probes: Vec<Probe>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSelector {
    /// Group and kind of the probed objects
    pub kind: ProbeKind,
    /// Optional label selector narrowing the probed objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub selector: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeKind {
    #[serde(default)]
    pub group: String,
    pub kind: String,
}

/// A declarative availability check against a live object
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum Probe {
    /// `.status.conditions[]` contains the type with the given status
    Condition {
        #[serde(rename = "type")]
        type_: String,
        status: String,
    },
    /// Values at two field paths are present and equal
    #[serde(rename_all = "camelCase")]
    FieldsEqual { field_a: String, field_b: String },
    /// Value at the field path equals the given JSON value
    #[serde(rename_all = "camelCase")]
    FieldValue {
        field_path: String,
        #[schemars(schema_with = "preserve_unknown_fields")]
        value: serde_json::Value,
    },
    /// Field path is present
    #[serde(rename_all = "camelCase")]
    Exists { field_path: String },
}

/// Reference to an object controlled by an ObjectSet
#[derive(
    Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "camelCase")]
pub struct ControlledObjectReference {
    pub kind: String,
    #[serde(default)]
    pub group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Condition for status reporting (Kubernetes convention)
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Available", "Progressing")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Generation of the object the condition was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(type_: &str, status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        }
    }

    /// Create a new Available condition
    pub fn available(status: bool, reason: &str, message: &str) -> Self {
        Self::new(CONDITION_AVAILABLE, status, reason, message)
    }

    /// Create a new Progressing condition
    pub fn progressing(status: bool, reason: &str, message: &str) -> Self {
        Self::new(CONDITION_PROGRESSING, status, reason, message)
    }

    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

pub const CONDITION_AVAILABLE: &str = "Available";
pub const CONDITION_PROGRESSING: &str = "Progressing";
pub const CONDITION_SLICE_COLLISION: &str = "SliceCollision";
