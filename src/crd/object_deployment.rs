//! ObjectDeployment Custom Resource Definition
//!
//! An ObjectDeployment holds the mutable desired state of a package. The
//! controller turns its template into immutable ObjectSet revisions.

use std::collections::HashSet;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{preserve_unknown_fields, Condition, ObjectSetTemplate};
use crate::store::selector;

/// Desired state of a phased, revisioned set of objects.
///
/// # Example
///
/// ```yaml
/// apiVersion: package-operator.run/v1alpha1
/// kind: ObjectDeployment
/// metadata:
///   name: my-app
///   namespace: apps
/// spec:
///   selector:
///     matchLabels:
///       app: my-app
///   template:
///     metadata:
///       labels:
///         app: my-app
///     spec:
///       phases:
///         - name: config
///           objects:
///             - object:
///                 apiVersion: v1
///                 kind: ConfigMap
///                 metadata:
///                   name: my-app-config
///                 data:
///                   key: value
///       availabilityProbes:
///         - selector:
///             kind:
///               group: apps
///               kind: Deployment
///           probes:
///             - condition:
///                 type: Available
///                 status: "True"
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "package-operator.run",
    version = "v1alpha1",
    kind = "ObjectDeployment",
    namespaced,
    status = "ObjectDeploymentStatus",
    shortname = "objdeploy",
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.conditions[?(@.type==\"Available\")].status"}"#,
    printcolumn = r#"{"name":"Revision","type":"integer","jsonPath":".status.revision"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDeploymentSpec {
    /// Number of archived revisions to keep around.
    /// The operator default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,

    /// Selects the ObjectSets belonging to this deployment.
    /// Must match the template labels.
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub selector: LabelSelector,

    /// Template for new revisions
    pub template: ObjectSetTemplate,
}

impl ObjectDeploymentSpec {
    /// Validate the spec
    pub fn validate(&self) -> Result<(), String> {
        if self.revision_history_limit.is_some_and(|limit| limit < 0) {
            return Err("revisionHistoryLimit must not be negative".to_string());
        }

        selector::parse(&self.selector).map_err(|e| e.to_string())?;
        if !selector::matches(&self.selector, &self.template.metadata.labels) {
            return Err("selector does not match template labels".to_string());
        }

        let mut seen = HashSet::new();
        for phase in &self.template.spec.phases {
            if phase.name.trim().is_empty() {
                return Err("phase names must not be empty".to_string());
            }
            if !seen.insert(phase.name.as_str()) {
                return Err(format!("duplicate phase name {:?}", phase.name));
            }
            for obj in &phase.objects {
                validate_object(&phase.name, obj)?;
            }
        }

        Ok(())
    }
}

fn validate_object(phase: &str, obj: &super::ObjectSetObject) -> Result<(), String> {
    let manifest = &obj.object;
    for field in ["apiVersion", "kind"] {
        if manifest.get(field).and_then(|v| v.as_str()).is_none() {
            return Err(format!("object in phase {:?} is missing {}", phase, field));
        }
    }
    if manifest
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .is_none()
    {
        return Err(format!(
            "object in phase {:?} is missing metadata.name",
            phase
        ));
    }
    for mapping in &obj.condition_mappings {
        if !mapping.destination_type.contains('/') {
            return Err(format!(
                "conditionMapping destinationType {:?} must be prefixed with a domain",
                mapping.destination_type
            ));
        }
    }
    Ok(())
}

/// Status subresource for ObjectDeployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDeploymentStatus {
    /// Available, Progressing, SliceCollision and mapped conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Salt for slice names, incremented on every slice name collision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,

    /// Hash of the template the newest revision was built from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_hash: Option<String>,

    /// Newest revision number
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ObjectDeployment {
    pub fn collision_count(&self) -> i32 {
        self.status
            .as_ref()
            .and_then(|s| s.collision_count)
            .unwrap_or(0)
    }
}
