//! Controller ownership of child objects

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};

use crate::crd::{ControlledObjectReference, ObjectSet, LABEL_DEPLOYMENT, LABEL_REVISION};
use crate::error::Result;
use crate::store::{ObjectKey, ObjectKind};

/// Who controls a live object, seen from one ObjectSet
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// Controlled by this ObjectSet
    Ours,
    /// Controlled by an earlier revision of the same deployment
    OlderRevision,
    /// Controlled by a later revision of the same deployment
    NewerRevision,
    /// Controlled by something else, described
    Foreign(String),
    /// No controller at all
    Unowned,
}

pub fn controller_of(obj: &DynamicObject) -> Option<&OwnerReference> {
    obj.owner_references()
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Make `set` the only controller of `obj`, keeping non-controller references
pub fn set_controller(obj: &mut DynamicObject, set: &ObjectSet) {
    let mut references: Vec<OwnerReference> = obj
        .owner_references()
        .iter()
        .filter(|r| r.controller != Some(true))
        .cloned()
        .collect();
    references.extend(set.controller_owner_ref(&()));
    obj.metadata.owner_references = Some(references);
}

pub fn classify(live: &DynamicObject, set: &ObjectSet) -> Ownership {
    let Some(controller) = controller_of(live) else {
        return Ownership::Unowned;
    };
    if set.meta().uid.as_deref() == Some(controller.uid.as_str()) {
        return Ownership::Ours;
    }

    let foreign = || Ownership::Foreign(format!("{} {}", controller.kind, controller.name));
    if controller.kind != ObjectSet::kind(&()) || controller.api_version != ObjectSet::api_version(&()) {
        return foreign();
    }
    let same_deployment = set.deployment_name().is_some()
        && live.labels().get(LABEL_DEPLOYMENT).map(String::as_str) == set.deployment_name();
    let revision = live
        .labels()
        .get(LABEL_REVISION)
        .and_then(|r| r.parse::<i64>().ok());
    match revision {
        Some(r) if same_deployment && r < set.spec.revision => Ownership::OlderRevision,
        Some(r) if same_deployment && r > set.spec.revision => Ownership::NewerRevision,
        _ => foreign(),
    }
}

pub fn controlled_reference(obj: &DynamicObject) -> Result<ControlledObjectReference> {
    let key = ObjectKey::of(obj)?;
    Ok(ControlledObjectReference {
        kind: key.kind.kind,
        group: key.kind.group,
        version: key.kind.version,
        name: key.name,
        namespace: key.namespace.unwrap_or_default(),
    })
}

/// Address of a controlled object. References recorded without a version
/// cannot be resolved.
pub fn reference_key(reference: &ControlledObjectReference) -> Option<ObjectKey> {
    if reference.version.is_empty() {
        return None;
    }
    let namespace = (!reference.namespace.is_empty()).then_some(reference.namespace.as_str());
    Some(ObjectKey::new(
        ObjectKind::new(&reference.group, &reference.version, &reference.kind),
        namespace,
        &reference.name,
    ))
}
