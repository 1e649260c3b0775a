//! ObjectSlice storage, content-addressed naming and phase expansion

use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::crd::{
    ObjectDeployment, ObjectSetObject, ObjectSetTemplatePhase, ObjectSlice, ObjectSliceSpec,
    LABEL_DEPLOYMENT,
};
use crate::error::{Error, Result, ResultExt};
use crate::store::{self, selector, ObjectKey, ObjectKind, ObjectStore};

/// Characters that never spell words and survive DNS-1123 names
const SAFE_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Hash `value` into a short name-safe string.
/// A non-zero `collision_count` salts the hash.
pub fn compute_hash<T: Serialize>(value: &T, collision_count: i32) -> Result<String> {
    let mut hasher = Sha256::new();
    // serde_json orders object keys, which makes the encoding canonical
    hasher.update(serde_json::to_vec(value)?);
    if collision_count != 0 {
        hasher.update((collision_count as u32).to_le_bytes());
    }
    let digest = hasher.finalize();
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    Ok(safe_encode(&prefix.to_string()))
}

fn safe_encode(s: &str) -> String {
    s.bytes()
        .map(|b| SAFE_ALPHABET[b as usize % SAFE_ALPHABET.len()] as char)
        .collect()
}

/// Deterministic slice name for `objects` owned by `deployment`
pub fn name_for(deployment: &str, objects: &[ObjectSetObject], collision_count: i32) -> Result<String> {
    Ok(format!(
        "{}-{}",
        deployment,
        compute_hash(&objects, collision_count)?
    ))
}

pub struct SliceStore<'a> {
    store: &'a dyn ObjectStore,
}

impl<'a> SliceStore<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self { store }
    }

    /// Make sure a slice holding exactly `objects` exists and return its name.
    ///
    /// A slice of the same name with other content, or belonging to another
    /// deployment, is left untouched and reported as [`Error::SliceCollision`].
    pub async fn ensure(
        &self,
        deployment: &ObjectDeployment,
        objects: &[ObjectSetObject],
        collision_count: i32,
    ) -> Result<String> {
        let name = name_for(&deployment.name_any(), objects, collision_count)?;
        let namespace = deployment.namespace();

        let slice = ObjectSlice {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: namespace.clone(),
                labels: Some([(LABEL_DEPLOYMENT.to_string(), deployment.name_any())].into()),
                owner_references: deployment.controller_owner_ref(&()).map(|r| vec![r]),
                ..Default::default()
            },
            spec: ObjectSliceSpec {
                objects: objects.to_vec(),
            },
        };

        match store::create_typed(self.store, &slice).await {
            Ok(_) => {
                debug!("Created ObjectSlice {}", name);
                Ok(name)
            }
            Err(e) if e.is_already_exists() => {
                let existing = self
                    .get(namespace.as_deref(), &name)
                    .await
                    .context("re-reading existing ObjectSlice")?;
                let same_owner = existing.labels().get(LABEL_DEPLOYMENT) == Some(&deployment.name_any());
                if same_owner && existing.spec.objects == objects {
                    Ok(name)
                } else {
                    Err(Error::SliceCollision {
                        namespace: namespace.unwrap_or_default(),
                        name,
                    })
                }
            }
            Err(e) => Err(e.context("creating ObjectSlice")),
        }
    }

    pub async fn get(&self, namespace: Option<&str>, name: &str) -> Result<ObjectSlice> {
        store::get_typed(self.store, namespace, name).await
    }

    /// Delete a slice. A slice that is already gone counts as deleted.
    pub async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let key = ObjectKey::new(ObjectKind::of::<ObjectSlice>(), namespace, name);
        match self.store.delete(&key).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Slices labelled as belonging to `deployment`
    pub async fn list_for(&self, deployment: &ObjectDeployment) -> Result<Vec<ObjectSlice>> {
        let name = deployment.name_any();
        let selector = selector::from_labels([(LABEL_DEPLOYMENT, name.as_str())]);
        store::list_typed(self.store, deployment.namespace().as_deref(), &selector).await
    }

    /// Resolve slice references into inline objects.
    /// Inline objects come first, then the objects of each slice in order.
    pub async fn expand_phases(
        &self,
        namespace: Option<&str>,
        phases: &[ObjectSetTemplatePhase],
    ) -> Result<Vec<ObjectSetTemplatePhase>> {
        let mut expanded = Vec::with_capacity(phases.len());
        for phase in phases {
            let mut objects = phase.objects.clone();
            for slice_name in &phase.slices {
                let slice = self.get(namespace, slice_name).await.with_context(|| {
                    format!("expanding ObjectSlice {} of phase {}", slice_name, phase.name)
                })?;
                objects.extend(slice.spec.objects);
            }
            expanded.push(ObjectSetTemplatePhase::inline(&phase.name, objects));
        }
        Ok(expanded)
    }
}
