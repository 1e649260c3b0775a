//! ObjectSet reconciliation
//!
//! Applies the phases of one sealed revision in order. Every object is
//! watched through the dynamic cache before it is written, and a phase only
//! starts once the probes of all earlier phases succeed. Archived and
//! deleted revisions tear their objects down in reverse phase order.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::conditions::{condition_from_object, is_mapped_condition, set_condition};
use super::finalizers::{
    ensure_cached_finalizer, ensure_finalizer, free_cache_and_remove_finalizer, remove_finalizer,
    FINALIZER_TEARDOWN,
};
use super::ownership::{classify, controlled_reference, reference_key, set_controller, Ownership};
use super::probes;
use super::reconcile::{ReconcileResult, Reconciler};
use super::slices::SliceStore;
use crate::cache::{ensure_dynamic_cache_label, DynamicCache};
use crate::crd::{
    Condition, LifecycleState, ObjectSet, ObjectSetPhase, ObjectSetStatus,
    ANNOTATION_EXTERNAL, LABEL_DEPLOYMENT, LABEL_REVISION,
};
use crate::error::{Result, ResultExt};
use crate::store::{self, is_json_subset, ObjectKey, ObjectKind, ObjectStore};

/// Kinds that never get a namespace defaulted
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "PriorityClass",
    "StorageClass",
    "PersistentVolume",
    "ValidatingWebhookConfiguration",
    "MutatingWebhookConfiguration",
    "APIService",
];

/// Recheck interval while a probe fails
const PROBE_RETRY: Duration = Duration::from_secs(30);
/// Recheck interval while objects are being torn down
const TEARDOWN_RETRY: Duration = Duration::from_secs(5);

/// Outcome of applying one object
enum Applied {
    Live(DynamicObject),
    /// A newer revision controls the object
    Skipped,
    NotOwned(String),
}

pub struct ObjectSetController {
    store: Arc<dyn ObjectStore>,
    cache: DynamicCache,
}

#[async_trait]
impl Reconciler<ObjectSet> for ObjectSetController {
    async fn reconcile(&self, set: &mut ObjectSet) -> Result<ReconcileResult> {
        if set.meta().deletion_timestamp.is_some() {
            return self.finalize(set).await;
        }

        match set.spec.lifecycle_state {
            LifecycleState::Paused => {
                let mut status = current_status(set);
                status.phase = ObjectSetPhase::Paused;
                self.write_status(set, status).await
            }
            LifecycleState::Archived => self.archive(set).await,
            LifecycleState::Active if !set.is_sealed() => {
                let mut status = current_status(set);
                status.phase = ObjectSetPhase::Pending;
                self.write_status(set, status).await
            }
            LifecycleState::Active => self.rollout(set).await,
        }
    }
}

fn current_status(set: &ObjectSet) -> ObjectSetStatus {
    set.status.clone().unwrap_or_default()
}

fn is_external(object: &Value) -> bool {
    object
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(ANNOTATION_EXTERNAL))
        .and_then(Value::as_str)
        == Some("True")
}

impl ObjectSetController {
    pub fn new(store: Arc<dyn ObjectStore>, cache: DynamicCache) -> Self {
        Self { store, cache }
    }

    async fn write_status(
        &self,
        set: &mut ObjectSet,
        mut status: ObjectSetStatus,
    ) -> Result<ReconcileResult> {
        status.observed_generation = set.metadata.generation;
        if set.status.as_ref() == Some(&status) {
            return Ok(ReconcileResult::done());
        }
        *set = store::patch_status(&*self.store, set, &status)
            .await
            .context("updating ObjectSet status")?;
        Ok(ReconcileResult {
            requeue_after: None,
            status_changed: true,
        })
    }

    /// Desired form of a phase object: namespace defaulted, labels stamped
    /// and, unless it is external, controlled by `set`
    fn prepare(&self, set: &ObjectSet, object: &Value) -> Result<DynamicObject> {
        let mut obj: DynamicObject = serde_json::from_value(object.clone())?;
        let kind = ObjectKind::of_object(&obj)?;
        if obj.metadata.namespace.is_none() && !CLUSTER_SCOPED_KINDS.contains(&kind.kind.as_str()) {
            obj.metadata.namespace = set.namespace();
        }
        if is_external(object) {
            return Ok(obj);
        }

        ensure_dynamic_cache_label(&mut obj);
        let labels = obj.labels_mut();
        if let Some(deployment) = set.deployment_name() {
            labels.insert(LABEL_DEPLOYMENT.to_string(), deployment.to_string());
        }
        labels.insert(LABEL_REVISION.to_string(), set.spec.revision.to_string());
        set_controller(&mut obj, set);
        Ok(obj)
    }

    async fn rollout(&self, set: &mut ObjectSet) -> Result<ReconcileResult> {
        // Both finalizers must be in place before the first watch
        ensure_cached_finalizer(&*self.store, set)
            .await
            .context("adding cached finalizer")?;
        ensure_finalizer(&*self.store, set, FINALIZER_TEARDOWN)
            .await
            .context("adding teardown finalizer")?;

        let phases = SliceStore::new(&*self.store)
            .expand_phases(set.namespace().as_deref(), &set.spec.phases)
            .await?;
        let generation = set.metadata.generation;

        let mut status = current_status(set);
        let mut mapped = vec![];
        let mut controller_of = vec![];
        let mut requeue_after = None;
        let mut blocked = None;

        for phase in &phases {
            let mut not_owned = vec![];
            let mut failures = vec![];

            for object in &phase.objects {
                let desired = self.prepare(set, &object.object)?;
                let key = ObjectKey::of(&desired)?;
                let external = is_external(&object.object);

                let live = if external {
                    match self.store.get(&key).await {
                        Ok(live) => live,
                        Err(e) if e.is_not_found() => {
                            failures.push(format!("external {} does not exist", key));
                            continue;
                        }
                        Err(e) => return Err(e.context("reading external object")),
                    }
                } else {
                    self.cache
                        .watch(&*set, &desired)
                        .await
                        .with_context(|| format!("watching {}", key.kind))?;
                    match self.apply(set, &desired).await? {
                        Applied::Live(live) => {
                            controller_of.push(controlled_reference(&live)?);
                            live
                        }
                        Applied::Skipped => {
                            debug!("{} is controlled by a newer revision", key);
                            continue;
                        }
                        Applied::NotOwned(owner) => {
                            not_owned.push(format!("{} is controlled by {}", key, owner));
                            continue;
                        }
                    }
                };

                let live_value = serde_json::to_value(&live)?;
                failures.extend(
                    probes::evaluate(&set.spec.availability_probes, &live_value)
                        .into_iter()
                        .map(|f| format!("{}: {}", key, f)),
                );
                for mapping in &object.condition_mappings {
                    mapped.extend(condition_from_object(&live_value, mapping, generation));
                }
            }

            if !not_owned.is_empty() {
                blocked = Some((phase, "ObjectNotOwned", not_owned.join("; ")));
                break;
            }
            if !failures.is_empty() {
                requeue_after = Some(PROBE_RETRY);
                blocked = Some((phase, "ProbeFailure", failures.join("; ")));
                break;
            }
        }

        // Mapped conditions of objects no longer observed are dropped
        status
            .conditions
            .retain(|c| !is_mapped_condition(c) || mapped.iter().any(|m| m.type_ == c.type_));
        for condition in mapped {
            set_condition(&mut status.conditions, condition);
        }
        controller_of.sort();
        controller_of.dedup();
        status.controller_of = controller_of;
        match blocked {
            Some((phase, reason, message)) => {
                info!(
                    "ObjectSet {} blocked in phase {}: {}",
                    set.name_any(),
                    phase.name,
                    message
                );
                status.phase = ObjectSetPhase::Progressing;
                status.active_phase = Some(phase.name.clone());
                set_condition(
                    &mut status.conditions,
                    Condition::available(false, reason, &message).with_generation(generation),
                );
            }
            None => {
                status.phase = ObjectSetPhase::Available;
                status.active_phase = None;
                set_condition(
                    &mut status.conditions,
                    Condition::available(true, "Available", "all phases are available")
                        .with_generation(generation),
                );
            }
        }

        let mut result = self.write_status(set, status).await?;
        result.requeue_after = requeue_after;
        Ok(result)
    }

    /// Create the object or bring an owned one up to date
    async fn apply(&self, set: &ObjectSet, desired: &DynamicObject) -> Result<Applied> {
        let key = ObjectKey::of(desired)?;
        let live = match self.cache.get(&key) {
            Ok(live) => live,
            Err(e) if e.is_not_found() => match self.store.create(desired).await {
                Ok(created) => {
                    info!("Created {}", key);
                    return Ok(Applied::Live(created));
                }
                // The cache has not seen it yet
                Err(e) if e.is_already_exists() => self.store.get(&key).await?,
                Err(e) => return Err(e.context("creating object")),
            },
            Err(e) => return Err(e),
        };

        match classify(&live, set) {
            Ownership::Ours | Ownership::OlderRevision => {
                let desired_value = serde_json::to_value(desired)?;
                if is_json_subset(&desired_value, &serde_json::to_value(&live)?) {
                    return Ok(Applied::Live(live));
                }
                let patched = self
                    .store
                    .patch(&key, &desired_value)
                    .await
                    .with_context(|| format!("patching {}", key))?;
                debug!("Patched {}", key);
                Ok(Applied::Live(patched))
            }
            Ownership::NewerRevision => Ok(Applied::Skipped),
            Ownership::Foreign(owner) => Ok(Applied::NotOwned(owner)),
            Ownership::Unowned => Ok(Applied::NotOwned("nobody".to_string())),
        }
    }

    /// Delete the objects this revision controls, last phase first.
    /// Returns true once nothing controlled by `set` is left.
    async fn teardown(&self, set: &ObjectSet) -> Result<bool> {
        for (phase, keys) in self.teardown_plan(set).await? {
            let mut remaining = 0;
            for key in &keys {
                if self.delete_if_controlled(set, key).await? {
                    remaining += 1;
                }
            }
            if remaining > 0 {
                debug!(
                    "Waiting for {} objects of phase {} to be deleted",
                    remaining, phase
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Keys of the non-external objects of each phase, last phase first.
    /// Objects of slices that no longer exist are taken from
    /// `status.controllerOf` and removed with the last phase that lost one.
    async fn teardown_plan(&self, set: &ObjectSet) -> Result<Vec<(String, Vec<ObjectKey>)>> {
        let slices = SliceStore::new(&*self.store);
        let namespace = set.namespace();
        let mut plan = Vec::with_capacity(set.spec.phases.len());
        let mut known = BTreeSet::new();
        let mut incomplete = None;

        for phase in &set.spec.phases {
            let mut objects = phase.objects.clone();
            for slice_name in &phase.slices {
                match slices.get(namespace.as_deref(), slice_name).await {
                    Ok(slice) => objects.extend(slice.spec.objects),
                    Err(e) if e.is_not_found() => {
                        warn!(
                            "ObjectSlice {} of phase {} is gone, tearing down its objects from status",
                            slice_name, phase.name
                        );
                        incomplete = Some(plan.len());
                    }
                    Err(e) => {
                        return Err(e.context(format!(
                            "expanding ObjectSlice {} of phase {}",
                            slice_name, phase.name
                        )))
                    }
                }
            }

            let mut keys = vec![];
            for object in objects.iter().filter(|o| !is_external(&o.object)) {
                let key = ObjectKey::of(&self.prepare(set, &object.object)?)?;
                known.insert(key.clone());
                keys.push(key);
            }
            plan.push((phase.name.clone(), keys));
        }

        if let Some(index) = incomplete {
            let leftovers: Vec<ObjectKey> = set
                .controller_of()
                .iter()
                .filter_map(reference_key)
                .filter(|key| !known.contains(key))
                .collect();
            plan[index].1.extend(leftovers);
        }
        plan.reverse();
        Ok(plan)
    }

    /// Returns whether the object still exists afterwards
    async fn delete_if_controlled(&self, set: &ObjectSet, key: &ObjectKey) -> Result<bool> {
        let live = match self.store.get(key).await {
            Ok(live) => live,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        if classify(&live, set) != Ownership::Ours {
            return Ok(false);
        }

        if live.metadata.deletion_timestamp.is_none() {
            info!("Deleting {}", key);
            match self.store.delete(key).await {
                Err(e) if !e.is_not_found() => {
                    return Err(e.context(format!("deleting {}", key)));
                }
                _ => {}
            }
        }
        match self.store.get(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn archive(&self, set: &mut ObjectSet) -> Result<ReconcileResult> {
        if !self.teardown(set).await? {
            return Ok(ReconcileResult::requeue(TEARDOWN_RETRY));
        }
        free_cache_and_remove_finalizer(&*self.store, &self.cache, set)
            .await
            .context("freeing cache")?;

        let mut status = current_status(set);
        status.phase = ObjectSetPhase::Archived;
        status.active_phase = None;
        status.controller_of.clear();
        self.write_status(set, status).await
    }

    async fn finalize(&self, set: &mut ObjectSet) -> Result<ReconcileResult> {
        let mut status = current_status(set);
        status.phase = ObjectSetPhase::Terminating;
        self.write_status(set, status).await?;

        if !self.teardown(set).await? {
            return Ok(ReconcileResult::requeue(TEARDOWN_RETRY));
        }
        free_cache_and_remove_finalizer(&*self.store, &self.cache, set)
            .await
            .context("freeing cache")?;
        remove_finalizer(&*self.store, set, FINALIZER_TEARDOWN)
            .await
            .context("removing teardown finalizer")?;
        if set.finalizers().is_empty() {
            info!("ObjectSet {} torn down", set.name_any());
        } else {
            warn!(
                "ObjectSet {} still carries finalizers {:?}",
                set.name_any(),
                set.finalizers()
            );
        }
        Ok(ReconcileResult::done())
    }
}
