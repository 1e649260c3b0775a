//! ObjectDeployment reconciliation
//!
//! A deployment is reconciled by a chain of sub-reconcilers:
//!
//! 1. [`RevisionReconciler`] creates or completes the ObjectSet for the
//!    current template, slicing oversized phases into ObjectSlices.
//! 2. [`HistoryReconciler`] archives superseded revisions once the newest
//!    is available, and prunes archived revisions beyond the history limit.
//! 3. [`SliceGcReconciler`] deletes ObjectSlices no revision references.
//! 4. [`StatusReconciler`] reports the newest revision's state.
//!
//! New revisions are created in three crash-safe steps: an empty
//! placeholder reserves the revision number, slices are ensured, and a final
//! update seals the placeholder with phases and template hash.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::chunker::Chunker;
use super::conditions::{
    delete_mapped_conditions, find_condition, map_conditions, remove_condition, set_condition,
};
use super::metrics;
use super::reconcile::{run_chain, ReconcileResult, Reconciler};
use super::retry::retry_on_conflict;
use super::slices::{compute_hash, SliceStore};
use crate::crd::{
    Condition, LifecycleState, ObjectDeployment, ObjectDeploymentStatus, ObjectSet,
    ObjectSetObject, ObjectSetSpec, ObjectSetTemplatePhase, CONDITION_AVAILABLE,
    CONDITION_SLICE_COLLISION, LABEL_DEPLOYMENT,
};
use crate::error::{Error, Result, ResultExt};
use crate::store::{self, ObjectKey, ObjectStore};

/// Tunables of the deployment controller
#[derive(Clone, Debug)]
pub struct DeploymentSettings {
    pub chunker: Chunker,
    /// Attempts for every read-modify-write of an ObjectSet
    pub conflict_retries: u32,
    /// Highest collisionCount before slice collisions are surfaced
    pub max_collision_count: i32,
    /// Archived revisions kept when the deployment does not say
    pub default_history_limit: i32,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            chunker: Chunker::default(),
            conflict_retries: 5,
            max_collision_count: 5,
            default_history_limit: 10,
        }
    }
}

/// Hash identifying the template a revision was built from
pub fn template_hash(deploy: &ObjectDeployment) -> Result<String> {
    compute_hash(&deploy.spec.template, 0)
}

/// ObjectSets matching the deployment's selector, newest first
pub async fn list_revisions(
    store: &dyn ObjectStore,
    deploy: &ObjectDeployment,
) -> Result<Vec<ObjectSet>> {
    let mut revisions: Vec<ObjectSet> =
        store::list_typed(store, deploy.namespace().as_deref(), &deploy.spec.selector)
            .await
            .context("listing ObjectSets")?;
    revisions.sort_by(|a, b| b.spec.revision.cmp(&a.spec.revision));
    Ok(revisions)
}

pub struct DeploymentController {
    revisions: RevisionReconciler,
    history: HistoryReconciler,
    slice_gc: SliceGcReconciler,
    status: StatusReconciler,
}

impl DeploymentController {
    pub fn new(store: Arc<dyn ObjectStore>, settings: DeploymentSettings) -> Self {
        Self {
            revisions: RevisionReconciler {
                store: store.clone(),
                settings: settings.clone(),
            },
            history: HistoryReconciler {
                store: store.clone(),
                settings,
            },
            slice_gc: SliceGcReconciler {
                store: store.clone(),
            },
            status: StatusReconciler { store },
        }
    }
}

#[async_trait]
impl Reconciler<ObjectDeployment> for DeploymentController {
    async fn reconcile(&self, deploy: &mut ObjectDeployment) -> Result<ReconcileResult> {
        if deploy.meta().deletion_timestamp.is_some() {
            debug!("ObjectDeployment {} is being deleted", deploy.name_any());
            return Ok(ReconcileResult::done());
        }
        deploy.spec.validate().map_err(Error::ValidationError)?;

        run_chain::<ObjectDeployment>(
            &[&self.revisions, &self.history, &self.slice_gc, &self.status],
            deploy,
        )
        .await
    }
}

/// Makes the newest revision match the deployment's template
pub struct RevisionReconciler {
    store: Arc<dyn ObjectStore>,
    settings: DeploymentSettings,
}

#[async_trait]
impl Reconciler<ObjectDeployment> for RevisionReconciler {
    async fn reconcile(&self, deploy: &mut ObjectDeployment) -> Result<ReconcileResult> {
        let slices = SliceStore::new(&*self.store);
        let namespace = deploy.namespace();
        let desired = slices
            .expand_phases(namespace.as_deref(), &deploy.spec.template.spec.phases)
            .await?;
        let revisions = list_revisions(&*self.store, deploy).await?;

        let placeholder = match revisions.first() {
            Some(newest) if !newest.is_sealed() => {
                info!("Completing unsealed revision {}", newest.name_any());
                newest.name_any()
            }
            Some(newest) => {
                let current = slices
                    .expand_phases(namespace.as_deref(), &newest.spec.phases)
                    .await?;
                if current == desired
                    && newest.spec.availability_probes
                        == deploy.spec.template.spec.availability_probes
                {
                    return Ok(ReconcileResult::done());
                }
                self.create_placeholder(deploy, newest.spec.revision + 1)
                    .await?
            }
            None => self.create_placeholder(deploy, 1).await?,
        };

        let mut phases = Vec::with_capacity(desired.len());
        for phase in &desired {
            phases.push(self.slice_phase(deploy, phase).await?);
        }
        self.seal(deploy, &placeholder, phases).await?;
        Ok(ReconcileResult::done())
    }
}

impl RevisionReconciler {
    /// Create an empty, unsealed ObjectSet reserving `revision`
    async fn create_placeholder(&self, deploy: &ObjectDeployment, revision: i64) -> Result<String> {
        let name = format!("{}-{}", deploy.name_any(), revision);
        let template = &deploy.spec.template;
        let mut labels = template.metadata.labels.clone();
        labels.insert(LABEL_DEPLOYMENT.to_string(), deploy.name_any());

        let set = ObjectSet {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: deploy.namespace(),
                labels: Some(labels),
                annotations: (!template.metadata.annotations.is_empty())
                    .then(|| template.metadata.annotations.clone()),
                owner_references: deploy.controller_owner_ref(&()).map(|r| vec![r]),
                ..Default::default()
            },
            spec: ObjectSetSpec {
                revision,
                ..Default::default()
            },
            status: None,
        };

        match store::create_typed(&*self.store, &set).await {
            Ok(_) => {
                info!("Created ObjectSet {} for revision {}", name, revision);
                Ok(name)
            }
            Err(e) if e.is_already_exists() => {
                // Left behind by an earlier pass that did not get to seal it
                let existing: ObjectSet =
                    store::get_typed(&*self.store, deploy.namespace().as_deref(), &name).await?;
                if existing.is_sealed() {
                    Err(e.context("creating ObjectSet placeholder"))
                } else {
                    Ok(name)
                }
            }
            Err(e) => Err(e.context("creating ObjectSet placeholder")),
        }
    }

    /// Move the objects of a phase into slices as the chunker decides
    async fn slice_phase(
        &self,
        deploy: &mut ObjectDeployment,
        phase: &ObjectSetTemplatePhase,
    ) -> Result<ObjectSetTemplatePhase> {
        let chunks = self.settings.chunker.chunk(phase)?;
        if chunks.is_empty() {
            return Ok(phase.clone());
        }

        let mut slice_names = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            slice_names.push(self.ensure_slice(deploy, chunk).await?);
        }
        Ok(ObjectSetTemplatePhase {
            name: phase.name.clone(),
            objects: vec![],
            slices: slice_names,
        })
    }

    /// Ensure a slice, salting its name with a raised collisionCount on every
    /// collision until `max_collision_count` is reached
    async fn ensure_slice(
        &self,
        deploy: &mut ObjectDeployment,
        objects: &[ObjectSetObject],
    ) -> Result<String> {
        let slices = SliceStore::new(&*self.store);
        let namespace = deploy.namespace().unwrap_or_default();
        let name = deploy.name_any();
        loop {
            let err = match slices.ensure(deploy, objects, deploy.collision_count()).await {
                Ok(slice_name) => return Ok(slice_name),
                Err(e) if e.is_slice_collision() => e,
                Err(e) => return Err(e),
            };

            error!("ObjectDeployment {}/{}: {}", namespace, name, err);
            metrics::inc_slice_collision(&namespace, &name);

            let next = deploy.collision_count() + 1;
            if next > self.settings.max_collision_count {
                let mut conditions = deploy
                    .status
                    .as_ref()
                    .map(|s| s.conditions.clone())
                    .unwrap_or_default();
                set_condition(
                    &mut conditions,
                    Condition::new(
                        CONDITION_SLICE_COLLISION,
                        true,
                        "SliceCollision",
                        &err.status_message(),
                    )
                    .with_generation(deploy.metadata.generation),
                );
                *deploy = store::patch_status(&*self.store, deploy, &json!({ "conditions": conditions }))
                    .await
                    .context("reporting slice collision")?;
                return Err(err);
            }

            *deploy = store::patch_status(&*self.store, deploy, &json!({ "collisionCount": next }))
                .await
                .context("raising collisionCount")?;
        }
    }

    async fn seal(
        &self,
        deploy: &ObjectDeployment,
        name: &str,
        phases: Vec<ObjectSetTemplatePhase>,
    ) -> Result<()> {
        let hash = template_hash(deploy)?;
        let namespace = deploy.namespace();
        let (store, namespace, phases, probes, hash) = (
            &*self.store,
            namespace.as_deref(),
            &phases,
            &deploy.spec.template.spec.availability_probes,
            &hash,
        );

        retry_on_conflict(self.settings.conflict_retries, || async move {
            let mut set: ObjectSet = store::get_typed(store, namespace, name).await?;
            if set.is_sealed() {
                return Ok(());
            }
            set.spec.phases = phases.clone();
            set.spec.availability_probes = probes.clone();
            set.spec.template_hash = Some(hash.clone());
            store::update_typed(store, &set).await.map(|_| ())
        })
        .await
        .context("sealing ObjectSet")?;

        info!("Sealed ObjectSet {} with template hash {}", name, hash);
        Ok(())
    }
}

/// Archives superseded revisions and prunes old archived ones
pub struct HistoryReconciler {
    store: Arc<dyn ObjectStore>,
    settings: DeploymentSettings,
}

#[async_trait]
impl Reconciler<ObjectDeployment> for HistoryReconciler {
    async fn reconcile(&self, deploy: &mut ObjectDeployment) -> Result<ReconcileResult> {
        let revisions = list_revisions(&*self.store, deploy).await?;
        let Some((newest, older)) = revisions.split_first() else {
            return Ok(ReconcileResult::done());
        };

        // Older revisions stay active until the newest has taken over
        let mut archived = vec![];
        for set in older {
            if set.is_archived() {
                archived.push(set);
            } else if newest.is_available() {
                self.archive(set).await?;
                archived.push(set);
            }
        }

        let limit = deploy
            .spec
            .revision_history_limit
            .unwrap_or(self.settings.default_history_limit)
            .max(0) as usize;
        for set in archived.into_iter().skip(limit) {
            if set.meta().deletion_timestamp.is_some() {
                continue;
            }
            info!("Pruning archived ObjectSet {}", set.name_any());
            match self.store.delete(&ObjectKey::for_resource(set)).await {
                Err(e) if !e.is_not_found() => {
                    return Err(e.context("pruning archived ObjectSet"));
                }
                _ => {}
            }
        }

        Ok(ReconcileResult::done())
    }
}

impl HistoryReconciler {
    async fn archive(&self, set: &ObjectSet) -> Result<()> {
        let store = &*self.store;
        let namespace = set.namespace();
        let (namespace, name) = (namespace.as_deref(), set.name_any());
        let name = name.as_str();

        retry_on_conflict(self.settings.conflict_retries, || async move {
            let mut current: ObjectSet = store::get_typed(store, namespace, name).await?;
            if current.is_archived() {
                return Ok(());
            }
            current.spec.lifecycle_state = LifecycleState::Archived;
            store::update_typed(store, &current).await.map(|_| ())
        })
        .await
        .context("archiving ObjectSet")?;

        info!("Archived ObjectSet {}", name);
        Ok(())
    }
}

/// Deletes ObjectSlices that neither the template nor any revision references
pub struct SliceGcReconciler {
    store: Arc<dyn ObjectStore>,
}

#[async_trait]
impl Reconciler<ObjectDeployment> for SliceGcReconciler {
    async fn reconcile(&self, deploy: &mut ObjectDeployment) -> Result<ReconcileResult> {
        let slices = SliceStore::new(&*self.store);
        let namespace = deploy.namespace();
        let name = deploy.name_any();

        let mut referenced: BTreeSet<String> = deploy
            .spec
            .template
            .spec
            .slice_names()
            .map(String::from)
            .collect();
        for set in list_revisions(&*self.store, deploy).await? {
            referenced.extend(set.spec.phases.into_iter().flat_map(|p| p.slices));
        }

        for slice in slices.list_for(deploy).await? {
            let slice_name = slice.name_any();
            if referenced.contains(&slice_name) {
                continue;
            }
            match slices.delete(namespace.as_deref(), &slice_name).await {
                Ok(()) => {
                    info!("Garbage collected ObjectSlice {}", slice_name);
                    metrics::inc_slice_gc(namespace.as_deref().unwrap_or_default(), &name);
                }
                Err(e) => {
                    warn!("Failed to delete ObjectSlice {}: {}", slice_name, e);
                    metrics::inc_slice_gc_failure(namespace.as_deref().unwrap_or_default(), &name);
                }
            }
        }

        Ok(ReconcileResult::done())
    }
}

/// Mirrors the newest revision into the deployment status
pub struct StatusReconciler {
    store: Arc<dyn ObjectStore>,
}

#[async_trait]
impl Reconciler<ObjectDeployment> for StatusReconciler {
    async fn reconcile(&self, deploy: &mut ObjectDeployment) -> Result<ReconcileResult> {
        let revisions = list_revisions(&*self.store, deploy).await?;
        let previous = deploy.status.clone().unwrap_or_default();
        let mut status = previous.clone();
        let generation = deploy.metadata.generation;

        match revisions.first() {
            Some(newest) => {
                self.mirror_revision(deploy, newest, &mut status)?;
            }
            None => {
                set_condition(
                    &mut status.conditions,
                    Condition::available(false, "NoRevision", "no ObjectSet exists yet")
                        .with_generation(generation),
                );
                set_condition(
                    &mut status.conditions,
                    Condition::progressing(true, "NewRevision", "waiting for the first revision")
                        .with_generation(generation),
                );
            }
        }
        status.observed_generation = generation;

        if status == previous {
            return Ok(ReconcileResult::done());
        }
        *deploy = store::patch_status(&*self.store, deploy, &status)
            .await
            .context("updating ObjectDeployment status")?;
        Ok(ReconcileResult {
            requeue_after: None,
            status_changed: true,
        })
    }
}

impl StatusReconciler {
    fn mirror_revision(
        &self,
        deploy: &ObjectDeployment,
        newest: &ObjectSet,
        status: &mut ObjectDeploymentStatus,
    ) -> Result<()> {
        let generation = deploy.metadata.generation;
        let available = newest.is_available();

        let mirrored = match find_condition(newest.conditions(), CONDITION_AVAILABLE) {
            Some(c) => Condition::new(CONDITION_AVAILABLE, c.is_true(), &c.reason, &c.message),
            None => Condition::available(
                false,
                "Pending",
                &format!("revision {} has not reported availability", newest.spec.revision),
            ),
        };
        set_condition(&mut status.conditions, mirrored.with_generation(generation));

        let progressing = if available {
            Condition::progressing(false, "Idle", "latest revision is available")
        } else {
            Condition::progressing(
                true,
                "NewRevision",
                &format!("revision {} is rolling out", newest.spec.revision),
            )
        };
        set_condition(&mut status.conditions, progressing.with_generation(generation));

        delete_mapped_conditions(&mut status.conditions);
        map_conditions(
            newest.metadata.generation,
            newest.conditions(),
            generation,
            &mut status.conditions,
        );

        if newest.spec.template_hash.as_deref() == Some(template_hash(deploy)?.as_str()) {
            remove_condition(&mut status.conditions, CONDITION_SLICE_COLLISION);
            debug!("ObjectDeployment {} is up to date", deploy.name_any());
        }

        status.revision = Some(newest.spec.revision);
        status.template_hash = newest.spec.template_hash.clone();
        Ok(())
    }
}

