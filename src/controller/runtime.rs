//! Wires the ObjectDeployment and ObjectSet controllers into kube-runtime

use std::sync::Arc;
use std::time::Duration;

use futures::{stream, Stream, StreamExt};
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{Action, Controller},
        reflector::ObjectRef,
        watcher::Config,
    },
    Resource, ResourceExt,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, instrument, warn};

use super::deployment::{DeploymentController, DeploymentSettings};
use super::metrics;
use super::objectset::ObjectSetController;
use super::reconcile::{ReconcileResult, Reconciler};
use crate::cache::DynamicCache;
use crate::crd::{ObjectDeployment, ObjectSet};
use crate::error::{Error, Result};
use crate::store::{ObjectKind, ObjectStore};

const DEPLOYMENT_CONTROLLER: &str = "objectdeployment";
const OBJECT_SET_CONTROLLER: &str = "objectset";

/// Shared state for both controllers
pub struct ControllerState {
    pub client: Client,
    pub cache: DynamicCache,
    /// Restrict watches to one namespace; `None` watches the whole cluster
    pub namespace: Option<String>,
    /// Upper bound for one reconcile pass
    pub reconcile_timeout: Duration,
    deployments: DeploymentController,
    object_sets: ObjectSetController,
}

impl ControllerState {
    pub fn new(
        client: Client,
        store: Arc<dyn ObjectStore>,
        cache: DynamicCache,
        settings: DeploymentSettings,
        namespace: Option<String>,
        reconcile_timeout: Duration,
    ) -> Self {
        Self {
            deployments: DeploymentController::new(store.clone(), settings),
            object_sets: ObjectSetController::new(store, cache.clone()),
            client,
            cache,
            namespace,
            reconcile_timeout,
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = kube::core::NamespaceResourceScope>,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

/// Main entry point to start both controllers
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let deployments: Api<ObjectDeployment> = state.api();
    let object_sets: Api<ObjectSet> = state.api();

    info!("Starting package operator controllers");

    // Verify CRDs exist
    for (kind, check) in [
        ("ObjectDeployment", deployments.list(&Default::default()).await.map(|_| ())),
        ("ObjectSet", object_sets.list(&Default::default()).await.map(|_| ())),
    ] {
        match check {
            Ok(()) => info!("{} CRD is available", kind),
            Err(e) => {
                error!("{} CRD not found. Please install the CRDs first: {:?}", kind, e);
                return Err(Error::ConfigError(format!("{} CRD not installed", kind)));
            }
        }
    }

    let deployment_controller = Controller::new(deployments, Config::default())
        .owns::<ObjectSet>(object_sets.clone(), Config::default())
        .shutdown_on_signal()
        .run(reconcile_deployment, error_policy, state.clone())
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        });

    let object_set_controller = Controller::new(object_sets, Config::default())
        .reconcile_on(cache_triggers(&state.cache))
        .shutdown_on_signal()
        .run(reconcile_object_set, error_policy, state.clone())
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        });

    futures::join!(deployment_controller, object_set_controller);
    info!("Controllers stopped");
    Ok(())
}

/// ObjectSets to requeue because an object in the dynamic cache changed
fn cache_triggers(cache: &DynamicCache) -> impl Stream<Item = ObjectRef<ObjectSet>> + Send + 'static {
    let object_set_kind = ObjectKind::of::<ObjectSet>();
    stream::unfold(cache.subscribe(), |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(key) => return Some((key, rx)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Dynamic cache trigger stream lagged, {} events dropped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .filter_map(move |key| {
        let target = (key.kind == object_set_kind).then(|| {
            let reference = ObjectRef::new(&key.name);
            match &key.namespace {
                Some(ns) => reference.within(ns),
                None => reference,
            }
        });
        futures::future::ready(target)
    })
}

async fn run_with_timeout<K>(
    controller: &str,
    reconciler: &dyn Reconciler<K>,
    obj: &mut K,
    timeout: Duration,
) -> Result<Action>
where
    K: Send + Sync,
{
    let outcome = match tokio::time::timeout(timeout, reconciler.reconcile(obj)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(timeout)),
    };
    let label = match &outcome {
        Ok(_) => "success",
        Err(e) if e.is_conflict() => "conflict",
        Err(_) => "error",
    };
    metrics::inc_reconcile(controller, label);
    outcome.map(ReconcileResult::into_action)
}

#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile_deployment(obj: Arc<ObjectDeployment>, ctx: Arc<ControllerState>) -> Result<Action> {
    debug!("Reconciling ObjectDeployment");
    let mut deploy = (*obj).clone();
    run_with_timeout(
        DEPLOYMENT_CONTROLLER,
        &ctx.deployments,
        &mut deploy,
        ctx.reconcile_timeout,
    )
    .await
}

#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile_object_set(obj: Arc<ObjectSet>, ctx: Arc<ControllerState>) -> Result<Action> {
    debug!("Reconciling ObjectSet");
    let mut set = (*obj).clone();
    run_with_timeout(
        OBJECT_SET_CONTROLLER,
        &ctx.object_sets,
        &mut set,
        ctx.reconcile_timeout,
    )
    .await
}

fn error_policy<K: Resource>(obj: Arc<K>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    if error.is_conflict() {
        debug!("Conflict reconciling {}, retrying: {}", obj.name_any(), error);
    } else {
        error!("Reconciliation error for {}: {:?}", obj.name_any(), error);
    }

    // Use shorter retry for retriable errors
    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };

    Action::requeue(retry_duration)
}
