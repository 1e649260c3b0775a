//! Prometheus metrics for the package operator

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;

/// Labels for per-controller reconcile outcomes
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub controller: String,
    pub result: String,
}

/// Labels identifying an ObjectDeployment
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DeploymentLabels {
    pub namespace: String,
    pub name: String,
}

/// Reconcile passes by controller and outcome
pub static RECONCILE_RESULTS: Lazy<Family<ReconcileLabels, Counter>> = Lazy::new(Family::default);

/// ObjectSlice name collisions per deployment
pub static SLICE_COLLISIONS: Lazy<Family<DeploymentLabels, Counter>> = Lazy::new(Family::default);

/// ObjectSlices deleted by garbage collection per deployment
pub static SLICES_GARBAGE_COLLECTED: Lazy<Family<DeploymentLabels, Counter>> =
    Lazy::new(Family::default);

/// ObjectSlice deletions that failed during garbage collection
pub static SLICE_GC_FAILURES: Lazy<Family<DeploymentLabels, Counter>> = Lazy::new(Family::default);

/// Informers currently run by the dynamic cache
pub static ACTIVE_INFORMERS: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "package_operator_reconcile",
        "Reconcile passes by controller and result",
        RECONCILE_RESULTS.clone(),
    );
    registry.register(
        "package_operator_slice_collisions",
        "ObjectSlice name collisions",
        SLICE_COLLISIONS.clone(),
    );
    registry.register(
        "package_operator_slices_garbage_collected",
        "ObjectSlices deleted because no revision references them",
        SLICES_GARBAGE_COLLECTED.clone(),
    );
    registry.register(
        "package_operator_slice_gc_failures",
        "ObjectSlice deletions that failed during garbage collection",
        SLICE_GC_FAILURES.clone(),
    );
    registry.register(
        "package_operator_dynamic_cache_informers",
        "Informers run by the dynamic cache",
        ACTIVE_INFORMERS.clone(),
    );
    registry
});

fn deployment_labels(namespace: &str, name: &str) -> DeploymentLabels {
    DeploymentLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

pub fn inc_reconcile(controller: &str, result: &str) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
        result: result.to_string(),
    };
    RECONCILE_RESULTS.get_or_create(&labels).inc();
}

pub fn inc_slice_collision(namespace: &str, name: &str) {
    SLICE_COLLISIONS
        .get_or_create(&deployment_labels(namespace, name))
        .inc();
}

pub fn inc_slice_gc(namespace: &str, name: &str) {
    SLICES_GARBAGE_COLLECTED
        .get_or_create(&deployment_labels(namespace, name))
        .inc();
}

pub fn inc_slice_gc_failure(namespace: &str, name: &str) {
    SLICE_GC_FAILURES
        .get_or_create(&deployment_labels(namespace, name))
        .inc();
}

pub fn set_active_informers(count: usize) {
    ACTIVE_INFORMERS.set(count as i64);
}
