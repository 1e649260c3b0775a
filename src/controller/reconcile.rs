//! Contract shared by the top-level controllers and their sub-reconcilers

use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::controller::Action;

use crate::error::Result;

/// Outcome of one reconcile pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Run again after this delay even without a watch event
    pub requeue_after: Option<Duration>,
    /// The pass wrote the status subresource
    pub status_changed: bool,
}

impl ReconcileResult {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
            status_changed: false,
        }
    }

    /// Combine two results. The shorter requeue wins.
    pub fn merge(self, other: Self) -> Self {
        let requeue_after = match (self.requeue_after, other.requeue_after) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            requeue_after,
            status_changed: self.status_changed || other.status_changed,
        }
    }

    pub fn into_action(self) -> Action {
        match self.requeue_after {
            Some(after) => Action::requeue(after),
            None => Action::await_change(),
        }
    }
}

#[async_trait]
pub trait Reconciler<K: Send + Sync>: Send + Sync {
    async fn reconcile(&self, obj: &mut K) -> Result<ReconcileResult>;
}

/// Run sub-reconcilers in order, stopping at the first error
pub async fn run_chain<K: Send + Sync>(
    chain: &[&dyn Reconciler<K>],
    obj: &mut K,
) -> Result<ReconcileResult> {
    let mut result = ReconcileResult::done();
    for reconciler in chain {
        result = result.merge(reconciler.reconcile(obj).await?);
    }
    Ok(result)
}
