//! Finalizer helpers
//!
//! Finalizers are written with a merge patch that carries the observed
//! resourceVersion, so a concurrent change to the list is a conflict
//! instead of a lost update.

use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use crate::cache::DynamicCache;
use crate::error::{Result, ResultExt};
use crate::store::{self, ObjectKey, ObjectStore};

pub use crate::cache::FINALIZER_CACHED;

/// Held until all child objects of an ObjectSet are torn down
pub const FINALIZER_TEARDOWN: &str = "package-operator.run/teardown";

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

async fn patch_finalizers<K>(store: &dyn ObjectStore, obj: &K, finalizers: Vec<String>) -> Result<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let patch = json!({
        "metadata": {
            "resourceVersion": obj.resource_version(),
            "finalizers": finalizers,
        }
    });
    store::patch_typed(store, obj, &patch).await
}

/// Ensure the finalizer is set and persisted. `obj` is refreshed from the response.
pub async fn ensure_finalizer<K>(store: &dyn ObjectStore, obj: &mut K, finalizer: &str) -> Result<()>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    if has_finalizer(obj, finalizer) {
        return Ok(());
    }
    debug!("Adding finalizer {} to {}", finalizer, ObjectKey::for_resource(obj));

    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    *obj = patch_finalizers(store, obj, finalizers)
        .await
        .context("adding finalizer")?;
    Ok(())
}

/// Remove the finalizer and persist the change. `obj` is refreshed from the response.
pub async fn remove_finalizer<K>(store: &dyn ObjectStore, obj: &mut K, finalizer: &str) -> Result<()>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    if !has_finalizer(obj, finalizer) {
        return Ok(());
    }
    debug!(
        "Removing finalizer {} from {}",
        finalizer,
        ObjectKey::for_resource(obj)
    );

    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect();
    match patch_finalizers(store, obj, finalizers).await {
        Ok(updated) => *obj = updated,
        // The last finalizer is gone and the object with it
        Err(e) if e.is_not_found() => {
            obj.meta_mut().finalizers = None;
        }
        Err(e) => return Err(e.context("removing finalizer")),
    }
    Ok(())
}

pub async fn ensure_cached_finalizer<K>(store: &dyn ObjectStore, obj: &mut K) -> Result<()>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    ensure_finalizer(store, obj, FINALIZER_CACHED).await
}

/// Free all cache registrations of `obj`, then drop the cached finalizer
pub async fn free_cache_and_remove_finalizer<K>(
    store: &dyn ObjectStore,
    cache: &DynamicCache,
    obj: &mut K,
) -> Result<()>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    cache.free(&ObjectKey::for_resource(obj));
    remove_finalizer(store, obj, FINALIZER_CACHED).await
}
