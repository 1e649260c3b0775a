//! Dynamic cache
//!
//! Label-gated, reference-counted watches over object kinds that are only
//! known at runtime. Owners register interest in a kind through
//! [`DynamicCache::watch`]; the first registration starts an informer for the
//! kind and the last [`DynamicCache::free`] stops it. Every change seen by an
//! informer is published as the key of each owner whose namespace scope
//! covers the changed object.

mod informer;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::controller::metrics;
use crate::error::{Error, Result};
use crate::store::{selector, ObjectKey, ObjectKind, ObjectStore};
use informer::Informer;

/// Objects must carry this label with value "True" to be cached
pub const LABEL_CACHE: &str = "package-operator.run/cache";

/// Owners must carry this finalizer before registering watches
pub const FINALIZER_CACHED: &str = "package-operator.run/cached";

const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_BUFFER: usize = 1024;

struct Registration {
    /// Owner → namespaces it watches in. `None` covers all namespaces.
    owners: BTreeMap<ObjectKey, BTreeSet<Option<String>>>,
    informer: Informer,
}

struct Inner {
    store: Arc<dyn ObjectStore>,
    registrations: Mutex<HashMap<ObjectKind, Registration>>,
    events: broadcast::Sender<ObjectKey>,
    sync_timeout: Duration,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<ObjectKind, Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the owners interested in a change to `obj`
    fn notify(&self, kind: &ObjectKind, obj: &DynamicObject) {
        let namespace = obj.namespace();
        let registrations = self.lock();
        let Some(registration) = registrations.get(kind) else {
            return;
        };
        for (owner, scopes) in &registration.owners {
            if scopes.contains(&None) || scopes.contains(&namespace) {
                // No subscribers is fine
                let _ = self.events.send(owner.clone());
            }
        }
    }
}

/// Registration snapshot of one watched kind
#[derive(Clone, Debug, Serialize)]
pub struct CacheEntry {
    pub kind: ObjectKind,
    pub synced: bool,
    pub objects: usize,
    pub owners: Vec<OwnerScope>,
}

#[derive(Clone, Debug, Serialize)]
pub struct OwnerScope {
    pub owner: ObjectKey,
    /// `null` stands for all namespaces
    pub namespaces: Vec<Option<String>>,
}

#[derive(Clone)]
pub struct DynamicCache {
    inner: Arc<Inner>,
}

impl DynamicCache {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_sync_timeout(store, DEFAULT_SYNC_TIMEOUT)
    }

    pub fn with_sync_timeout(store: Arc<dyn ObjectStore>, sync_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                store,
                registrations: Mutex::new(HashMap::new()),
                events,
                sync_timeout,
            }),
        }
    }

    /// Owner keys to reconcile, one per relevant change
    pub fn subscribe(&self) -> broadcast::Receiver<ObjectKey> {
        self.inner.events.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn publish(&self, owner: ObjectKey) {
        let _ = self.inner.events.send(owner);
    }

    /// Register `owner`'s interest in the kind of `obj`, within `obj`'s namespace.
    /// Starts and syncs an informer for the kind if none is running.
    pub async fn watch<K>(&self, owner: &K, obj: &DynamicObject) -> Result<()>
    where
        K: Resource<DynamicType = ()>,
    {
        let owner_key = ObjectKey::for_resource(owner);
        if !owner.finalizers().iter().any(|f| f == FINALIZER_CACHED) {
            return Err(Error::CacheAdmission(format!(
                "{} must carry the {} finalizer before watching",
                owner_key, FINALIZER_CACHED
            )));
        }
        if obj.labels().get(LABEL_CACHE).map(String::as_str) != Some("True") {
            return Err(Error::CacheAdmission(format!(
                "{} is missing the {}=True label",
                obj.name_any(),
                LABEL_CACHE
            )));
        }
        let kind = ObjectKind::of_object(obj)?;

        let mut synced = {
            let mut registrations = self.inner.lock();
            let registration = match registrations.entry(kind.clone()) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    info!("Starting dynamic cache informer for {}", kind);
                    let informer = self.start_informer(&kind);
                    entry.insert(Registration {
                        owners: BTreeMap::new(),
                        informer,
                    })
                }
            };
            registration
                .owners
                .entry(owner_key)
                .or_default()
                .insert(obj.namespace());
            let synced = registration.informer.synced();
            metrics::set_active_informers(registrations.len());
            synced
        };

        let outcome = tokio::time::timeout(self.inner.sync_timeout, synced.wait_for(|s| *s)).await;
        match outcome {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::WatchError(format!("informer for {} stopped", kind))),
            Err(_) => Err(Error::WatchError(format!(
                "timed out waiting for {} informer to sync",
                kind
            ))),
        }
    }

    fn start_informer(&self, kind: &ObjectKind) -> Informer {
        let stream = self
            .inner
            .store
            .watch(kind, &selector::from_labels([(LABEL_CACHE, "True")]));
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let notify_kind = kind.clone();
        Informer::spawn(kind.clone(), stream, move |obj| {
            if let Some(inner) = weak.upgrade() {
                inner.notify(&notify_kind, obj);
            }
        })
    }

    /// Drop every registration of `owner`. Informers left without owners stop.
    pub fn free(&self, owner: &ObjectKey) {
        let mut registrations = self.inner.lock();
        registrations.retain(|kind, registration| {
            registration.owners.remove(owner);
            if registration.owners.is_empty() {
                info!("Stopping dynamic cache informer for {}", kind);
                false
            } else {
                true
            }
        });
        metrics::set_active_informers(registrations.len());
        debug!("Freed cache registrations of {}", owner);
    }

    /// Read a cached object. The kind must be watched.
    pub fn get(&self, key: &ObjectKey) -> Result<DynamicObject> {
        let registrations = self.inner.lock();
        let registration = registrations
            .get(&key.kind)
            .ok_or_else(|| unwatched(&key.kind))?;
        registration.informer.get(key).ok_or_else(|| key.not_found())
    }

    /// List cached objects of a watched kind
    pub fn list(
        &self,
        kind: &ObjectKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<DynamicObject>> {
        let registrations = self.inner.lock();
        let registration = registrations.get(kind).ok_or_else(|| unwatched(kind))?;
        Ok(registration.informer.list(namespace, selector))
    }

    #[cfg(test)]
    pub(crate) fn is_watched(&self, kind: &ObjectKind) -> bool {
        self.inner.lock().contains_key(kind)
    }

    /// Current registrations, ordered by kind
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let registrations = self.inner.lock();
        let mut entries: Vec<CacheEntry> = registrations
            .iter()
            .map(|(kind, registration)| CacheEntry {
                kind: kind.clone(),
                synced: registration.informer.is_synced(),
                objects: registration.informer.len(),
                owners: registration
                    .owners
                    .iter()
                    .map(|(owner, scopes)| OwnerScope {
                        owner: owner.clone(),
                        namespaces: scopes.iter().cloned().collect(),
                    })
                    .collect(),
            })
            .collect();
        entries.sort_by(|a, b| a.kind.cmp(&b.kind));
        entries
    }
}

fn unwatched(kind: &ObjectKind) -> Error {
    Error::CacheAdmission(format!("kind {} is not watched by the dynamic cache", kind))
}

/// Add the cache label. Returns whether the object changed.
pub fn ensure_dynamic_cache_label(obj: &mut DynamicObject) -> bool {
    let labels = obj.labels_mut();
    if labels.get(LABEL_CACHE).map(String::as_str) == Some("True") {
        return false;
    }
    labels.insert(LABEL_CACHE.to_string(), "True".to_string());
    true
}

/// Remove the cache label. Returns whether the object changed.
#[cfg(test)]
pub(crate) fn remove_dynamic_cache_label(obj: &mut DynamicObject) -> bool {
    obj.labels_mut().remove(LABEL_CACHE).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ObjectSet, ObjectSetSpec};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn owner(name: &str, finalizers: &[&str]) -> ObjectSet {
        let mut set = ObjectSet::new(name, ObjectSetSpec::default());
        set.metadata.namespace = Some("apps".to_string());
        set.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        set
    }

    fn config_map(name: &str, cached: bool) -> DynamicObject {
        let mut obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "apps"},
            "data": {"k": "v"}
        }))
        .unwrap();
        if cached {
            ensure_dynamic_cache_label(&mut obj);
        }
        obj
    }

    fn cm_kind() -> ObjectKind {
        ObjectKind::new("", "v1", "ConfigMap")
    }

    async fn next_owner(rx: &mut broadcast::Receiver<ObjectKey>) -> Option<ObjectKey> {
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .ok()
            .and_then(|r| r.ok())
    }

    async fn wait_for_watches(store: &MemoryStore, expected: usize) {
        for _ in 0..100 {
            if store.active_watches() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.active_watches(), expected);
    }

    #[tokio::test]
    async fn test_watch_requires_finalizer_and_label() {
        let store = Arc::new(MemoryStore::new());
        let cache = DynamicCache::new(store.clone());

        let err = cache
            .watch(&owner("a", &[]), &config_map("cm", true))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CacheAdmission(_)));

        let err = cache
            .watch(&owner("a", &[FINALIZER_CACHED]), &config_map("cm", false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CacheAdmission(_)));
        assert_eq!(store.active_watches(), 0);
    }

    #[tokio::test]
    async fn test_reads_only_labelled_objects_of_watched_kinds() {
        let store = Arc::new(MemoryStore::new());
        store.create(&config_map("cached", true)).await.unwrap();
        store.create(&config_map("plain", false)).await.unwrap();
        let cache = DynamicCache::new(store.clone());

        let key = ObjectKey::new(cm_kind(), Some("apps"), "cached");
        assert!(matches!(cache.get(&key), Err(Error::CacheAdmission(_))));

        cache
            .watch(&owner("a", &[FINALIZER_CACHED]), &config_map("cached", true))
            .await
            .unwrap();
        assert_eq!(cache.get(&key).unwrap().name_any(), "cached");

        let plain = ObjectKey::new(cm_kind(), Some("apps"), "plain");
        assert!(cache.get(&plain).unwrap_err().is_not_found());
        assert_eq!(
            cache
                .list(&cm_kind(), Some("apps"), &LabelSelector::default())
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_reference_counting() {
        let store = Arc::new(MemoryStore::new());
        let cache = DynamicCache::new(store.clone());
        let mut rx = cache.subscribe();

        let owner1 = owner("owner1", &[FINALIZER_CACHED]);
        let owner2 = owner("owner2", &[FINALIZER_CACHED]);
        cache.watch(&owner1, &config_map("x", true)).await.unwrap();
        cache.watch(&owner2, &config_map("x", true)).await.unwrap();
        assert_eq!(store.active_watches(), 1);

        cache.free(&ObjectKey::for_resource(&owner1));
        assert!(cache.is_watched(&cm_kind()));

        store.create(&config_map("x", true)).await.unwrap();
        assert_eq!(
            next_owner(&mut rx).await,
            Some(ObjectKey::for_resource(&owner2))
        );

        cache.free(&ObjectKey::for_resource(&owner2));
        assert!(!cache.is_watched(&cm_kind()));
        wait_for_watches(&store, 0).await;
    }

    #[tokio::test]
    async fn test_events_respect_namespace_scope() {
        let store = Arc::new(MemoryStore::new());
        let cache = DynamicCache::new(store.clone());
        let mut rx = cache.subscribe();

        cache
            .watch(&owner("a", &[FINALIZER_CACHED]), &config_map("x", true))
            .await
            .unwrap();

        let mut elsewhere = config_map("y", true);
        elsewhere.metadata.namespace = Some("other".to_string());
        store.create(&elsewhere).await.unwrap();
        assert_eq!(next_owner(&mut rx).await, None);
    }

    #[test]
    fn test_cache_label_helpers() {
        let mut obj = config_map("x", false);
        assert!(ensure_dynamic_cache_label(&mut obj));
        assert!(!ensure_dynamic_cache_label(&mut obj));
        assert!(remove_dynamic_cache_label(&mut obj));
        assert!(!remove_dynamic_cache_label(&mut obj));
    }
}
