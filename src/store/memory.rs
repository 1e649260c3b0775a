//! In-process [`ObjectStore`] with API server semantics
//!
//! Tracks resource versions and generations, honours finalizers on
//! deletion, records every call and can be told to fail specific calls.
//! Owner references are stored but never garbage collected.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::api::DynamicObject;
use kube::core::ErrorResponse;
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use serde_json::{json, Value};
use tokio::sync::broadcast::{self, error::RecvError};

use super::{merge_patch, selector, ObjectKey, ObjectKind, ObjectStore, WatchStream};
use crate::error::{Error, Result};

const EVENT_BUFFER: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Patch,
    PatchStatus,
    Delete,
}

impl Verb {
    pub fn is_write(self) -> bool {
        !matches!(self, Verb::Get | Verb::List)
    }
}

/// One recorded store call. `body` holds the submitted object or patch.
#[derive(Clone, Debug)]
pub struct StoreCall {
    pub verb: Verb,
    pub key: ObjectKey,
    pub body: Option<Value>,
}

/// Failure to inject into the next matching call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    Conflict,
    NotFound,
    AlreadyExists,
    Unavailable,
}

struct PendingFault {
    verb: Verb,
    kind: String,
    fault: Fault,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    resource_version: u64,
    uid: u64,
    calls: Vec<StoreCall>,
    faults: Vec<PendingFault>,
}

impl State {
    fn record(&mut self, verb: Verb, key: &ObjectKey, body: Option<Value>) {
        self.calls.push(StoreCall {
            verb,
            key: key.clone(),
            body,
        });
    }

    fn take_fault(&mut self, verb: Verb, key: &ObjectKey) -> Result<()> {
        let Some(pos) = self
            .faults
            .iter()
            .position(|f| f.verb == verb && f.kind == key.kind.kind)
        else {
            return Ok(());
        };
        Err(match self.faults.remove(pos).fault {
            Fault::Conflict => key.conflict(),
            Fault::NotFound => key.not_found(),
            Fault::AlreadyExists => key.already_exists(),
            Fault::Unavailable => Error::KubeError(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: format!("injected failure for {}", key),
                reason: "ServiceUnavailable".to_string(),
                code: 503,
            })),
        })
    }

    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn current(&self, key: &ObjectKey) -> Result<DynamicObject> {
        self.objects.get(key).cloned().ok_or_else(|| key.not_found())
    }

    /// Store `next` as the successor of `current`, keeping server-owned metadata
    fn commit(
        &mut self,
        key: &ObjectKey,
        current: &DynamicObject,
        mut next: DynamicObject,
    ) -> (DynamicObject, Event<DynamicObject>) {
        next.metadata.uid = current.metadata.uid.clone();
        next.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        next.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
        next.metadata.namespace = key.namespace.clone();
        next.metadata.name = Some(key.name.clone());
        next.types = current.types.clone();

        let generation = current.metadata.generation.unwrap_or(1);
        next.metadata.generation = Some(if without_status(&current.data) != without_status(&next.data) {
            generation + 1
        } else {
            generation
        });
        next.metadata.resource_version = Some(self.next_resource_version());

        if next.metadata.deletion_timestamp.is_some() && next.finalizers().is_empty() {
            self.objects.remove(key);
            (next.clone(), Event::Delete(next))
        } else {
            self.objects.insert(key.clone(), next.clone());
            (next.clone(), Event::Apply(next))
        }
    }
}

fn without_status(data: &Value) -> Value {
    let mut data = data.clone();
    if let Value::Object(map) = &mut data {
        map.remove("status");
    }
    data
}

/// Decrements the active watch count when a watch stream is dropped
struct WatchGuard(Arc<AtomicUsize>);

impl WatchGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Object store held entirely in memory
pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<(ObjectKind, Event<DynamicObject>)>,
    active_watches: Arc<AtomicUsize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: Mutex::new(State::default()),
            events,
            active_watches: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, kind: &ObjectKind, event: Event<DynamicObject>) {
        // No subscribers is fine
        let _ = self.events.send((kind.clone(), event));
    }

    /// Fail the next `verb` call against objects of `kind` with `fault`
    pub fn fail_next(&self, verb: Verb, kind: &str, fault: Fault) {
        self.lock().faults.push(PendingFault {
            verb,
            kind: kind.to_string(),
            fault,
        });
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Number of recorded `verb` calls against objects of `kind`
    pub fn count(&self, verb: Verb, kind: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.verb == verb && c.key.kind.kind == kind)
            .count()
    }

    /// Number of recorded mutating calls of any kind
    pub fn writes(&self) -> usize {
        self.lock().calls.iter().filter(|c| c.verb.is_write()).count()
    }

    /// All stored objects of `kind`, without recording a call
    pub fn snapshot(&self, kind: &str) -> Vec<DynamicObject> {
        self.lock()
            .objects
            .iter()
            .filter(|(k, _)| k.kind.kind == kind)
            .map(|(_, o)| o.clone())
            .collect()
    }

    /// Number of watch streams that are still alive
    pub fn active_watches(&self) -> usize {
        self.active_watches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject> {
        let mut state = self.lock();
        state.record(Verb::Get, key, None);
        state.take_fault(Verb::Get, key)?;
        state.current(key)
    }

    async fn list(
        &self,
        kind: &ObjectKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<DynamicObject>> {
        let key = ObjectKey::new(kind.clone(), namespace, "");
        let mut state = self.lock();
        state.record(Verb::List, &key, None);
        state.take_fault(Verb::List, &key)?;
        Ok(state
            .objects
            .iter()
            .filter(|(k, _)| &k.kind == kind)
            .filter(|(k, _)| namespace.is_none() || k.namespace.as_deref() == namespace)
            .filter(|(_, o)| selector::matches(selector, o.labels()))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj)?;
        let mut state = self.lock();
        state.record(Verb::Create, &key, Some(serde_json::to_value(obj)?));
        state.take_fault(Verb::Create, &key)?;
        if state.objects.contains_key(&key) {
            return Err(key.already_exists());
        }

        let mut stored = obj.clone();
        state.uid += 1;
        stored.metadata.uid = Some(format!("uid-{}", state.uid));
        stored.metadata.resource_version = Some(state.next_resource_version());
        stored.metadata.generation = Some(1);
        stored.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        stored.metadata.deletion_timestamp = None;
        state.objects.insert(key.clone(), stored.clone());
        self.emit(&key.kind, Event::Apply(stored.clone()));
        Ok(stored)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj)?;
        let mut state = self.lock();
        state.record(Verb::Update, &key, Some(serde_json::to_value(obj)?));
        state.take_fault(Verb::Update, &key)?;
        let current = state.current(&key)?;
        if obj.metadata.resource_version.is_some()
            && obj.metadata.resource_version != current.metadata.resource_version
        {
            return Err(key.conflict());
        }

        // Status is only written through patch_status
        let mut next = obj.clone();
        if let Value::Object(data) = &mut next.data {
            data.remove("status");
            if let Some(status) = current.data.get("status") {
                data.insert("status".to_string(), status.clone());
            }
        }
        let (stored, event) = state.commit(&key, &current, next);
        self.emit(&key.kind, event);
        Ok(stored)
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<DynamicObject> {
        let mut state = self.lock();
        state.record(Verb::Patch, key, Some(patch.clone()));
        state.take_fault(Verb::Patch, key)?;
        let current = state.current(key)?;
        if let Some(rv) = patch
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
        {
            if current.metadata.resource_version.as_deref() != Some(rv) {
                return Err(key.conflict());
            }
        }

        let mut patch = patch.clone();
        if let Value::Object(map) = &mut patch {
            map.remove("status");
        }
        let mut value = serde_json::to_value(&current)?;
        merge_patch(&mut value, &patch);
        let next: DynamicObject = serde_json::from_value(value)?;
        let (stored, event) = state.commit(key, &current, next);
        self.emit(&key.kind, event);
        Ok(stored)
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<DynamicObject> {
        let mut state = self.lock();
        state.record(Verb::PatchStatus, key, Some(patch.clone()));
        state.take_fault(Verb::PatchStatus, key)?;
        let current = state.current(key)?;

        let mut value = serde_json::to_value(&current)?;
        if let Some(status) = patch.get("status") {
            merge_patch(&mut value, &json!({ "status": status }));
        }
        let next: DynamicObject = serde_json::from_value(value)?;
        let (stored, event) = state.commit(key, &current, next);
        self.emit(&key.kind, event);
        Ok(stored)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut state = self.lock();
        state.record(Verb::Delete, key, None);
        state.take_fault(Verb::Delete, key)?;
        let mut current = state.current(key)?;

        if current.finalizers().is_empty() {
            state.objects.remove(key);
            self.emit(&key.kind, Event::Delete(current));
            return Ok(());
        }
        if current.metadata.deletion_timestamp.is_none() {
            current.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            current.metadata.resource_version = Some(state.next_resource_version());
            state.objects.insert(key.clone(), current.clone());
            self.emit(&key.kind, Event::Apply(current));
        }
        Ok(())
    }

    fn watch(&self, kind: &ObjectKind, selector: &LabelSelector) -> WatchStream {
        // Subscribe and snapshot under the lock so no write falls between them
        let (rx, initial) = {
            let state = self.lock();
            let rx = self.events.subscribe();
            let initial: Vec<DynamicObject> = state
                .objects
                .iter()
                .filter(|(k, o)| &k.kind == kind && selector::matches(selector, o.labels()))
                .map(|(_, o)| o.clone())
                .collect();
            (rx, initial)
        };

        let mut init = vec![Ok(Event::Init)];
        init.extend(initial.into_iter().map(|o| Ok(Event::InitApply(o))));
        init.push(Ok(Event::InitDone));

        let guard = WatchGuard::new(self.active_watches.clone());
        let kind = kind.clone();
        let selector = selector.clone();
        let live = stream::unfold((rx, guard), move |(mut rx, guard)| {
            let kind = kind.clone();
            let selector = selector.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((event_kind, event)) => {
                            if event_kind != kind {
                                continue;
                            }
                            let matched = match &event {
                                Event::Apply(o) | Event::Delete(o) => {
                                    selector::matches(&selector, o.labels())
                                }
                                _ => false,
                            };
                            if matched {
                                return Some((Ok(event), (rx, guard)));
                            }
                        }
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        stream::iter(init).chain(live).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config_map(name: &str, labels: Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "ns", "labels": labels},
            "data": {"k": "v"}
        }))
        .unwrap()
    }

    fn cm_kind() -> ObjectKind {
        ObjectKind::new("", "v1", "ConfigMap")
    }

    #[tokio::test]
    async fn test_create_get_and_already_exists() {
        let store = MemoryStore::new();
        let created = store.create(&config_map("a", json!({}))).await.unwrap();
        assert_eq!(created.metadata.generation, Some(1));
        assert!(created.metadata.resource_version.is_some());

        let err = store.create(&config_map("a", json!({}))).await.unwrap_err();
        assert!(err.is_already_exists());

        let key = ObjectKey::new(cm_kind(), Some("ns"), "a");
        assert_eq!(store.get(&key).await.unwrap().name_any(), "a");
        assert_eq!(store.count(Verb::Create, "ConfigMap"), 2);
    }

    #[tokio::test]
    async fn test_stale_resource_version_conflicts() {
        let store = MemoryStore::new();
        let created = store.create(&config_map("a", json!({}))).await.unwrap();

        let mut first = created.clone();
        first.data["data"]["k"] = json!("v2");
        let updated = store.update(&first).await.unwrap();
        assert_eq!(updated.metadata.generation, Some(2));

        let mut stale = created;
        stale.data["data"]["k"] = json!("v3");
        assert!(store.update(&stale).await.unwrap_err().is_conflict());

        let key = ObjectKey::new(cm_kind(), Some("ns"), "a");
        let patch = json!({"metadata": {"resourceVersion": "1"}, "data": {"k": "v4"}});
        assert!(store.patch(&key, &patch).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let store = MemoryStore::new();
        let mut obj = config_map("a", json!({}));
        obj.metadata.finalizers = Some(vec!["example.com/hold".to_string()]);
        store.create(&obj).await.unwrap();

        let key = ObjectKey::new(cm_kind(), Some("ns"), "a");
        store.delete(&key).await.unwrap();
        let terminating = store.get(&key).await.unwrap();
        assert!(terminating.metadata.deletion_timestamp.is_some());

        store
            .patch(&key, &json!({"metadata": {"finalizers": null}}))
            .await
            .unwrap();
        assert!(store.get(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() {
        let store = MemoryStore::new();
        store.create(&config_map("a", json!({}))).await.unwrap();
        store.fail_next(Verb::Get, "ConfigMap", Fault::Unavailable);

        let key = ObjectKey::new(cm_kind(), Some("ns"), "a");
        assert!(store.get(&key).await.unwrap_err().is_retriable());
        assert!(store.get(&key).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_filters_by_selector() {
        let store = MemoryStore::new();
        store
            .create(&config_map("a", json!({"app": "x"})))
            .await
            .unwrap();
        store
            .create(&config_map("b", json!({"app": "y"})))
            .await
            .unwrap();

        let listed = store
            .list(&cm_kind(), Some("ns"), &selector::from_labels([("app", "x")]))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name_any(), "a");
    }

    #[tokio::test]
    async fn test_watch_replays_then_streams() {
        let store = MemoryStore::new();
        store
            .create(&config_map("a", json!({"app": "x"})))
            .await
            .unwrap();

        let mut events = store.watch(&cm_kind(), &selector::from_labels([("app", "x")]));
        assert_eq!(store.active_watches(), 1);
        assert!(matches!(events.next().await, Some(Ok(Event::Init))));
        assert!(matches!(events.next().await, Some(Ok(Event::InitApply(_)))));
        assert!(matches!(events.next().await, Some(Ok(Event::InitDone))));

        store
            .create(&config_map("ignored", json!({"app": "y"})))
            .await
            .unwrap();
        store
            .create(&config_map("b", json!({"app": "x"})))
            .await
            .unwrap();

        let next = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap();
        match next {
            Some(Ok(Event::Apply(obj))) => assert_eq!(obj.name_any(), "b"),
            other => panic!("unexpected event: {:?}", other),
        }

        drop(events);
        assert_eq!(store.active_watches(), 0);
    }
}
