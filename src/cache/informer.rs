//! Background watch task keeping a local copy of one kind

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::DynamicObject;
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::{selector, ObjectKey, ObjectKind, WatchStream};

type Objects = Arc<RwLock<BTreeMap<ObjectKey, DynamicObject>>>;

/// Local copy of all objects of one kind, fed by a watch stream.
/// The task is aborted when the informer is dropped.
pub(crate) struct Informer {
    objects: Objects,
    synced: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl Informer {
    /// Start consuming `stream`. `notify` is called for every change after the initial sync.
    pub(crate) fn spawn<F>(kind: ObjectKind, stream: WatchStream, notify: F) -> Self
    where
        F: Fn(&DynamicObject) + Send + 'static,
    {
        let objects: Objects = Arc::default();
        let (synced_tx, synced) = watch::channel(false);
        let task = tokio::spawn(run(kind, stream, objects.clone(), synced_tx, notify));
        Self {
            objects,
            synced,
            task,
        }
    }

    pub(crate) fn synced(&self) -> watch::Receiver<bool> {
        self.synced.clone()
    }

    pub(crate) fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub(crate) fn get(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub(crate) fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Vec<DynamicObject> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(k, _)| namespace.is_none() || k.namespace.as_deref() == namespace)
            .filter(|(_, o)| selector::matches(selector, o.labels()))
            .map(|(_, o)| o.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for Informer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<F>(
    kind: ObjectKind,
    mut stream: WatchStream,
    objects: Objects,
    synced: watch::Sender<bool>,
    notify: F,
) where
    F: Fn(&DynamicObject),
{
    debug!("Informer for {} started", kind);
    let mut buffer: Option<BTreeMap<ObjectKey, DynamicObject>> = None;

    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Init) => buffer = Some(BTreeMap::new()),
            Ok(Event::InitApply(obj)) => {
                if let (Some(buf), Ok(key)) = (buffer.as_mut(), ObjectKey::of(&obj)) {
                    buf.insert(key, obj);
                }
            }
            Ok(Event::InitDone) => {
                if let Some(buf) = buffer.take() {
                    let changed = {
                        let mut current = objects.write().unwrap_or_else(PoisonError::into_inner);
                        let previous = std::mem::replace(&mut *current, buf);
                        // The first list only fills the cache
                        if *synced.borrow() {
                            relist_changes(&previous, &current)
                        } else {
                            Vec::new()
                        }
                    };
                    if !changed.is_empty() {
                        debug!("Re-list of {} changed {} objects", kind, changed.len());
                    }
                    for obj in &changed {
                        notify(obj);
                    }
                }
                synced.send_replace(true);
            }
            Ok(Event::Apply(obj)) => {
                if let Ok(key) = ObjectKey::of(&obj) {
                    objects
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(key, obj.clone());
                }
                notify(&obj);
            }
            Ok(Event::Delete(obj)) => {
                if let Ok(key) = ObjectKey::of(&obj) {
                    objects
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&key);
                }
                notify(&obj);
            }
            Err(e) => warn!("Watch error in {} informer: {}", kind, e),
        }
    }
    debug!("Informer for {} stopped", kind);
}

/// Objects that differ between two lists: added or updated ones from `current`,
/// removed ones from `previous`
fn relist_changes(
    previous: &BTreeMap<ObjectKey, DynamicObject>,
    current: &BTreeMap<ObjectKey, DynamicObject>,
) -> Vec<DynamicObject> {
    let updated = current.iter().filter(|(key, obj)| {
        previous
            .get(key)
            .map_or(true, |old| old.resource_version() != obj.resource_version())
    });
    let removed = previous.iter().filter(|(key, _)| !current.contains_key(key));
    updated.chain(removed).map(|(_, obj)| obj.clone()).collect()
}
