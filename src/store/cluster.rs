//! [`ObjectStore`] binding over the Kubernetes API server

use async_trait::async_trait;
use futures::{future, stream, StreamExt, TryStreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    client::Client,
    runtime::{watcher, WatchStreamExt},
};
use serde_json::Value;
use tracing::debug;

use super::{selector, ObjectKey, ObjectKind, ObjectStore, WatchStream};
use crate::error::{Error, Result};

const FIELD_MANAGER: &str = "package-operator";

/// Store backed by a live cluster
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: &ObjectKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = kind.api_resource();
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

/// Map API status codes onto the typed error variants
fn classify(err: kube::Error, key: &ObjectKey) -> Error {
    match err {
        kube::Error::Api(ref resp) if resp.code == 404 => key.not_found(),
        kube::Error::Api(ref resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            key.already_exists()
        }
        kube::Error::Api(ref resp) if resp.code == 409 => key.conflict(),
        other => Error::KubeError(other),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject> {
        self.api(&key.kind, key.namespace.as_deref())
            .get(&key.name)
            .await
            .map_err(|e| classify(e, key))
    }

    async fn list(
        &self,
        kind: &ObjectKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<DynamicObject>> {
        let params = ListParams::default().labels_from(&selector::parse(selector)?);
        let list = self
            .api(kind, namespace)
            .list(&params)
            .await
            .map_err(Error::KubeError)?;
        // List items omit apiVersion/kind, restore them for ObjectKey::of
        let types = kube::core::TypeMeta {
            api_version: kind.api_version(),
            kind: kind.kind.clone(),
        };
        Ok(list
            .items
            .into_iter()
            .map(|mut obj| {
                obj.types.get_or_insert_with(|| types.clone());
                obj
            })
            .collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj)?;
        debug!("Creating {}", key);
        self.api(&key.kind, key.namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, &key))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj)?;
        debug!("Updating {}", key);
        self.api(&key.kind, key.namespace.as_deref())
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, &key))
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<DynamicObject> {
        debug!("Patching {}", key);
        self.api(&key.kind, key.namespace.as_deref())
            .patch(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .map_err(|e| classify(e, key))
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<DynamicObject> {
        self.api(&key.kind, key.namespace.as_deref())
            .patch_status(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .map_err(|e| classify(e, key))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        debug!("Deleting {}", key);
        self.api(&key.kind, key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| classify(e, key))
    }

    fn watch(&self, kind: &ObjectKind, selector: &LabelSelector) -> WatchStream {
        let selector = match selector::parse(selector) {
            Ok(selector) => selector,
            Err(e) => return stream::once(future::ready(Err(e))).boxed(),
        };
        let config = watcher::Config::default().labels_from(&selector);
        let kind = kind.clone();
        watcher(self.api(&kind, None), config)
            .default_backoff()
            .map_ok(move |event| {
                event.modify(|obj| {
                    obj.types.get_or_insert_with(|| kube::core::TypeMeta {
                        api_version: kind.api_version(),
                        kind: kind.kind.clone(),
                    });
                })
            })
            .map_err(|e| Error::WatchError(e.to_string()))
            .boxed()
    }
}
