//! Kind-agnostic access to the cluster object store
//!
//! Controllers talk to the API server only through [`ObjectStore`], which
//! speaks [`DynamicObject`] envelopes addressed by [`ObjectKind`] and
//! [`ObjectKey`]. Typed CRDs are converted through serde by the helpers at
//! the bottom of this module.

mod cluster;
#[cfg(test)]
mod memory;
pub mod selector;

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

pub use cluster::KubeStore;
#[cfg(test)]
pub use memory::{Fault, MemoryStore, StoreCall, Verb};

/// Group, version and kind of an object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ObjectKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Kind of a statically known resource type
    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self {
            group: K::group(&()).into_owned(),
            version: K::version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
        }
    }

    /// Split an `apiVersion` such as `apps/v1` or `v1`
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// Kind of a dynamic object, read from its type meta
    pub fn of_object(obj: &DynamicObject) -> Result<Self> {
        let types = obj.types.as_ref().ok_or_else(|| {
            Error::ValidationError(format!(
                "object {} is missing apiVersion/kind",
                obj.name_any()
            ))
        })?;
        Ok(Self::from_api_version(&types.api_version, &types.kind))
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Resource description for dynamic API access.
    /// The plural is derived from the kind name.
    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(
            &self.group,
            &self.version,
            &self.kind,
        ))
    }

    /// Matches group and kind, ignoring the version
    pub fn is_group_kind(&self, group: &str, kind: &str) -> bool {
        self.group == group && self.kind == kind
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}.{}", self.kind, self.version)
        } else {
            write!(f, "{}.{}.{}", self.kind, self.version, self.group)
        }
    }
}

/// Fully qualified address of a single object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ObjectKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.map(String::from),
            name: name.to_string(),
        }
    }

    /// Key of a dynamic object
    pub fn of(obj: &DynamicObject) -> Result<Self> {
        let kind = ObjectKind::of_object(obj)?;
        let name = obj.metadata.name.clone().ok_or_else(|| {
            Error::ValidationError(format!("{} object is missing metadata.name", kind))
        })?;
        Ok(Self {
            kind,
            namespace: obj.metadata.namespace.clone(),
            name,
        })
    }

    /// Key of a typed resource
    pub fn for_resource<K: Resource<DynamicType = ()>>(obj: &K) -> Self {
        Self {
            kind: ObjectKind::of::<K>(),
            namespace: obj.meta().namespace.clone(),
            name: obj.meta().name.clone().unwrap_or_default(),
        }
    }

    pub(crate) fn not_found(&self) -> Error {
        Error::NotFound {
            kind: self.kind.kind.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone().unwrap_or_default(),
        }
    }

    pub(crate) fn already_exists(&self) -> Error {
        Error::AlreadyExists {
            kind: self.kind.kind.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone().unwrap_or_default(),
        }
    }

    pub(crate) fn conflict(&self) -> Error {
        Error::Conflict {
            kind: self.kind.kind.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind.kind, self.name),
        }
    }
}

/// Stream of watch events for one kind
pub type WatchStream = BoxStream<'static, Result<watcher::Event<DynamicObject>>>;

/// Capability set of the remote object store
///
/// Writes use optimistic concurrency: an object carrying a stale
/// `metadata.resourceVersion` is rejected with [`Error::Conflict`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject>;

    /// List objects of a kind. `None` lists across all namespaces and an
    /// empty selector matches everything.
    async fn list(
        &self,
        kind: &ObjectKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<DynamicObject>>;

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Apply a JSON merge patch to everything but the status
    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<DynamicObject>;

    /// Apply a JSON merge patch to the status subresource
    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<DynamicObject>;

    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// Watch all namespaces for objects of a kind matching the selector.
    /// The subscription is established before this returns.
    fn watch(&self, kind: &ObjectKind, selector: &LabelSelector) -> WatchStream;
}

/// Apply an RFC 7386 JSON merge patch in place
#[cfg(test)]
pub(crate) fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(
                    target_map.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
    }
}

/// True when every field of `desired` is present with the same value in `live`.
/// Arrays must have the same length, elements are compared the same way.
pub fn is_json_subset(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => d
            .iter()
            .all(|(k, v)| l.get(k).is_some_and(|lv| is_json_subset(v, lv))),
        (Value::Array(d), Value::Array(l)) => {
            d.len() == l.len() && d.iter().zip(l).all(|(dv, lv)| is_json_subset(dv, lv))
        }
        _ => desired == live,
    }
}

pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub fn from_dynamic<K: DeserializeOwned>(obj: DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub async fn get_typed<K>(store: &dyn ObjectStore, namespace: Option<&str>, name: &str) -> Result<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let key = ObjectKey::new(ObjectKind::of::<K>(), namespace, name);
    from_dynamic(store.get(&key).await?)
}

pub async fn list_typed<K>(
    store: &dyn ObjectStore,
    namespace: Option<&str>,
    selector: &LabelSelector,
) -> Result<Vec<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    store
        .list(&ObjectKind::of::<K>(), namespace, selector)
        .await?
        .into_iter()
        .map(from_dynamic)
        .collect()
}

pub async fn create_typed<K>(store: &dyn ObjectStore, obj: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    from_dynamic(store.create(&to_dynamic(obj)?).await?)
}

pub async fn update_typed<K>(store: &dyn ObjectStore, obj: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    from_dynamic(store.update(&to_dynamic(obj)?).await?)
}

pub async fn patch_typed<K>(store: &dyn ObjectStore, obj: &K, patch: &Value) -> Result<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    from_dynamic(store.patch(&ObjectKey::for_resource(obj), patch).await?)
}

pub async fn patch_status<K>(store: &dyn ObjectStore, obj: &K, status: &impl Serialize) -> Result<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let patch = serde_json::json!({ "status": status });
    from_dynamic(
        store
            .patch_status(&ObjectKey::for_resource(obj), &patch)
            .await?,
    )
}
