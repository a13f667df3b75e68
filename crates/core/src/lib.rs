//! Berth core types: resource identity, resource sets, kind table and errors.

#![forbid(unsafe_code)]

mod error;
mod kind;

pub use error::{Error, Result};
pub use kind::KindFamily;

use std::fmt;

use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub mod prelude {
    pub use super::{Error, KindFamily, ObjectKey, PatchStrategy, ResourceRef, ResourceSet, Result};
}

/// How a patch body is to be interpreted by the API server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatchStrategy {
    /// `application/strategic-merge-patch+json`
    StrategicMerge,
    /// `application/merge-patch+json`
    JsonMerge,
}

impl PatchStrategy {
    pub fn content_type(self) -> &'static str {
        match self {
            PatchStrategy::StrategicMerge => "application/strategic-merge-patch+json",
            PatchStrategy::JsonMerge => "application/merge-patch+json",
        }
    }
}

/// Identity of an object inside one cluster: kind, namespace and name.
/// Neither API group nor version is part of it, so `extensions/v1beta1` and
/// `apps/v1` Deployments with the same name are the same object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: namespace.map(|s| s.to_string()), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} \"{}/{}\"", self.kind, ns, self.name),
            None => write!(f, "{} \"{}\"", self.kind, self.name),
        }
    }
}

/// One declared object plus the binding needed to act on it remotely.
///
/// `object` starts out as the manifest body and is replaced by the live body
/// whenever the ref is refreshed (after a create, a patch or a get).
#[derive(Debug, Clone)]
pub struct ResourceRef {
    pub gvk: GroupVersionKind,
    pub namespace: Option<String>,
    pub name: String,
    pub api: ApiResource,
    pub namespaced: bool,
    pub object: DynamicObject,
}

impl ResourceRef {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.gvk.kind, self.namespace.as_deref(), &self.name)
    }

    pub fn kind(&self) -> &str {
        &self.gvk.kind
    }

    pub fn family(&self) -> KindFamily {
        KindFamily::of(&self.gvk.group, &self.gvk.kind)
    }

    pub fn api_version(&self) -> String {
        if self.gvk.group.is_empty() {
            self.gvk.version.clone()
        } else {
            format!("{}/{}", self.gvk.group, self.gvk.version)
        }
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.object.metadata.resource_version.as_deref()
    }

    /// Replace the local body with what the server returned.
    pub fn refresh(&mut self, live: DynamicObject) {
        self.object = live;
    }

    /// Serialize the current body, keys sorted.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&self.object).map_err(|source| Error::Encoding { key: self.key(), source })
    }

    /// Decode the current body into a typed k8s-openapi struct.
    pub fn typed<K: DeserializeOwned>(&self) -> Result<K> {
        decode_typed(&self.object).map_err(|source| Error::Encoding { key: self.key(), source })
    }
}

/// Decode any dynamic body into a typed struct by way of its JSON form.
///
/// `apiVersion` and `kind` are dropped first so that older API generations
/// decode into the current typed struct.
pub fn decode_typed<K: DeserializeOwned>(obj: &DynamicObject) -> std::result::Result<K, serde_json::Error> {
    decode_json(serde_json::to_value(obj)?)
}

/// Same as `decode_typed`, from a JSON body.
pub fn decode_json<K: DeserializeOwned>(mut body: serde_json::Value) -> std::result::Result<K, serde_json::Error> {
    if let Some(map) = body.as_object_mut() {
        map.remove("apiVersion");
        map.remove("kind");
    }
    serde_json::from_value(body)
}

/// Ordered collection of resource refs, in manifest document order.
#[derive(Debug, Clone, Default)]
pub struct ResourceSet {
    items: Vec<ResourceRef>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, r: ResourceRef) {
        self.items.push(r);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResourceRef> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, ResourceRef> {
        self.items.iter_mut()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&ResourceRef> {
        self.items.iter().find(|r| r.key() == *key)
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.get(key).is_some()
    }

    /// Entries of `self` whose identity is absent from `other`.
    pub fn difference<'a>(&'a self, other: &ResourceSet) -> Vec<&'a ResourceRef> {
        self.items.iter().filter(|r| !other.contains(&r.key())).collect()
    }

    /// Call `f` on every entry in order, stopping at the first error.
    pub fn visit<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&ResourceRef) -> Result<()>,
    {
        for r in &self.items {
            f(r)?;
        }
        Ok(())
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.items.iter().map(|r| r.key()).collect()
    }
}

impl FromIterator<ResourceRef> for ResourceSet {
    fn from_iter<T: IntoIterator<Item = ResourceRef>>(iter: T) -> Self {
        Self { items: iter.into_iter().collect() }
    }
}

impl IntoIterator for ResourceSet {
    type Item = ResourceRef;
    type IntoIter = std::vec::IntoIter<ResourceRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResourceSet {
    type Item = &'a ResourceRef;
    type IntoIter = std::slice::Iter<'a, ResourceRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Build a ref straight from a JSON body, with a guessed API binding.
/// Used by tests and by callers that already know the object is namespaced.
pub fn ref_from_json(body: serde_json::Value, namespace: Option<&str>) -> Result<ResourceRef> {
    let obj: DynamicObject = serde_json::from_value(body).map_err(|e| Error::Decode(e.to_string()))?;
    let types = obj.types.clone().ok_or_else(|| Error::Decode("object missing apiVersion/kind".into()))?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), types.api_version.clone()),
    };
    let gvk = GroupVersionKind { group, version, kind: types.kind };
    let name = obj.metadata.name.clone().ok_or_else(|| Error::Decode("object missing metadata.name".into()))?;
    let ns = obj.metadata.namespace.clone().or_else(|| namespace.map(|s| s.to_string()));
    let mut object = obj;
    object.metadata.namespace = ns.clone();
    Ok(ResourceRef { api: ApiResource::from_gvk(&gvk), gvk, namespaced: ns.is_some(), namespace: ns, name, object })
}
