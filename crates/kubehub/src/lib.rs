//! Berth kubehub: the cluster seam the reconciler talks through, its kube-rs
//! implementation, and manifest decoding into resource sets.

#![forbid(unsafe_code)]

pub mod config;
mod manifest;
pub mod mock;

pub use manifest::{build, decode_documents};

use std::collections::BTreeMap;

use async_trait::async_trait;
use berth_core::{Error, ObjectKey, PatchStrategy, ResourceRef, Result};
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::api::{apps::v1::ReplicaSet, core::v1::Pod};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions, WatchEvent, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use tokio::sync::OnceCell;
use tracing::debug;

pub type WatchStream = BoxStream<'static, Result<WatchEvent<DynamicObject>>>;

/// Everything the reconciler needs from the cluster API. One call per method,
/// no retries; not-found surfaces as `Error::NotFound`.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Resolve a GVK to its API binding and whether it is namespaced. `key`
    /// names the manifest object being bound, for errors.
    async fn resolve(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<(ApiResource, bool)>;
    async fn get(&self, r: &ResourceRef) -> Result<DynamicObject>;
    async fn create(&self, r: &ResourceRef) -> Result<DynamicObject>;
    async fn patch(&self, r: &ResourceRef, strategy: PatchStrategy, body: &serde_json::Value) -> Result<DynamicObject>;
    /// Delete with background propagation.
    async fn delete(&self, r: &ResourceRef) -> Result<()>;
    async fn list_pods(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<Pod>>;
    /// Delete one pod, guarded by a UID precondition.
    async fn delete_pod(&self, pod: &Pod) -> Result<()>;
    async fn list_replica_sets(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<ReplicaSet>>;
    /// Watch a single object by name, starting from the ref's resourceVersion.
    async fn watch(&self, r: &ResourceRef) -> Result<WatchStream>;
}

/// Error for a GVK the cluster does not serve.
pub fn unknown_kind(gvk: &GroupVersionKind, key: &ObjectKey) -> Error {
    let api_version = if gvk.group.is_empty() { gvk.version.clone() } else { format!("{}/{}", gvk.group, gvk.version) };
    Error::UnknownKind { key: key.clone(), kind: gvk.kind.clone(), api_version }
}

/// Render `matchLabels` as a label selector query.
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// kube-rs backed cluster. Discovery runs once, on first resolve.
pub struct KubeCluster {
    client: Client,
    discovery: OnceCell<Discovery>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client, discovery: OnceCell::new() }
    }

    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Decode(format!("loading kube client: {}", e)))?;
        Ok(Self::new(client))
    }

    fn api_for(&self, r: &ResourceRef) -> Api<DynamicObject> {
        match (r.namespaced, r.namespace.as_deref()) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &r.api),
            _ => Api::all_with(self.client.clone(), &r.api),
        }
    }

    async fn discovery(&self, key: &ObjectKey) -> Result<&Discovery> {
        self.discovery
            .get_or_try_init(|| async {
                Discovery::new(self.client.clone()).run().await.map_err(|e| Error::api(key.clone(), e))
            })
            .await
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn resolve(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<(ApiResource, bool)> {
        let discovery = self.discovery(key).await?;
        for group in discovery.groups() {
            if group.name() != gvk.group {
                continue;
            }
            for version in group.versions() {
                if version != gvk.version {
                    continue;
                }
                for (ar, caps) in group.versioned_resources(version) {
                    if ar.kind == gvk.kind {
                        let namespaced = matches!(caps.scope, Scope::Namespaced);
                        return Ok((ar, namespaced));
                    }
                }
            }
        }
        Err(unknown_kind(gvk, key))
    }

    async fn get(&self, r: &ResourceRef) -> Result<DynamicObject> {
        self.api_for(r).get(&r.name).await.map_err(|e| Error::api(r.key(), e))
    }

    async fn create(&self, r: &ResourceRef) -> Result<DynamicObject> {
        let mut obj = r.object.clone();
        obj.metadata.resource_version = None;
        self.api_for(r).create(&PostParams::default(), &obj).await.map_err(|e| Error::api(r.key(), e))
    }

    async fn patch(&self, r: &ResourceRef, strategy: PatchStrategy, body: &serde_json::Value) -> Result<DynamicObject> {
        let pp = PatchParams::default();
        let res = match strategy {
            PatchStrategy::StrategicMerge => self.api_for(r).patch(&r.name, &pp, &Patch::Strategic(body)).await,
            PatchStrategy::JsonMerge => self.api_for(r).patch(&r.name, &pp, &Patch::Merge(body)).await,
        };
        res.map_err(|e| Error::api(r.key(), e))
    }

    async fn delete(&self, r: &ResourceRef) -> Result<()> {
        self.api_for(r)
            .delete(&r.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| Error::api(r.key(), e))
    }

    async fn list_pods(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&selector_string(selector));
        let list = api
            .list(&lp)
            .await
            .map_err(|e| Error::api(ObjectKey::new("Pod", Some(namespace), ""), e))?;
        debug!(ns = %namespace, count = list.items.len(), "listed pods");
        Ok(list.items)
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        let ns = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &ns);
        let dp = DeleteParams {
            preconditions: Some(Preconditions { uid: pod.metadata.uid.clone(), resource_version: None }),
            ..Default::default()
        };
        api.delete(&name, &dp)
            .await
            .map(|_| ())
            .map_err(|e| Error::api(ObjectKey::new("Pod", Some(&ns), name.clone()), e))
    }

    async fn list_replica_sets(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<ReplicaSet>> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&selector_string(selector));
        let list = api
            .list(&lp)
            .await
            .map_err(|e| Error::api(ObjectKey::new("ReplicaSet", Some(namespace), ""), e))?;
        Ok(list.items)
    }

    async fn watch(&self, r: &ResourceRef) -> Result<WatchStream> {
        let key = r.key();
        let wp = WatchParams::default().fields(&format!("metadata.name={}", r.name));
        let rv = r.resource_version().unwrap_or("0").to_string();
        let stream = self.api_for(r).watch(&wp, &rv).await.map_err(|e| Error::api(key.clone(), e))?;
        Ok(stream.map(move |ev| ev.map_err(|e| Error::api(key.clone(), e))).boxed())
    }
}
