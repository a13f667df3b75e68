//! In-memory cluster for tests. Records every remote call so callers can
//! assert on exact call sequences.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use berth_core::{decode_typed, Error, ObjectKey, PatchStrategy, ResourceRef, Result};
use chrono::Utc;
use futures::{stream, StreamExt};
use k8s_openapi::{
    api::{apps::v1::ReplicaSet, core::v1::Pod},
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::{
    api::WatchEvent,
    core::{ApiResource, DynamicObject, ErrorResponse, GroupVersionKind},
};
use serde_json::Value as Json;

use crate::{selector_string, unknown_kind, Cluster, WatchStream};

const CLUSTER_SCOPED: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "StorageClass",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Get(ObjectKey),
    Create(ObjectKey),
    Patch { key: ObjectKey, strategy: PatchStrategy, body: Json },
    Delete(ObjectKey),
    ListPods { namespace: String, selector: String },
    DeletePod { name: String, uid: Option<String> },
    ListReplicaSets { namespace: String, selector: String },
    Watch(ObjectKey),
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    calls: Vec<Call>,
    fail_patch: BTreeSet<ObjectKey>,
    fail_get: BTreeSet<ObjectKey>,
    hang_get: BTreeSet<ObjectKey>,
    unserved: BTreeSet<String>,
    watch_scripts: BTreeMap<ObjectKey, (Vec<WatchEvent<DynamicObject>>, bool)>,
    staged: Vec<(ObjectKey, usize, DynamicObject)>,
    next_rv: u64,
}

/// Cluster backed by a map of objects. Patches are applied with merge-patch
/// semantics (lists replaced, `$` directives dropped), which is enough for
/// tests that only look at the patch bodies they recorded.
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<State>,
}

pub fn api_error(code: u16, reason: &str, message: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse { status: "Failure".into(), message: message.into(), reason: reason.into(), code })
}

fn key_of(obj: &DynamicObject) -> Result<ObjectKey> {
    let types = obj.types.as_ref().ok_or_else(|| Error::Decode("object missing apiVersion/kind".into()))?;
    let name = obj.metadata.name.clone().ok_or_else(|| Error::Decode("object missing metadata.name".into()))?;
    Ok(ObjectKey::new(&types.kind, obj.metadata.namespace.as_deref(), name))
}

fn labels_match(obj: &DynamicObject, selector: &BTreeMap<String, String>) -> bool {
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

fn merge(target: &mut Json, patch: &Json) {
    match (target, patch) {
        (Json::Object(t), Json::Object(p)) => {
            for (k, v) in p {
                if k.starts_with('$') {
                    continue;
                }
                if v.is_null() {
                    t.remove(k);
                } else {
                    merge(t.entry(k.clone()).or_insert(Json::Null), v);
                }
            }
        }
        (t, p) => *t = p.clone(),
    }
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Put an object into the cluster as if it already existed.
    pub fn seed(&self, body: Json) -> Result<ObjectKey> {
        let obj: DynamicObject = serde_json::from_value(body).map_err(|e| Error::Decode(e.to_string()))?;
        let key = key_of(&obj)?;
        let mut st = self.lock();
        let obj = Self::stamp(&mut st, obj);
        st.objects.insert(key.clone(), obj);
        Ok(key)
    }

    /// Replace an object once it has been fetched `after_gets` more times.
    pub fn stage(&self, after_gets: usize, body: Json) -> Result<ObjectKey> {
        let obj: DynamicObject = serde_json::from_value(body).map_err(|e| Error::Decode(e.to_string()))?;
        let key = key_of(&obj)?;
        self.lock().staged.push((key.clone(), after_gets, obj));
        Ok(key)
    }

    pub fn remove(&self, key: &ObjectKey) {
        self.lock().objects.remove(key);
    }

    pub fn fail_patch(&self, key: ObjectKey) {
        self.lock().fail_patch.insert(key);
    }

    pub fn fail_get(&self, key: ObjectKey) {
        self.lock().fail_get.insert(key);
    }

    /// GETs of `key` never return.
    pub fn hang_get(&self, key: ObjectKey) {
        self.lock().hang_get.insert(key);
    }

    /// Make `api_version` (e.g. `extensions/v1beta1`) unknown to discovery.
    pub fn unserve(&self, api_version: &str) {
        self.lock().unserved.insert(api_version.to_string());
    }

    /// Events returned by the next watch of `key`; the stream ends after them.
    pub fn script_watch(&self, key: ObjectKey, events: Vec<WatchEvent<DynamicObject>>) {
        self.lock().watch_scripts.insert(key, (events, false));
    }

    /// Like `script_watch`, but the stream stays open after the last event.
    pub fn script_watch_open(&self, key: ObjectKey, events: Vec<WatchEvent<DynamicObject>>) {
        self.lock().watch_scripts.insert(key, (events, true));
    }

    pub fn object(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.lock().objects.contains_key(key)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Calls that change cluster state.
    pub fn writes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Create(_) | Call::Patch { .. } | Call::Delete(_) | Call::DeletePod { .. }))
            .collect()
    }

    fn stamp(st: &mut State, mut obj: DynamicObject) -> DynamicObject {
        st.next_rv += 1;
        obj.metadata.resource_version = Some(st.next_rv.to_string());
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(format!("uid-{}", st.next_rv));
        }
        if obj.metadata.creation_timestamp.is_none() {
            obj.metadata.creation_timestamp = Some(Time(Utc::now()));
        }
        obj
    }

    fn select<K: serde::de::DeserializeOwned>(
        st: &State,
        kind: &str,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        st.objects
            .iter()
            .filter(|(k, _)| k.kind == kind && k.namespace.as_deref() == Some(namespace))
            .filter(|(_, o)| labels_match(o, selector))
            .map(|(k, o)| decode_typed::<K>(o).map_err(|source| Error::Encoding { key: k.clone(), source }))
            .collect()
    }
}

#[async_trait]
impl Cluster for MockCluster {
    async fn resolve(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<(ApiResource, bool)> {
        let api = ApiResource::from_gvk(gvk);
        if self.lock().unserved.contains(&api.api_version) {
            return Err(unknown_kind(gvk, key));
        }
        Ok((api, !CLUSTER_SCOPED.contains(&gvk.kind.as_str())))
    }

    async fn get(&self, r: &ResourceRef) -> Result<DynamicObject> {
        let key = r.key();
        let hang = self.lock().hang_get.contains(&key);
        if hang {
            futures::future::pending::<()>().await;
        }
        let mut st = self.lock();
        st.calls.push(Call::Get(key.clone()));
        if st.fail_get.contains(&key) {
            return Err(Error::api(key, api_error(500, "InternalError", "etcd unavailable")));
        }
        let mut remaining = Vec::new();
        let mut ready = Vec::new();
        for (k, n, obj) in std::mem::take(&mut st.staged) {
            match (k == key, n) {
                (true, 0) => ready.push(obj),
                (true, n) => remaining.push((k, n - 1, obj)),
                (false, _) => remaining.push((k, n, obj)),
            }
        }
        st.staged = remaining;
        for obj in ready {
            let obj = Self::stamp(&mut st, obj);
            st.objects.insert(key.clone(), obj);
        }
        st.objects.get(&key).cloned().ok_or(Error::NotFound(key))
    }

    async fn create(&self, r: &ResourceRef) -> Result<DynamicObject> {
        let key = r.key();
        let mut st = self.lock();
        st.calls.push(Call::Create(key.clone()));
        if st.objects.contains_key(&key) {
            return Err(Error::api(key, api_error(409, "AlreadyExists", "object already exists")));
        }
        let mut obj = r.object.clone();
        obj.metadata.uid = None;
        let obj = Self::stamp(&mut st, obj);
        st.objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn patch(&self, r: &ResourceRef, strategy: PatchStrategy, body: &Json) -> Result<DynamicObject> {
        let key = r.key();
        let mut st = self.lock();
        st.calls.push(Call::Patch { key: key.clone(), strategy, body: body.clone() });
        if st.fail_patch.contains(&key) {
            return Err(Error::api(key, api_error(422, "Invalid", "field is immutable")));
        }
        let current = st.objects.get(&key).cloned().ok_or_else(|| Error::NotFound(key.clone()))?;
        let mut json = serde_json::to_value(&current).map_err(|source| Error::Encoding { key: key.clone(), source })?;
        merge(&mut json, body);
        let patched: DynamicObject =
            serde_json::from_value(json).map_err(|source| Error::Encoding { key: key.clone(), source })?;
        let patched = Self::stamp(&mut st, patched);
        st.objects.insert(key, patched.clone());
        Ok(patched)
    }

    async fn delete(&self, r: &ResourceRef) -> Result<()> {
        let key = r.key();
        let mut st = self.lock();
        st.calls.push(Call::Delete(key.clone()));
        st.objects.remove(&key).map(|_| ()).ok_or(Error::NotFound(key))
    }

    async fn list_pods(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<Pod>> {
        let mut st = self.lock();
        st.calls.push(Call::ListPods { namespace: namespace.to_string(), selector: selector_string(selector) });
        Self::select(&st, "Pod", namespace, selector)
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let key = ObjectKey::new("Pod", pod.metadata.namespace.as_deref(), name.clone());
        let mut st = self.lock();
        st.calls.push(Call::DeletePod { name, uid: pod.metadata.uid.clone() });
        let live_uid = st.objects.get(&key).and_then(|o| o.metadata.uid.clone());
        match live_uid {
            None => Err(Error::NotFound(key)),
            Some(uid) if pod.metadata.uid.as_deref().map(|u| u != uid).unwrap_or(false) => {
                Err(Error::api(key, api_error(409, "Conflict", "precondition failed: UID mismatch")))
            }
            Some(_) => {
                st.objects.remove(&key);
                Ok(())
            }
        }
    }

    async fn list_replica_sets(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<ReplicaSet>> {
        let mut st = self.lock();
        st.calls.push(Call::ListReplicaSets { namespace: namespace.to_string(), selector: selector_string(selector) });
        Self::select(&st, "ReplicaSet", namespace, selector)
    }

    async fn watch(&self, r: &ResourceRef) -> Result<WatchStream> {
        let key = r.key();
        let mut st = self.lock();
        st.calls.push(Call::Watch(key.clone()));
        let (events, open) = match st.watch_scripts.remove(&key) {
            Some(script) => script,
            None => (st.objects.get(&key).cloned().map(WatchEvent::Added).into_iter().collect(), false),
        };
        let events = stream::iter(events.into_iter().map(Ok));
        if open {
            return Ok(events.chain(stream::pending()).boxed());
        }
        Ok(events.boxed())
    }
}
