//! Manifest stream decoding: `---` separated YAML (or JSON) documents into a
//! resource set bound to the cluster's API resources.

use berth_core::{decode_json, Error, KindFamily, ObjectKey, ResourceRef, ResourceSet, Result};
use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
    batch::v1::Job,
    core::v1::{ConfigMap, PersistentVolumeClaim, Pod, ReplicationController, Secret, Service},
};
use kube::core::{DynamicObject, GroupVersionKind};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::{config, Cluster};

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Split a manifest stream into JSON documents. Empty documents are skipped
/// and `kind: List` documents (plus core `v1` `*List` kinds) are flattened
/// into their items.
pub fn decode_documents(manifests: &[u8]) -> Result<Vec<Json>> {
    if manifests.len() > config::max_manifest_bytes() {
        return Err(Error::Decode(format!("manifest too large (>{} bytes)", config::max_manifest_bytes())));
    }
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_slice(manifests) {
        let val = serde_yaml::Value::deserialize(doc).map_err(|e| Error::Decode(format!("parsing YAML: {}", e)))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).map_err(|e| Error::Decode(format!("converting YAML to JSON: {}", e)))?;
        if json_node_budget_exceeded(&json, config::max_manifest_nodes()) {
            return Err(Error::Decode(format!("document too complex (>{} nodes)", config::max_manifest_nodes())));
        }
        flatten_into(json, &mut out);
    }
    Ok(out)
}

fn flatten_into(json: Json, out: &mut Vec<Json>) {
    let kind = json.get("kind").and_then(|k| k.as_str()).unwrap_or("");
    let core = json.get("apiVersion").and_then(|v| v.as_str()) == Some("v1");
    let is_list = (kind == "List" || (core && kind.ends_with("List")))
        && json.get("items").map(|i| i.is_array()).unwrap_or(false);
    if !is_list {
        out.push(json);
        return;
    }
    if let Some(Json::Array(items)) = json.get("items") {
        for item in items {
            flatten_into(item.clone(), out);
        }
    }
}

fn parse_target(json: &Json) -> Result<(GroupVersionKind, String)> {
    let api_version = json
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Decode("object missing apiVersion".into()))?;
    let kind = json
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Decode("object missing kind".into()))?;
    let name = json
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Decode(format!("{} object missing metadata.name", kind)))?;
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    Ok((GroupVersionKind { group, version, kind: kind.to_string() }, name.to_string()))
}

/// Strict check: registered kinds must decode into their typed form.
fn validate_typed(gvk: &GroupVersionKind, name: &str, json: &Json) -> Result<()> {
    fn check<K: DeserializeOwned>(json: &Json) -> std::result::Result<(), serde_json::Error> {
        decode_json::<K>(json.clone()).map(|_| ())
    }
    let res = match KindFamily::of(&gvk.group, &gvk.kind) {
        KindFamily::Pod => check::<Pod>(json),
        KindFamily::Service => check::<Service>(json),
        KindFamily::PersistentVolumeClaim => check::<PersistentVolumeClaim>(json),
        KindFamily::ReplicationController => check::<ReplicationController>(json),
        KindFamily::Deployment => check::<Deployment>(json),
        KindFamily::DaemonSet => check::<DaemonSet>(json),
        KindFamily::StatefulSet => check::<StatefulSet>(json),
        KindFamily::ReplicaSet => check::<ReplicaSet>(json),
        KindFamily::Job => check::<Job>(json),
        KindFamily::Unsupported => match (gvk.group.as_str(), gvk.kind.as_str()) {
            ("", "ConfigMap") => check::<ConfigMap>(json),
            ("", "Secret") => check::<Secret>(json),
            _ => Ok(()),
        },
    };
    res.map_err(|e| Error::Decode(format!("error validating {} {:?}: {}", gvk.kind, name, e)))
}

/// Decode `manifests` and bind every object to its API resource.
///
/// Namespaced objects without a namespace get `namespace`; an explicit
/// namespace in the manifest wins. With `validate` set, registered kinds must
/// decode into their typed form.
pub async fn build(cluster: &dyn Cluster, namespace: &str, manifests: &[u8], validate: bool) -> Result<ResourceSet> {
    let mut set = ResourceSet::new();
    for json in decode_documents(manifests)? {
        let (gvk, name) = parse_target(&json)?;
        if validate {
            validate_typed(&gvk, &name, &json)?;
        }
        let declared_ns = json.pointer("/metadata/namespace").and_then(|v| v.as_str()).filter(|s| !s.is_empty());
        let (api, namespaced) = cluster.resolve(&gvk, &ObjectKey::new(&gvk.kind, declared_ns, &name)).await?;
        let mut object: DynamicObject =
            serde_json::from_value(json).map_err(|e| Error::Decode(format!("{} {:?}: {}", gvk.kind, name, e)))?;
        let ns = if namespaced {
            Some(object.metadata.namespace.clone().filter(|s| !s.is_empty()).unwrap_or_else(|| namespace.to_string()))
        } else {
            None
        };
        object.metadata.namespace = ns.clone();
        let r = ResourceRef { gvk, namespace: ns, name, api, namespaced, object };
        if set.contains(&r.key()) {
            warn!(object = %r.key(), "duplicate object in manifest");
        }
        set.push(r);
    }
    debug!(count = set.len(), "built resources from manifest");
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCluster;

    const GUESTBOOK: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: redis-master
  labels:
    app: redis
spec:
  ports:
  - port: 6379
    targetPort: 6379
  selector:
    app: redis
---
---
apiVersion: v1
kind: ReplicationController
metadata:
  name: redis-master
spec:
  replicas: 1
  selector:
    app: redis
  template:
    metadata:
      labels:
        app: redis
    spec:
      containers:
      - name: master
        image: redis
"#;

    #[test]
    fn decode_skips_empty_documents() {
        let docs = decode_documents(GUESTBOOK.as_bytes()).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["kind"], "Service");
        assert_eq!(docs[1]["kind"], "ReplicationController");
    }

    #[test]
    fn decode_flattens_lists() {
        let y = r#"{"apiVersion":"v1","kind":"List","items":[
            {"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"a"}},
            {"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"b"}}]}"#;
        let docs = decode_documents(y.as_bytes()).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["metadata"]["name"], "b");
    }

    #[test]
    fn decode_keeps_custom_list_kinds_whole() {
        let y = r#"{"apiVersion":"policy.example.com/v1","kind":"AllowList","metadata":{"name":"egress"},
            "items":[{"host":"example.com"}]}"#;
        let docs = decode_documents(y.as_bytes()).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["kind"], "AllowList");

        let y = r#"{"apiVersion":"v1","kind":"ConfigMapList","items":[
            {"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"a"}}]}"#;
        let docs = decode_documents(y.as_bytes()).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["kind"], "ConfigMap");
    }

    #[test]
    fn decode_empty_stream_is_empty() {
        assert!(decode_documents(b"").unwrap().is_empty());
        assert!(decode_documents(b"---\n---\n").unwrap().is_empty());
    }

    #[test]
    fn parse_errors_are_friendly() {
        let e1 = parse_target(&serde_json::json!({"kind": "Foo", "metadata": {"name": "x"}})).unwrap_err().to_string();
        assert!(e1.contains("missing apiVersion"), "e1={}", e1);
        let e2 = parse_target(&serde_json::json!({"apiVersion": "v1", "metadata": {"name": "x"}})).unwrap_err().to_string();
        assert!(e2.contains("missing kind"), "e2={}", e2);
        let e3 = parse_target(&serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {}})).unwrap_err().to_string();
        assert!(e3.contains("missing metadata.name"), "e3={}", e3);
    }

    #[test]
    fn node_budget_detects_deep_documents() {
        let v = serde_json::json!({"a": [1, 2, 3], "b": {"c": {"d": 1}}});
        assert!(json_node_budget_exceeded(&v, 3));
        assert!(!json_node_budget_exceeded(&v, 100));
    }

    #[tokio::test]
    async fn build_defaults_namespace_and_keeps_order() {
        let cluster = MockCluster::new();
        let set = build(&cluster, "test", GUESTBOOK.as_bytes(), false).await.unwrap();
        assert_eq!(set.len(), 2);
        let kinds: Vec<_> = set.iter().map(|r| r.kind().to_string()).collect();
        assert_eq!(kinds, vec!["Service", "ReplicationController"]);
        assert!(set.iter().all(|r| r.namespace.as_deref() == Some("test")));
    }

    #[tokio::test]
    async fn build_leaves_cluster_scoped_objects_without_namespace() {
        let cluster = MockCluster::new();
        let y = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: team-a\n";
        let set = build(&cluster, "test", y.as_bytes(), false).await.unwrap();
        let r = set.iter().next().unwrap();
        assert!(!r.namespaced);
        assert_eq!(r.namespace, None);
    }

    #[tokio::test]
    async fn unknown_kinds_name_their_object() {
        let cluster = MockCluster::new();
        cluster.unserve("extensions/v1beta1");
        let y = "apiVersion: extensions/v1beta1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: prod\n";
        let err = build(&cluster, "test", y.as_bytes(), false).await.unwrap_err();
        assert_eq!(err.key(), Some(&ObjectKey::new("Deployment", Some("prod"), "web")));
        assert!(err.to_string().contains("Deployment \"prod/web\""), "err={}", err);
        assert!(err.to_string().contains("extensions/v1beta1"), "err={}", err);
    }

    #[tokio::test]
    async fn strict_build_rejects_mistyped_fields() {
        let cluster = MockCluster::new();
        let y = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: lots\n";
        assert!(build(&cluster, "test", y.as_bytes(), false).await.is_ok());
        let err = build(&cluster, "test", y.as_bytes(), true).await.unwrap_err();
        assert!(err.to_string().contains("error validating Deployment"), "err={}", err);
    }
}
