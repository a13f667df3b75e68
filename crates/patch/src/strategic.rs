//! Two-way strategic merge patches for built-in kinds.
//!
//! Only the list fields that carry a merge strategy are listed below; every
//! other list is replaced atomically and every other object is merged key by
//! key, which is what the API server does for them as well.

use serde_json::{Map, Value as Json};

const DELETE_DIRECTIVE: &str = "$patch";
const DELETE_FROM_PRIMITIVE_LIST: &str = "$deleteFromPrimitiveList";

/// Position inside a typed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ty {
    PodRoot,
    ServiceRoot,
    WorkloadRoot,
    CronJobRoot,
    PlainRoot,
    ObjectMeta,
    PodTemplateSpec,
    PodSpec,
    Container,
    ServiceSpec,
    WorkloadSpec,
    CronJobSpec,
    JobTemplateSpec,
    Opaque,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Struct(Ty),
    /// List merged element-wise by the named key.
    Keyed(&'static str, Ty),
    /// Primitive list with set semantics.
    Set,
}

/// Merge schema of a registered kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeSchema {
    root: Ty,
}

const REGISTERED: &[(&str, &str, Ty)] = &[
    ("", "Pod", Ty::PodRoot),
    ("", "Service", Ty::ServiceRoot),
    ("", "ReplicationController", Ty::WorkloadRoot),
    ("apps", "Deployment", Ty::WorkloadRoot),
    ("apps", "DaemonSet", Ty::WorkloadRoot),
    ("apps", "StatefulSet", Ty::WorkloadRoot),
    ("apps", "ReplicaSet", Ty::WorkloadRoot),
    ("extensions", "Deployment", Ty::WorkloadRoot),
    ("extensions", "DaemonSet", Ty::WorkloadRoot),
    ("extensions", "ReplicaSet", Ty::WorkloadRoot),
    ("batch", "Job", Ty::WorkloadRoot),
    ("batch", "CronJob", Ty::CronJobRoot),
    ("", "ConfigMap", Ty::PlainRoot),
    ("", "Secret", Ty::PlainRoot),
    ("", "ServiceAccount", Ty::PlainRoot),
    ("", "PersistentVolumeClaim", Ty::PlainRoot),
    ("", "PersistentVolume", Ty::PlainRoot),
    ("", "Endpoints", Ty::PlainRoot),
    ("", "Namespace", Ty::PlainRoot),
    ("", "LimitRange", Ty::PlainRoot),
    ("", "ResourceQuota", Ty::PlainRoot),
    ("rbac.authorization.k8s.io", "Role", Ty::PlainRoot),
    ("rbac.authorization.k8s.io", "RoleBinding", Ty::PlainRoot),
    ("rbac.authorization.k8s.io", "ClusterRole", Ty::PlainRoot),
    ("rbac.authorization.k8s.io", "ClusterRoleBinding", Ty::PlainRoot),
    ("networking.k8s.io", "Ingress", Ty::PlainRoot),
    ("networking.k8s.io", "NetworkPolicy", Ty::PlainRoot),
    ("policy", "PodDisruptionBudget", Ty::PlainRoot),
    ("autoscaling", "HorizontalPodAutoscaler", Ty::PlainRoot),
    ("storage.k8s.io", "StorageClass", Ty::PlainRoot),
];

impl MergeSchema {
    pub fn for_kind(group: &str, kind: &str) -> Option<Self> {
        REGISTERED.iter().find(|(g, k, _)| *g == group && *k == kind).map(|(_, _, root)| MergeSchema { root: *root })
    }
}

fn field(ty: Ty, name: &str) -> Option<Field> {
    use Ty::*;
    let f = match (ty, name) {
        (PodRoot | ServiceRoot | WorkloadRoot | CronJobRoot | PlainRoot, "metadata") => Field::Struct(ObjectMeta),
        (PodRoot, "spec") => Field::Struct(PodSpec),
        (ServiceRoot, "spec") => Field::Struct(ServiceSpec),
        (WorkloadRoot, "spec") => Field::Struct(WorkloadSpec),
        (CronJobRoot, "spec") => Field::Struct(CronJobSpec),
        (ObjectMeta, "ownerReferences") => Field::Keyed("uid", Opaque),
        (ObjectMeta, "finalizers") => Field::Set,
        (WorkloadSpec, "template") => Field::Struct(PodTemplateSpec),
        (CronJobSpec, "jobTemplate") => Field::Struct(JobTemplateSpec),
        (JobTemplateSpec, "metadata") | (PodTemplateSpec, "metadata") => Field::Struct(ObjectMeta),
        (JobTemplateSpec, "spec") => Field::Struct(WorkloadSpec),
        (PodTemplateSpec, "spec") => Field::Struct(PodSpec),
        (PodSpec, "containers" | "initContainers" | "ephemeralContainers") => Field::Keyed("name", Container),
        (PodSpec, "volumes" | "imagePullSecrets" | "resourceClaims") => Field::Keyed("name", Opaque),
        (PodSpec, "hostAliases") => Field::Keyed("ip", Opaque),
        (Container, "ports") => Field::Keyed("containerPort", Opaque),
        (Container, "env") => Field::Keyed("name", Opaque),
        (Container, "volumeMounts") => Field::Keyed("mountPath", Opaque),
        (Container, "volumeDevices") => Field::Keyed("devicePath", Opaque),
        (ServiceSpec, "ports") => Field::Keyed("port", Opaque),
        _ => return None,
    };
    Some(f)
}

/// Two-way strategic merge patch from `old` to `new` under `schema`.
pub fn create_two_way_patch(old: &Json, new: &Json, schema: MergeSchema) -> Json {
    match (old, new) {
        (Json::Object(o), Json::Object(n)) => Json::Object(diff_object(o, n, schema.root)),
        _ => new.clone(),
    }
}

fn diff_object(old: &Map<String, Json>, new: &Map<String, Json>, ty: Ty) -> Map<String, Json> {
    let mut patch = Map::new();
    for (k, nv) in new {
        match old.get(k) {
            None => {
                patch.insert(k.clone(), nv.clone());
            }
            Some(ov) if ov == nv => {}
            Some(ov) => diff_field(&mut patch, k, ov, nv, field(ty, k)),
        }
    }
    for k in old.keys() {
        if !new.contains_key(k) {
            patch.insert(k.clone(), Json::Null);
        }
    }
    patch
}

fn diff_field(patch: &mut Map<String, Json>, k: &str, old: &Json, new: &Json, f: Option<Field>) {
    match (old, new, f) {
        (Json::Object(o), Json::Object(n), _) => {
            let ty = match f {
                Some(Field::Struct(ty)) => ty,
                _ => Ty::Opaque,
            };
            let sub = diff_object(o, n, ty);
            if !sub.is_empty() {
                patch.insert(k.to_string(), Json::Object(sub));
            }
        }
        (Json::Array(o), Json::Array(n), Some(Field::Keyed(merge_key, elem))) => match diff_keyed_list(o, n, merge_key, elem) {
            Some(list) => {
                if !list.is_empty() {
                    patch.insert(k.to_string(), Json::Array(list));
                }
            }
            None => {
                patch.insert(k.to_string(), new.clone());
            }
        },
        (Json::Array(o), Json::Array(n), Some(Field::Set)) => {
            let added: Vec<Json> = n.iter().filter(|v| !o.contains(v)).cloned().collect();
            let removed: Vec<Json> = o.iter().filter(|v| !n.contains(v)).cloned().collect();
            if !added.is_empty() {
                patch.insert(k.to_string(), Json::Array(added));
            }
            if !removed.is_empty() {
                patch.insert(format!("{}/{}", DELETE_FROM_PRIMITIVE_LIST, k), Json::Array(removed));
            }
        }
        _ => {
            patch.insert(k.to_string(), new.clone());
        }
    }
}

/// Element-wise diff of a list merged by `merge_key`. Returns `None` when an
/// element lacks the key, in which case the caller replaces the whole list.
fn diff_keyed_list(old: &[Json], new: &[Json], merge_key: &str, elem: Ty) -> Option<Vec<Json>> {
    let key_of = |v: &Json| v.as_object().and_then(|m| m.get(merge_key)).cloned();
    if old.iter().chain(new).any(|v| key_of(v).is_none()) {
        return None;
    }
    let mut out = Vec::new();
    for nv in new {
        let key = key_of(nv)?;
        match old.iter().find(|ov| key_of(ov).as_ref() == Some(&key)) {
            None => out.push(nv.clone()),
            Some(ov) if ov == nv => {}
            Some(ov) => {
                let (Some(o), Some(n)) = (ov.as_object(), nv.as_object()) else {
                    return None;
                };
                let mut sub = diff_object(o, n, elem);
                if !sub.is_empty() {
                    sub.insert(merge_key.to_string(), key);
                    out.push(Json::Object(sub));
                }
            }
        }
    }
    for ov in old {
        let key = key_of(ov)?;
        if !new.iter().any(|nv| key_of(nv).as_ref() == Some(&key)) {
            let mut marker = Map::new();
            marker.insert(merge_key.to_string(), key);
            marker.insert(DELETE_DIRECTIVE.to_string(), Json::String("delete".into()));
            out.push(Json::Object(marker));
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(containers: Json) -> Json {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "nginx", "namespace": "default"},
            "spec": {"containers": containers}
        })
    }

    fn pod_schema() -> MergeSchema {
        MergeSchema::for_kind("", "Pod").unwrap()
    }

    #[test]
    fn added_container_is_an_addition_not_a_replacement() {
        let old = pod(json!([{"name": "app", "image": "app:1"}]));
        let new = pod(json!([{"name": "app", "image": "app:1"}, {"name": "sidecar", "image": "proxy:1"}]));
        let patch = create_two_way_patch(&old, &new, pod_schema());
        assert_eq!(patch, json!({"spec": {"containers": [{"name": "sidecar", "image": "proxy:1"}]}}));
    }

    #[test]
    fn removed_container_gets_delete_marker() {
        let old = pod(json!([{"name": "app", "image": "app:1"}, {"name": "sidecar", "image": "proxy:1"}]));
        let new = pod(json!([{"name": "app", "image": "app:1"}]));
        let patch = create_two_way_patch(&old, &new, pod_schema());
        assert_eq!(patch, json!({"spec": {"containers": [{"name": "sidecar", "$patch": "delete"}]}}));
    }

    #[test]
    fn port_change_is_limited_to_ports_of_matching_container() {
        let old = pod(json!([
            {"name": "app", "image": "app:1", "ports": [{"containerPort": 80, "name": "web"}]},
            {"name": "other", "image": "other:1"}
        ]));
        let new = pod(json!([
            {"name": "app", "image": "app:1", "ports": [{"containerPort": 80, "name": "http"}]},
            {"name": "other", "image": "other:1"}
        ]));
        let patch = create_two_way_patch(&old, &new, pod_schema());
        assert_eq!(
            patch,
            json!({"spec": {"containers": [{"name": "app", "ports": [{"containerPort": 80, "name": "http"}]}]}})
        );
    }

    #[test]
    fn port_number_change_swaps_keyed_entries() {
        let old = pod(json!([{"name": "app", "ports": [{"containerPort": 80}]}]));
        let new = pod(json!([{"name": "app", "ports": [{"containerPort": 8080}]}]));
        let patch = create_two_way_patch(&old, &new, pod_schema());
        assert_eq!(
            patch,
            json!({"spec": {"containers": [{"name": "app", "ports": [
                {"containerPort": 8080},
                {"containerPort": 80, "$patch": "delete"}
            ]}]}})
        );
    }

    #[test]
    fn reordering_keyed_list_is_not_a_change() {
        let old = pod(json!([{"name": "a", "image": "x"}, {"name": "b", "image": "y"}]));
        let new = pod(json!([{"name": "b", "image": "y"}, {"name": "a", "image": "x"}]));
        let patch = create_two_way_patch(&old, &new, pod_schema());
        assert_eq!(patch, json!({}));
    }

    #[test]
    fn atomic_lists_are_replaced() {
        let old = pod(json!([{"name": "a", "args": ["--one", "--two"]}]));
        let new = pod(json!([{"name": "a", "args": ["--one"]}]));
        let patch = create_two_way_patch(&old, &new, pod_schema());
        assert_eq!(patch, json!({"spec": {"containers": [{"name": "a", "args": ["--one"]}]}}));
    }

    #[test]
    fn finalizers_use_primitive_delete_list() {
        let old = json!({"metadata": {"name": "x", "finalizers": ["a", "b"]}});
        let new = json!({"metadata": {"name": "x", "finalizers": ["a", "c"]}});
        let patch = create_two_way_patch(&old, &new, MergeSchema::for_kind("", "ConfigMap").unwrap());
        assert_eq!(
            patch,
            json!({"metadata": {"finalizers": ["c"], "$deleteFromPrimitiveList/finalizers": ["b"]}})
        );
    }

    #[test]
    fn service_ports_merge_by_port() {
        let old = json!({"spec": {"ports": [{"port": 80, "targetPort": 8080}, {"port": 443}]}});
        let new = json!({"spec": {"ports": [{"port": 80, "targetPort": 9090}, {"port": 443}]}});
        let patch = create_two_way_patch(&old, &new, MergeSchema::for_kind("", "Service").unwrap());
        assert_eq!(patch, json!({"spec": {"ports": [{"port": 80, "targetPort": 9090}]}}));
    }

    #[test]
    fn keyless_elements_fall_back_to_replacement() {
        let old = pod(json!([{"name": "a", "env": [{"value": "x"}]}]));
        let new = pod(json!([{"name": "a", "env": [{"value": "y"}]}]));
        let patch = create_two_way_patch(&old, &new, pod_schema());
        assert_eq!(patch, json!({"spec": {"containers": [{"name": "a", "env": [{"value": "y"}]}]}}));
    }

    #[test]
    fn removed_map_keys_are_nulled() {
        let old = json!({"metadata": {"name": "x", "labels": {"a": "1", "b": "2"}}});
        let new = json!({"metadata": {"name": "x", "labels": {"a": "1"}}});
        let patch = create_two_way_patch(&old, &new, MergeSchema::for_kind("", "ConfigMap").unwrap());
        assert_eq!(patch, json!({"metadata": {"labels": {"b": null}}}));
    }
}
