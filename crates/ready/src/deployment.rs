//! Deployment pairing and rollout arithmetic.

use berth_core::Result;
use berth_kubehub::Cluster;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, ReplicaSet},
        core::v1::PodTemplateSpec,
    },
    apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
};
use tracing::debug;

/// Label the deployment controller adds to the templates of its ReplicaSets.
pub const POD_TEMPLATE_HASH: &str = "pod-template-hash";

/// Resolve an absolute or percentage value against `total`, percentages
/// rounded up. A malformed value yields `None`.
fn scaled_value(v: Option<&IntOrString>, total: i32) -> Option<i32> {
    match v {
        None => Some(0),
        Some(IntOrString::Int(n)) => Some(*n),
        Some(IntOrString::String(s)) => {
            let pct: i64 = s.strip_suffix('%')?.parse().ok()?;
            let scaled = (pct * i64::from(total) + 99).div_euclid(100);
            i32::try_from(scaled).ok()
        }
    }
}

/// Resolve `maxSurge`/`maxUnavailable` into the absolute unavailable budget.
/// When both resolve to zero the budget becomes 1.
pub fn resolve_fenceposts(max_surge: Option<&IntOrString>, max_unavailable: Option<&IntOrString>, desired: i32) -> i32 {
    let Some(surge) = scaled_value(max_surge, desired) else { return 0 };
    let Some(unavailable) = scaled_value(max_unavailable, desired) else { return 0 };
    if surge + unavailable == 0 {
        return 1;
    }
    unavailable
}

/// Desired replica count, defaulting to 1 like the API server does.
pub fn desired_replicas(d: &Deployment) -> i32 {
    d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

/// How many pods may be unavailable during a rollout of `d`.
pub fn max_unavailable(d: &Deployment) -> i32 {
    let replicas = desired_replicas(d);
    let strategy = d.spec.as_ref().and_then(|s| s.strategy.as_ref());
    let rolling = strategy.and_then(|s| s.type_.as_deref()).map(|t| t == "RollingUpdate").unwrap_or(true);
    if !rolling || replicas <= 0 {
        return 0;
    }
    let ru = strategy.and_then(|s| s.rolling_update.as_ref());
    let max = resolve_fenceposts(
        ru.and_then(|r| r.max_surge.as_ref()),
        ru.and_then(|r| r.max_unavailable.as_ref()),
        replicas,
    );
    max.min(replicas)
}

/// True when `meta`'s controller owner reference points at `owner_uid`.
pub fn is_controlled_by(meta: &ObjectMeta, owner_uid: &str) -> bool {
    meta.owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
        .map(|r| r.uid == owner_uid)
        .unwrap_or(false)
}

fn without_hash(t: &PodTemplateSpec) -> serde_json::Value {
    let mut t = t.clone();
    if let Some(meta) = t.metadata.as_mut() {
        if let Some(labels) = meta.labels.as_mut() {
            labels.remove(POD_TEMPLATE_HASH);
            if labels.is_empty() {
                meta.labels = None;
            }
        }
    }
    serde_json::to_value(&t).unwrap_or(serde_json::Value::Null)
}

/// Template equality ignoring the pod-template-hash label.
pub fn equal_ignore_hash(a: &PodTemplateSpec, b: &PodTemplateSpec) -> bool {
    without_hash(a) == without_hash(b)
}

/// Pick the oldest ReplicaSet whose template matches the Deployment's.
pub fn find_new_replica_set(d: &Deployment, mut owned: Vec<ReplicaSet>) -> Option<ReplicaSet> {
    let template = &d.spec.as_ref()?.template;
    owned.sort_by(|a, b| {
        a.metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .cmp(&b.metadata.creation_timestamp.as_ref().map(|t| t.0))
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
    owned.into_iter().find(|rs| {
        rs.spec.as_ref().and_then(|s| s.template.as_ref()).map(|t| equal_ignore_hash(t, template)).unwrap_or(false)
    })
}

/// List the ReplicaSets `d` controls and return its current one, if any.
pub async fn get_new_replica_set(cluster: &dyn Cluster, d: &Deployment) -> Result<Option<ReplicaSet>> {
    let ns = d.metadata.namespace.clone().unwrap_or_default();
    let uid = d.metadata.uid.clone().unwrap_or_default();
    let selector = d.spec.as_ref().and_then(|s| s.selector.match_labels.clone()).unwrap_or_default();
    let owned: Vec<ReplicaSet> = cluster
        .list_replica_sets(&ns, &selector)
        .await?
        .into_iter()
        .filter(|rs| is_controlled_by(&rs.metadata, &uid))
        .collect();
    debug!(ns = %ns, deployment = ?d.metadata.name, owned = owned.len(), "listed owned replica sets");
    Ok(find_new_replica_set(d, owned))
}
