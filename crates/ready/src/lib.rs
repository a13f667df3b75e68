//! Berth readiness evaluator: classifies every live object of a resource set
//! and polls until all of them satisfy their kind's ready predicate.

#![forbid(unsafe_code)]

pub mod deployment;
mod selector;

pub use selector::pod_selector;

use std::time::{Duration, Instant};

use berth_core::{decode_typed, Error, KindFamily, ObjectKey, ResourceRef, ResourceSet, Result};
use berth_kubehub::{config, Cluster};
use k8s_openapi::api::{
    apps::v1::{Deployment, ReplicaSet},
    core::v1::{PersistentVolumeClaim, Pod, Service},
};
use metrics::{counter, histogram};
use tracing::{debug, info};

/// Timeout plus poll interval for `wait_for_resources`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitOptions {
    /// `timeout` with the configured poll interval.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, interval: config::wait_poll_interval() }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// What one poll saw for one declared object.
#[derive(Debug, Clone)]
pub enum Observed {
    Pods(Vec<Pod>),
    Service(Box<Service>),
    Claim(Box<PersistentVolumeClaim>),
    Deployment { deployment: Box<Deployment>, new_replica_set: Option<Box<ReplicaSet>> },
    Job,
    Unrecognized,
    Missing,
}

impl Observed {
    pub fn is_ready(&self) -> bool {
        match self {
            Observed::Pods(pods) => pods.iter().all(is_pod_ready),
            Observed::Service(svc) => is_service_ready(svc),
            Observed::Claim(pvc) => is_volume_ready(pvc),
            Observed::Deployment { deployment, new_replica_set } => match new_replica_set {
                Some(rs) => is_deployment_ready(deployment, rs),
                None => false,
            },
            Observed::Job | Observed::Unrecognized => true,
            Observed::Missing => false,
        }
    }
}

/// Classification of every object of a set for a single tick.
#[derive(Debug, Clone, Default)]
pub struct ReadinessRecord {
    entries: Vec<(ObjectKey, Observed)>,
}

impl ReadinessRecord {
    /// Fetch and classify every entry of `set`. Not-found objects are
    /// recorded as missing; any other failure aborts.
    pub async fn observe(cluster: &dyn Cluster, set: &ResourceSet) -> Result<Self> {
        let mut entries = Vec::with_capacity(set.len());
        for r in set {
            entries.push((r.key(), observe_one(cluster, r).await?));
        }
        Ok(Self { entries })
    }

    pub fn is_ready(&self) -> bool {
        self.entries.iter().all(|(_, o)| o.is_ready())
    }

    /// Objects that are not ready yet, in set order.
    pub fn pending(&self) -> Vec<ObjectKey> {
        self.entries.iter().filter(|(_, o)| !o.is_ready()).map(|(k, _)| k.clone()).collect()
    }

    pub fn entries(&self) -> &[(ObjectKey, Observed)] {
        &self.entries
    }
}

async fn observe_one(cluster: &dyn Cluster, r: &ResourceRef) -> Result<Observed> {
    let live = match cluster.get(r).await {
        Ok(live) => live,
        Err(e) if e.is_not_found() => return Ok(Observed::Missing),
        Err(e) => return Err(e),
    };
    let key = r.key();
    let enc = |source| Error::Encoding { key: key.clone(), source };
    let family = r.family();
    let observed = match family {
        KindFamily::Pod => Observed::Pods(vec![decode_typed(&live).map_err(enc)?]),
        KindFamily::Service => Observed::Service(Box::new(decode_typed(&live).map_err(enc)?)),
        KindFamily::PersistentVolumeClaim => Observed::Claim(Box::new(decode_typed(&live).map_err(enc)?)),
        KindFamily::Deployment => {
            let d: Deployment = decode_typed(&live).map_err(enc)?;
            let new_rs = deployment::get_new_replica_set(cluster, &d).await?;
            Observed::Deployment { deployment: Box::new(d), new_replica_set: new_rs.map(Box::new) }
        }
        f if f.selects_pods() => {
            let selector = pod_selector(r, &live)?;
            let ns = r.namespace.clone().unwrap_or_default();
            Observed::Pods(cluster.list_pods(&ns, &selector).await?)
        }
        KindFamily::Job => Observed::Job,
        _ => {
            debug!(kind = %r.kind(), name = %r.name, "wait: ignoring");
            Observed::Unrecognized
        }
    };
    Ok(observed)
}

/// `Ready` condition with status `True`.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false)
}

/// ExternalName services are always ready; otherwise a cluster IP must be
/// assigned unless headless, and load balancers need an ingress.
pub fn is_service_ready(svc: &Service) -> bool {
    let Some(spec) = svc.spec.as_ref() else { return false };
    let ty = spec.type_.as_deref().unwrap_or("ClusterIP");
    if ty == "ExternalName" {
        return true;
    }
    let cluster_ip = spec.cluster_ip.as_deref().unwrap_or("");
    if cluster_ip != "None" && cluster_ip.is_empty() {
        return false;
    }
    if ty == "LoadBalancer" {
        let ingress = svc.status.as_ref().and_then(|s| s.load_balancer.as_ref()).and_then(|lb| lb.ingress.as_ref());
        if ingress.is_none() {
            return false;
        }
    }
    true
}

pub fn is_volume_ready(pvc: &PersistentVolumeClaim) -> bool {
    pvc.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound")
}

pub fn is_deployment_ready(d: &Deployment, new_rs: &ReplicaSet) -> bool {
    let ready = new_rs.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
    ready >= deployment::desired_replicas(d) - deployment::max_unavailable(d)
}

/// Poll `set` every `opts.interval` until every object is ready.
///
/// Fails with `ReadinessTimeout` naming the objects still pending once
/// `opts.timeout` has elapsed.
pub async fn wait_for_resources(cluster: &dyn Cluster, set: &ResourceSet, opts: &WaitOptions) -> Result<()> {
    info!(count = set.len(), timeout = ?opts.timeout, "beginning wait for resources");
    let t0 = Instant::now();
    let deadline = t0 + opts.timeout;
    let mut pending = set.keys();
    let poll = async {
        loop {
            counter!("readiness_ticks", 1u64);
            let record = ReadinessRecord::observe(cluster, set).await?;
            pending = record.pending();
            if pending.is_empty() {
                return Ok::<(), Error>(());
            }
            for key in &pending {
                debug!(object = %key, "not ready");
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(Error::ReadinessTimeout { pending: pending.clone() });
            }
            tokio::time::sleep(opts.interval.min(left)).await;
        }
    };
    // The outer timeout also cuts off a tick whose remote calls hang.
    let outcome = tokio::time::timeout(opts.timeout, poll).await;
    histogram!("readiness_wait_ms", t0.elapsed().as_secs_f64() * 1000.0);
    match outcome {
        Ok(Ok(())) => {
            info!(count = set.len(), elapsed_ms = t0.elapsed().as_millis() as u64, "resources ready");
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::ReadinessTimeout { pending }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn svc(spec: serde_json::Value, status: serde_json::Value) -> Service {
        serde_json::from_value(json!({"metadata": {"name": "s"}, "spec": spec, "status": status})).unwrap()
    }

    #[test]
    fn service_predicates() {
        assert!(is_service_ready(&svc(json!({"type": "ExternalName", "externalName": "db.example.com"}), json!({}))));
        assert!(is_service_ready(&svc(json!({"clusterIP": "None"}), json!({}))));
        assert!(!is_service_ready(&svc(json!({"type": "ClusterIP"}), json!({}))));
        assert!(is_service_ready(&svc(json!({"clusterIP": "10.0.0.1"}), json!({}))));
        assert!(!is_service_ready(&svc(json!({"type": "LoadBalancer", "clusterIP": "10.0.0.1"}), json!({}))));
        assert!(is_service_ready(&svc(
            json!({"type": "LoadBalancer", "clusterIP": "10.0.0.1"}),
            json!({"loadBalancer": {"ingress": [{"ip": "1.2.3.4"}]}})
        )));
    }

    #[test]
    fn pod_needs_ready_true() {
        let pod = |status: &str| -> Pod {
            serde_json::from_value(json!({"status": {"conditions": [{"type": "Ready", "status": status}]}})).unwrap()
        };
        assert!(is_pod_ready(&pod("True")));
        assert!(!is_pod_ready(&pod("False")));
        assert!(!is_pod_ready(&Pod::default()));
    }

    #[test]
    fn claim_needs_bound() {
        let pvc: PersistentVolumeClaim = serde_json::from_value(json!({"status": {"phase": "Bound"}})).unwrap();
        assert!(is_volume_ready(&pvc));
        assert!(!is_volume_ready(&PersistentVolumeClaim::default()));
    }

    #[test]
    fn deployment_readiness_uses_unavailable_budget() {
        let d: Deployment = serde_json::from_value(json!({
            "spec": {
                "replicas": 2,
                "selector": {},
                "template": {},
                "strategy": {"type": "RollingUpdate", "rollingUpdate": {"maxSurge": "0%", "maxUnavailable": "0%"}}
            }
        }))
        .unwrap();
        let rs = |ready: i32| -> ReplicaSet {
            serde_json::from_value(json!({"spec": {"selector": {}}, "status": {"replicas": 2, "readyReplicas": ready}})).unwrap()
        };
        assert!(!is_deployment_ready(&d, &rs(0)));
        assert!(is_deployment_ready(&d, &rs(1)));
        assert!(is_deployment_ready(&d, &rs(2)));
    }
}
