use std::collections::BTreeMap;

use berth_core::{decode_typed, Error, KindFamily, ResourceRef, Result};
use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
        batch::v1::Job,
        core::v1::ReplicationController,
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::core::DynamicObject;

fn match_labels(sel: Option<&LabelSelector>) -> BTreeMap<String, String> {
    sel.and_then(|s| s.match_labels.clone()).unwrap_or_default()
}

/// Label selector of the pods managed by `r`, read from `body`.
///
/// Workload controllers and Jobs are supported; any other kind is
/// `UnsupportedKind`.
pub fn pod_selector(r: &ResourceRef, body: &DynamicObject) -> Result<BTreeMap<String, String>> {
    let key = r.key();
    let enc = |source| Error::Encoding { key: key.clone(), source };
    let labels = match r.family() {
        KindFamily::ReplicationController => {
            let rc: ReplicationController = decode_typed(body).map_err(enc)?;
            rc.spec.and_then(|s| s.selector).unwrap_or_default()
        }
        KindFamily::ReplicaSet => {
            let rs: ReplicaSet = decode_typed(body).map_err(enc)?;
            match_labels(rs.spec.as_ref().map(|s| &s.selector))
        }
        KindFamily::Deployment => {
            let d: Deployment = decode_typed(body).map_err(enc)?;
            match_labels(d.spec.as_ref().map(|s| &s.selector))
        }
        KindFamily::DaemonSet => {
            let ds: DaemonSet = decode_typed(body).map_err(enc)?;
            match_labels(ds.spec.as_ref().map(|s| &s.selector))
        }
        KindFamily::StatefulSet => {
            let ss: StatefulSet = decode_typed(body).map_err(enc)?;
            match_labels(ss.spec.as_ref().map(|s| &s.selector))
        }
        KindFamily::Job => {
            let job: Job = decode_typed(body).map_err(enc)?;
            match_labels(job.spec.as_ref().and_then(|s| s.selector.as_ref()))
        }
        KindFamily::Pod | KindFamily::Service | KindFamily::PersistentVolumeClaim | KindFamily::Unsupported => {
            return Err(Error::UnsupportedKind(key));
        }
    };
    Ok(labels)
}
