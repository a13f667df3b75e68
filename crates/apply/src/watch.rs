//! Single-object watches that block until a kind-specific milestone.

use std::{fmt, time::Duration};

use berth_core::{decode_typed, Error, KindFamily, ObjectKey, ResourceRef, Result};
use berth_kubehub::{Cluster, WatchStream};
use futures::StreamExt;
use k8s_openapi::api::{batch::v1::Job, core::v1::Pod};
use kube::{api::WatchEvent, core::DynamicObject};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Terminal or intermediate phase of a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    pub fn of(pod: &Pod) -> Self {
        pod.status.as_ref().and_then(|s| s.phase.as_deref()).map(Self::parse).unwrap_or(PodPhase::Unknown)
    }

    pub fn is_completed(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Feed events to `done` until it reports the milestone. A zero `timeout`
/// waits without a deadline.
async fn until<F>(key: &ObjectKey, mut stream: WatchStream, timeout: Duration, mut done: F) -> Result<()>
where
    F: FnMut(WatchEvent<DynamicObject>) -> Result<bool> + Send,
{
    let fold = async {
        while let Some(ev) = stream.next().await {
            if done(ev?)? {
                return Ok(());
            }
        }
        Err(Error::Watch { key: key.clone(), message: "watch closed before the condition was met".into() })
    };
    if timeout.is_zero() {
        return fold.await;
    }
    match tokio::time::timeout(timeout, fold).await {
        Ok(res) => res,
        Err(_) => Err(Error::ReadinessTimeout { pending: vec![key.clone()] }),
    }
}

fn job_milestone(key: &ObjectKey, obj: &DynamicObject) -> Result<bool> {
    let job: Job = decode_typed(obj).map_err(|source| Error::Encoding { key: key.clone(), source })?;
    let status = job.status.unwrap_or_default();
    for c in status.conditions.iter().flatten() {
        if c.status != "True" {
            continue;
        }
        match c.type_.as_str() {
            "Complete" => return Ok(true),
            "Failed" => {
                return Err(Error::JobFailed { key: key.clone(), reason: c.reason.clone().unwrap_or_default() });
            }
            _ => {}
        }
    }
    debug!(
        name = %key.name,
        active = status.active.unwrap_or(0),
        failed = status.failed.unwrap_or(0),
        succeeded = status.succeeded.unwrap_or(0),
        "job still running"
    );
    Ok(false)
}

/// Block until `r` is added or modified; Jobs must complete.
pub async fn watch_until_ready(cluster: &dyn Cluster, r: &ResourceRef, timeout: Duration) -> Result<()> {
    let key = r.key();
    let is_job = r.family() == KindFamily::Job;
    info!(kind = %r.kind(), name = %r.name, timeout = ?timeout, "watching for changes");
    let stream = cluster.watch(r).await?;
    until(&key, stream, timeout, |ev| match ev {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
            debug!(name = %key.name, "add/modify event");
            if is_job {
                job_milestone(&key, &obj)
            } else {
                Ok(true)
            }
        }
        WatchEvent::Deleted(_) => {
            debug!(name = %key.name, "deleted event");
            Ok(true)
        }
        WatchEvent::Error(e) => {
            Err(Error::Watch { key: key.clone(), message: format!("failed to deploy {}: {}", key.name, e.message) })
        }
        WatchEvent::Bookmark(_) => Ok(false),
    })
    .await
}

/// Block until the pod reaches `Succeeded` or `Failed`. Deletion of the pod
/// is `NotFound`.
pub async fn watch_pod_until_complete(cluster: &dyn Cluster, r: &ResourceRef, timeout: Duration) -> Result<()> {
    let key = r.key();
    info!(name = %r.name, timeout = ?timeout, "watching pod for completion");
    let stream = cluster.watch(r).await?;
    until(&key, stream, timeout, |ev| match ev {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
            let pod: Pod = decode_typed(&obj).map_err(|source| Error::Encoding { key: key.clone(), source })?;
            Ok(PodPhase::of(&pod).is_completed())
        }
        WatchEvent::Deleted(_) => Err(Error::NotFound(key.clone())),
        WatchEvent::Error(e) => Err(Error::Watch { key: key.clone(), message: e.message }),
        WatchEvent::Bookmark(_) => Ok(false),
    })
    .await
}
