//! Berth apply: reconciles manifest streams against the cluster. Creates
//! what is missing, patches what changed, prunes what was dropped and
//! optionally waits for the result to become ready.

#![forbid(unsafe_code)]

mod watch;

pub use watch::{watch_pod_until_complete, watch_until_ready, PodPhase};

use std::{sync::Arc, time::Duration};

use berth_core::{Error, ResourceRef, ResourceSet, Result};
use berth_kubehub::{build, Cluster};
use berth_ready::{pod_selector, wait_for_resources, WaitOptions};
use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Whether objects dropped from the manifest are still deleted when some
/// patches of the same update failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PruneOnFailure {
    #[default]
    Skip,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Delete and recreate objects whose patch is rejected.
    pub force: bool,
    /// Delete the pods of every successfully patched controller.
    pub recreate_pods: bool,
    pub wait: bool,
    pub timeout: Duration,
    pub prune_on_failure: PruneOnFailure,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            force: false,
            recreate_pods: false,
            wait: false,
            timeout: Duration::from_secs(300),
            prune_on_failure: PruneOnFailure::default(),
        }
    }
}

/// What an update pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub unchanged: usize,
    pub removes: usize,
}

/// Reconciler over one cluster connection.
#[derive(Clone)]
pub struct Reconciler {
    cluster: Arc<dyn Cluster>,
}

impl Reconciler {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self { cluster }
    }

    pub fn cluster(&self) -> &dyn Cluster {
        self.cluster.as_ref()
    }

    /// Decode `manifests` without typed validation.
    pub async fn build(&self, namespace: &str, manifests: &[u8]) -> Result<ResourceSet> {
        build(self.cluster(), namespace, manifests, false).await
    }

    /// Decode `manifests`, rejecting registered kinds that do not decode into
    /// their typed form.
    pub async fn build_strict(&self, namespace: &str, manifests: &[u8]) -> Result<ResourceSet> {
        build(self.cluster(), namespace, manifests, true).await
    }

    /// Create every object in `manifests`, in order, stopping at the first
    /// failure. With `wait`, block until all of them are ready.
    pub async fn create(&self, namespace: &str, manifests: &[u8], wait: Option<Duration>) -> Result<()> {
        debug!(ns = %namespace, "building resources from manifest");
        let mut set = self.build(namespace, manifests).await?;
        if set.is_empty() {
            return Err(Error::NoObjects);
        }
        info!(ns = %namespace, count = set.len(), "creating resources");
        for r in set.iter_mut() {
            self.create_one(r).await?;
        }
        match wait {
            Some(timeout) => self.wait_for(&set, timeout).await,
            None => Ok(()),
        }
    }

    /// Bring the cluster from `original` to `target`.
    pub async fn update(&self, namespace: &str, original: &[u8], target: &[u8], opts: &UpdateOptions) -> Result<()> {
        let original = self.build(namespace, original).await?;
        debug!(ns = %namespace, "building resources from updated manifest");
        let mut target = self.build(namespace, target).await?;

        let mut summary = DiffSummary::default();
        let mut failures = Vec::new();
        info!(ns = %namespace, count = target.len(), "checking resources for changes");
        for r in target.iter_mut() {
            if let Err(e) = self.cluster.get(r).await {
                if !e.is_not_found() {
                    return Err(e);
                }
                self.create_one(r).await?;
                summary.adds += 1;
                continue;
            }
            let Some(prior) = original.get(&r.key()) else {
                return Err(Error::Orphan(r.key()));
            };
            match self.update_one(r, &prior.object, opts).await {
                Ok(true) => summary.updates += 1,
                Ok(false) => summary.unchanged += 1,
                Err(e) => {
                    warn!(kind = %r.kind(), name = %r.name, error = %e, "error updating the resource");
                    failures.push(e);
                }
            }
        }

        if !failures.is_empty() && opts.prune_on_failure == PruneOnFailure::Skip {
            info!(adds = summary.adds, updates = summary.updates, "skipping prune after failed updates");
            return Err(Error::Aggregate(failures));
        }
        summary.removes = self.prune(&original, &target).await;
        info!(
            ns = %namespace,
            adds = summary.adds,
            updates = summary.updates,
            unchanged = summary.unchanged,
            removes = summary.removes,
            "update pass finished"
        );
        if !failures.is_empty() {
            return Err(Error::Aggregate(failures));
        }
        if opts.wait {
            return self.wait_for(&target, opts.timeout).await;
        }
        Ok(())
    }

    /// Delete every object in `manifests`. Objects already gone are fine.
    pub async fn delete(&self, namespace: &str, manifests: &[u8]) -> Result<()> {
        let set = self.build(namespace, manifests).await?;
        if set.is_empty() {
            return Err(Error::NoObjects);
        }
        for r in &set {
            info!(kind = %r.kind(), name = %r.name, "starting delete");
            match self.cluster.delete(r).await {
                Ok(()) => counter!("reconcile_deletes", 1u64),
                Err(e) if e.is_not_found() => debug!(error = %e, "already deleted"),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Watch each object until its milestone: Jobs until they complete,
    /// everything else until it shows up.
    pub async fn watch_until_ready(&self, namespace: &str, manifests: &[u8], timeout: Duration) -> Result<()> {
        let set = self.build_strict(namespace, manifests).await?;
        if set.is_empty() {
            return Err(Error::NoObjects);
        }
        for r in &set {
            watch_until_ready(self.cluster(), r, timeout).await?;
        }
        Ok(())
    }

    /// Watch the single object of `manifests`, which must be a Pod, until it
    /// completes and return the phase it ended in.
    pub async fn wait_and_get_completed_pod_phase(
        &self,
        namespace: &str,
        manifests: &[u8],
        timeout: Duration,
    ) -> Result<PodPhase> {
        let mut set = self.build_strict(namespace, manifests).await?;
        match set.len() {
            0 => return Err(Error::NoObjects),
            1 => {}
            n => return Err(Error::NotSinglePod(n)),
        }
        let r = set.iter_mut().next().ok_or(Error::NoObjects)?;
        if r.kind() != "Pod" || !r.gvk.group.is_empty() {
            return Err(Error::NotAPod(r.key()));
        }
        watch_pod_until_complete(self.cluster(), r, timeout).await?;
        let live = self.cluster.get(r).await?;
        r.refresh(live);
        let pod: Pod = r.typed()?;
        Ok(PodPhase::of(&pod))
    }

    /// Poll the objects of `manifests` until they are ready, changing nothing.
    pub async fn wait(&self, namespace: &str, manifests: &[u8], timeout: Duration) -> Result<()> {
        let set = self.build(namespace, manifests).await?;
        self.wait_for(&set, timeout).await
    }

    async fn wait_for(&self, set: &ResourceSet, timeout: Duration) -> Result<()> {
        wait_for_resources(self.cluster(), set, &WaitOptions::new(timeout)).await
    }

    async fn create_one(&self, r: &mut ResourceRef) -> Result<()> {
        let live = self.cluster.create(r).await?;
        r.refresh(live);
        counter!("reconcile_creates", 1u64);
        info!(kind = %r.kind(), name = %r.name, ns = ?r.namespace, "created a new resource");
        Ok(())
    }

    /// Patch `r` towards its manifest body. Returns whether anything was
    /// written.
    async fn update_one(&self, r: &mut ResourceRef, prior: &DynamicObject, opts: &UpdateOptions) -> Result<bool> {
        let decision = berth_patch::compute(prior, r)?;
        let Some(body) = decision.patch.as_ref() else {
            info!(kind = %r.kind(), name = %r.name, "looks like there are no changes");
            let live = self.cluster.get(r).await?;
            r.refresh(live);
            return Ok(false);
        };
        match self.cluster.patch(r, decision.strategy, body).await {
            Ok(live) => {
                counter!("reconcile_patches", 1u64);
                r.refresh(live);
            }
            Err(e) => {
                counter!("reconcile_patch_err", 1u64);
                warn!(kind = %r.kind(), name = %r.name, error = %e, "cannot patch");
                if !opts.force {
                    info!("use force to recreate the resource");
                    return Err(Error::Patch { key: r.key(), source: Box::new(e) });
                }
                self.cluster.delete(r).await?;
                counter!("reconcile_deletes", 1u64);
                info!(kind = %r.kind(), name = %r.name, "deleted");
                self.create_one(r).await?;
                return Ok(true);
            }
        }
        if opts.recreate_pods {
            self.recreate_pods(r).await?;
        }
        Ok(true)
    }

    async fn recreate_pods(&self, r: &ResourceRef) -> Result<()> {
        let selector = pod_selector(r, &r.object)?;
        if selector.is_empty() {
            warn!(kind = %r.kind(), name = %r.name, "empty pod selector; not restarting pods");
            return Ok(());
        }
        let ns = r.namespace.clone().unwrap_or_default();
        for pod in self.cluster.list_pods(&ns, &selector).await? {
            info!(ns = %ns, pod = ?pod.metadata.name, "restarting pod");
            self.cluster.delete_pod(&pod).await?;
        }
        Ok(())
    }

    /// Delete `original - target`. Failures are logged, never returned.
    async fn prune(&self, original: &ResourceSet, target: &ResourceSet) -> usize {
        let mut removed = 0;
        for r in original.difference(target) {
            info!(kind = %r.kind(), name = %r.name, ns = ?r.namespace, "deleting");
            match self.cluster.delete(r).await {
                Ok(()) => {
                    counter!("reconcile_deletes", 1u64);
                    removed += 1;
                }
                Err(e) if e.is_not_found() => debug!(error = %e, "already deleted"),
                Err(e) => warn!(kind = %r.kind(), name = %r.name, error = %e, "failed to delete"),
            }
        }
        removed
    }
}
