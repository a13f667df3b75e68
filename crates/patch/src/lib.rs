//! Berth patch calculator: decides whether a desired object differs from the
//! current one and, if so, builds the patch body and picks its content type.

#![forbid(unsafe_code)]

mod merge;
mod strategic;

pub use merge::create_merge_patch;
pub use strategic::{create_two_way_patch, MergeSchema};

use berth_core::{Error, PatchStrategy, ResourceRef, Result};
use kube::core::DynamicObject;
use serde_json::Value as Json;
use tracing::debug;

/// Outcome of comparing a current object with its desired state.
/// `patch: None` means there is nothing to send.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchDecision {
    pub patch: Option<Json>,
    pub strategy: PatchStrategy,
}

impl PatchDecision {
    pub fn unchanged(strategy: PatchStrategy) -> Self {
        Self { patch: None, strategy }
    }

    pub fn is_empty(&self) -> bool {
        self.patch.is_none()
    }

    pub fn body_bytes(&self) -> Option<Vec<u8>> {
        self.patch.as_ref().and_then(|p| serde_json::to_vec(p).ok())
    }
}

/// Strategic merge when the kind has a registered merge schema, JSON merge
/// otherwise (custom resources and anything else unknown).
pub fn strategy_for(group: &str, kind: &str) -> PatchStrategy {
    match MergeSchema::for_kind(group, kind) {
        Some(_) => PatchStrategy::StrategicMerge,
        None => PatchStrategy::JsonMerge,
    }
}

/// Compare `current` with the body of `target`.
pub fn compute(current: &DynamicObject, target: &ResourceRef) -> Result<PatchDecision> {
    let key = target.key();
    let old = serde_json::to_vec(current).map_err(|source| Error::Encoding { key: key.clone(), source })?;
    let new = serde_json::to_vec(&target.object).map_err(|source| Error::Encoding { key: key.clone(), source })?;
    let strategy = strategy_for(&target.gvk.group, &target.gvk.kind);
    if old == new {
        return Ok(PatchDecision::unchanged(strategy));
    }
    let old: Json = serde_json::from_slice(&old).map_err(|source| Error::Encoding { key: key.clone(), source })?;
    let new: Json = serde_json::from_slice(&new).map_err(|source| Error::Encoding { key: key.clone(), source })?;
    let decision = diff(&old, &new, &target.gvk.group, &target.gvk.kind);
    debug!(object = %key, strategy = ?decision.strategy, changed = decision.patch.is_some(), "computed patch");
    Ok(decision)
}

/// Pure diff over already serialized objects.
pub fn diff(old: &Json, new: &Json, group: &str, kind: &str) -> PatchDecision {
    let (patch, strategy) = match MergeSchema::for_kind(group, kind) {
        Some(schema) => (create_two_way_patch(old, new, schema), PatchStrategy::StrategicMerge),
        None => (create_merge_patch(old, new), PatchStrategy::JsonMerge),
    };
    let patch = match patch {
        Json::Object(map) if map.is_empty() => None,
        other => Some(other),
    };
    PatchDecision { patch, strategy }
}
