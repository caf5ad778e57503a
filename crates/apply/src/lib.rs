//! Converge apply: a cluster client that remembers what it wrote.
//!
//! A [`TrackingClient`] lives for one reconciliation pass. Every successful
//! write records the object's [`ResourceKey`]; the resulting [`TrackedSet`]
//! is what orphan cleanup compares the cluster against.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use converge_core::{OwnershipConfig, ResourceKey, TrackedSet};
use converge_kubehub::{resolve_key, ClusterApi, ClusterError, ObjectPatch};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::core::DynamicObject;
use kube::Resource;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("{op} {target} failed: {source}")]
    Cluster {
        op: &'static str,
        target: String,
        #[source]
        source: ClusterError,
    },
    #[error("mutating {target}: {source}")]
    MutationFailed {
        target: ResourceKey,
        #[source]
        source: anyhow::Error,
    },
    #[error("mutation moved {target} to {actual}")]
    MutationRenamed { target: ResourceKey, actual: String },
    #[error("{target} is already controlled by {controller}")]
    AlreadyControlled { target: ResourceKey, controller: String },
}

impl ApplyError {
    fn cluster(op: &'static str, target: impl ToString, source: ClusterError) -> Self {
        ApplyError::Cluster { op, target: target.to_string(), source }
    }

    pub fn cluster_error(&self) -> Option<&ClusterError> {
        match self {
            ApplyError::Cluster { source, .. } => Some(source),
            _ => None,
        }
    }

    /// The kind is not served (e.g. an optional CRD is absent); callers may skip.
    pub fn is_kind_not_registered(&self) -> bool {
        self.cluster_error().map(ClusterError::is_kind_not_registered).unwrap_or(false)
    }

    pub fn is_already_exists(&self) -> bool {
        self.cluster_error().map(ClusterError::is_already_exists).unwrap_or(false)
    }

    pub fn is_conflict(&self) -> bool {
        self.cluster_error().map(ClusterError::is_conflict).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationResult {
    Created,
    Updated,
    Unchanged,
}

/// Build an ownership configuration for a live owner object. The owner must
/// carry `metadata.name` and `metadata.uid`.
pub fn ownership_for<K>(
    owner: &K,
    domain: &str,
    component: &str,
    field_manager: &str,
) -> anyhow::Result<OwnershipConfig>
where
    K: Resource<DynamicType = ()>,
{
    let owner_ref = owner
        .controller_owner_ref(&())
        .ok_or_else(|| anyhow::anyhow!("owner {} is missing metadata.name or metadata.uid", K::kind(&())))?;
    Ok(OwnershipConfig::new(domain, owner_ref, owner.meta().namespace.clone(), component, field_manager)?)
}

/// What a write can change: metadata without the server's bookkeeping and
/// the body without `status`.
fn comparable(obj: &DynamicObject) -> (ObjectMeta, Json) {
    let meta = ObjectMeta {
        managed_fields: None,
        resource_version: None,
        generation: None,
        creation_timestamp: None,
        ..obj.metadata.clone()
    };
    let mut body = obj.data.clone();
    if let Some(fields) = body.as_object_mut() {
        fields.remove("status");
    }
    (meta, body)
}

fn same_content(current: &DynamicObject, desired: &DynamicObject) -> bool {
    comparable(current) == comparable(desired)
}

fn describe(obj: &DynamicObject) -> String {
    let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("<unknown kind>");
    match (&obj.metadata.namespace, &obj.metadata.name) {
        (Some(ns), Some(name)) => format!("{} {}/{}", kind, ns, name),
        (None, Some(name)) => format!("{} {}", kind, name),
        _ => format!("{} <unnamed>", kind),
    }
}

/// Cluster client for a single reconciliation pass.
pub struct TrackingClient {
    api: Arc<dyn ClusterApi>,
    ownership: OwnershipConfig,
    tracked: TrackedSet,
}

impl TrackingClient {
    pub fn new(api: Arc<dyn ClusterApi>, ownership: OwnershipConfig) -> Self {
        Self { api, ownership, tracked: TrackedSet::new() }
    }

    pub fn ownership(&self) -> &OwnershipConfig {
        &self.ownership
    }

    pub fn api(&self) -> &Arc<dyn ClusterApi> {
        &self.api
    }

    async fn locate(&self, op: &'static str, obj: &DynamicObject) -> Result<ResourceKey, ApplyError> {
        resolve_key(self.api.as_ref(), obj)
            .await
            .map(|(_, key)| key)
            .map_err(|e| ApplyError::cluster(op, describe(obj), e))
    }

    fn record(&mut self, op: &'static str, key: ResourceKey) {
        debug!(op, object = %key, owner = %self.ownership.owner_name(), "tracked");
        self.tracked.insert(key);
    }

    /// Stamp the owner/component labels and, where legal, the controller
    /// owner reference.
    pub fn stamp_ownership(&self, obj: &mut DynamicObject, key: &ResourceKey) -> Result<(), ApplyError> {
        let labels = obj.metadata.labels.get_or_insert_with(Default::default);
        labels.extend(self.ownership.labels());

        if !self.ownership.can_own(key.namespace()) {
            debug!(
                object = %key,
                owner = %self.ownership.owner_name(),
                "owner reference not allowed across scopes; labels only"
            );
            return Ok(());
        }
        let ours = self.ownership.owner_ref();
        let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);
        if let Some(other) = refs.iter().find(|r| r.controller == Some(true) && r.uid != ours.uid) {
            return Err(ApplyError::AlreadyControlled {
                target: key.clone(),
                controller: format!("{} {}", other.kind, other.name),
            });
        }
        if !refs.iter().any(|r| r == ours) {
            refs.retain(|r: &OwnerReference| r.uid != ours.uid);
            refs.push(ours.clone());
        }
        Ok(())
    }

    /// Server-side apply `obj` as owned by this pass's owner, forcing field
    /// ownership under the configured field manager.
    pub async fn apply_owned(&mut self, obj: DynamicObject) -> Result<DynamicObject, ApplyError> {
        let t0 = Instant::now();
        match self.write_owned(obj).await {
            Ok((key, applied)) => {
                histogram!("converge_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                counter!("converge_apply_ok", 1u64);
                self.record("apply", key);
                Ok(applied)
            }
            Err(e) => {
                counter!("converge_apply_err", 1u64);
                Err(e)
            }
        }
    }

    async fn write_owned(&self, mut obj: DynamicObject) -> Result<(ResourceKey, DynamicObject), ApplyError> {
        let key = self.locate("apply", &obj).await?;
        self.stamp_ownership(&mut obj, &key)?;
        match self.api.apply(&obj, self.ownership.field_manager()).await {
            Ok(applied) => Ok((key, applied)),
            Err(e) => Err(ApplyError::cluster("apply", key, e)),
        }
    }

    /// Like [`apply_owned`](Self::apply_owned), but a kind the cluster does
    /// not serve is skipped with `Ok(None)` and nothing is tracked.
    pub async fn apply_owned_if_registered(&mut self, obj: DynamicObject) -> Result<Option<DynamicObject>, ApplyError> {
        let what = describe(&obj);
        match self.apply_owned(obj).await {
            Ok(applied) => Ok(Some(applied)),
            Err(e) if e.is_kind_not_registered() => {
                info!(object = %what, "kind not registered; skipping optional resource");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Create `obj`. `AlreadyExists` is returned to the caller, but the key
    /// is still tracked: the object is desired even if this call did not
    /// create it.
    pub async fn create(&mut self, mut obj: DynamicObject) -> Result<DynamicObject, ApplyError> {
        let key = self.locate("create", &obj).await?;
        self.stamp_ownership(&mut obj, &key)?;
        match self.api.create(&obj).await {
            Ok(created) => {
                self.record("create", key);
                Ok(created)
            }
            Err(e) if e.is_already_exists() => {
                self.record("create", key.clone());
                Err(ApplyError::cluster("create", key, e))
            }
            Err(e) => Err(ApplyError::cluster("create", key, e)),
        }
    }

    /// Optimistic-concurrency update; `obj` must carry the resourceVersion it
    /// was read at.
    pub async fn update(&mut self, obj: DynamicObject) -> Result<DynamicObject, ApplyError> {
        let key = self.locate("update", &obj).await?;
        let updated = self.api.replace(&obj).await.map_err(|e| ApplyError::cluster("update", &key, e))?;
        self.record("update", key);
        Ok(updated)
    }

    pub async fn patch(&mut self, key: &ResourceKey, patch: &ObjectPatch) -> Result<DynamicObject, ApplyError> {
        let info = self.api.resolve(&key.gvk).await.map_err(|e| ApplyError::cluster("patch", key, e))?;
        let key = ResourceKey::new(key.gvk.clone(), info.scope, key.namespace(), key.name.clone());
        let patched = self
            .api
            .patch(&key, patch, self.ownership.field_manager())
            .await
            .map_err(|e| ApplyError::cluster("patch", &key, e))?;
        self.record("patch", key);
        Ok(patched)
    }

    /// Fetch the object named by `obj` (or start from `obj` when absent),
    /// run `mutate` on it and persist the result. Unchanged objects are not
    /// written but are still tracked. A failing mutation tracks nothing.
    pub async fn create_or_update<F>(
        &mut self,
        obj: DynamicObject,
        mutate: F,
    ) -> Result<(DynamicObject, OperationResult), ApplyError>
    where
        F: FnOnce(&mut DynamicObject) -> anyhow::Result<()>,
    {
        let key = self.locate("create_or_update", &obj).await?;
        let existing = self.api.get(&key).await.map_err(|e| ApplyError::cluster("get", &key, e))?;

        let mut desired = existing.clone().unwrap_or(obj);
        mutate(&mut desired).map_err(|source| ApplyError::MutationFailed { target: key.clone(), source })?;
        let after = self.locate("create_or_update", &desired).await?;
        if after != key {
            return Err(ApplyError::MutationRenamed { target: key, actual: after.to_string() });
        }
        self.stamp_ownership(&mut desired, &key)?;

        let (out, result) = match existing {
            None => {
                let created = self.api.create(&desired).await.map_err(|e| ApplyError::cluster("create", &key, e))?;
                (created, OperationResult::Created)
            }
            Some(current) if same_content(&current, &desired) => (current, OperationResult::Unchanged),
            Some(_) => {
                let updated = self.api.replace(&desired).await.map_err(|e| ApplyError::cluster("update", &key, e))?;
                (updated, OperationResult::Updated)
            }
        };
        debug!(object = %key, ?result, "create_or_update");
        self.record("create_or_update", key);
        Ok((out, result))
    }

    pub fn is_tracked(&self, key: &ResourceKey) -> bool {
        self.tracked.contains(key)
    }

    /// Sorted snapshot of every key tracked so far.
    pub fn tracked_resources(&self) -> Vec<ResourceKey> {
        self.tracked.to_vec()
    }

    pub fn tracked(&self) -> &TrackedSet {
        &self.tracked
    }

    /// End the pass and hand the tracked set to cleanup.
    pub fn into_tracked(self) -> TrackedSet {
        self.tracked
    }
}
