//! Converge prune: delete owned objects that the current pass no longer wants.
//!
//! Cleanup only looks at the kinds it is given and only at objects carrying
//! the owner label. Anything tracked in the pass survives. Cluster-scoped
//! kinds are never deleted unless explicitly allow-listed: a label is not
//! proof of ownership for a global object.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use converge_core::{label_selector, DeletePropagation, Gvk, OwnershipConfig, ResourceKey, Settings, TrackedSet};
use converge_kubehub::{key_for, ClusterApi};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Cluster-scoped kinds cleanup may delete. Matches on group and kind, so
/// any served version of an allowed kind is allowed. Empty by default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterScopedAllowList(BTreeSet<(String, String)>);

impl ClusterScopedAllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, gvk: &Gvk) -> Self {
        self.0.insert((gvk.group.clone(), gvk.kind.clone()));
        self
    }

    pub fn permits(&self, gvk: &Gvk) -> bool {
        self.0.contains(&(gvk.group.clone(), gvk.kind.clone()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> FromIterator<&'a Gvk> for ClusterScopedAllowList {
    fn from_iter<I: IntoIterator<Item = &'a Gvk>>(iter: I) -> Self {
        iter.into_iter().fold(Self::new(), |acc, g| acc.allow(g))
    }
}

/// Outcome of one cleanup run, for logging and tests. Failures are reported
/// here and never returned as errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub deleted: Vec<ResourceKey>,
    /// Owned and tracked.
    pub kept: usize,
    /// Untracked cluster-scoped objects of kinds not in the allow-list.
    pub protected: Vec<ResourceKey>,
    /// Would have been deleted (dry-run only).
    pub candidates: Vec<ResourceKey>,
    pub failed: Vec<(ResourceKey, String)>,
    /// Kinds the cluster does not serve or that could not be listed.
    pub skipped_kinds: Vec<Gvk>,
}

pub struct OrphanCleanup<'a> {
    api: &'a dyn ClusterApi,
    owner_label: String,
    owner_value: String,
    kinds: Vec<Gvk>,
    allow: ClusterScopedAllowList,
    namespace: Option<String>,
    dry_run: bool,
    propagation: DeletePropagation,
}

impl<'a> OrphanCleanup<'a> {
    pub fn new(api: &'a dyn ClusterApi, owner_label: &str, owner_value: &str, kinds: Vec<Gvk>) -> Self {
        Self {
            api,
            owner_label: owner_label.to_string(),
            owner_value: owner_value.to_string(),
            kinds,
            allow: ClusterScopedAllowList::default(),
            namespace: None,
            dry_run: false,
            propagation: DeletePropagation::Background,
        }
    }

    /// Owner label and value taken from the same configuration the pass applied with.
    pub fn for_ownership(api: &'a dyn ClusterApi, ownership: &OwnershipConfig, kinds: Vec<Gvk>) -> Self {
        Self::new(api, ownership.owner_label(), ownership.owner_name(), kinds)
    }

    pub fn allow_cluster_scoped(mut self, allow: ClusterScopedAllowList) -> Self {
        self.allow = allow;
        self
    }

    /// Only consider namespaced objects in `namespace`. Cluster-scoped kinds
    /// are unaffected.
    pub fn within_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn propagation(mut self, propagation: DeletePropagation) -> Self {
        self.propagation = propagation;
        self
    }

    /// Take dry-run and propagation from environment settings.
    pub fn with_settings(self, settings: &Settings) -> Self {
        self.dry_run(settings.prune_dry_run).propagation(settings.propagation)
    }

    /// Run after every desired object of the pass has been written.
    pub async fn run(&self, tracked: &TrackedSet) -> CleanupReport {
        let mut report = CleanupReport::default();
        if self.owner_value.is_empty() {
            warn!(label = %self.owner_label, "empty owner value; refusing to clean up");
            return report;
        }
        let selector = label_selector(&self.owner_label, &self.owner_value);
        for gvk in &self.kinds {
            self.cleanup_kind(gvk, &selector, tracked, &mut report).await;
        }
        info!(
            owner = %self.owner_value,
            deleted = report.deleted.len(),
            kept = report.kept,
            protected = report.protected.len(),
            failed = report.failed.len(),
            dry_run = self.dry_run,
            "orphan cleanup finished"
        );
        report
    }

    async fn cleanup_kind(&self, gvk: &Gvk, selector: &str, tracked: &TrackedSet, report: &mut CleanupReport) {
        let info = match self.api.resolve(gvk).await {
            Ok(info) => info,
            Err(e) if e.is_kind_not_registered() => {
                debug!(gvk = %gvk, "kind not registered; nothing to clean up");
                report.skipped_kinds.push(gvk.clone());
                return;
            }
            Err(e) => {
                warn!(gvk = %gvk, error = %e, "resolving kind failed; skipping");
                report.skipped_kinds.push(gvk.clone());
                return;
            }
        };
        let objects = match self.api.list(gvk, self.namespace.as_deref(), selector).await {
            Ok(list) => list,
            Err(e) => {
                warn!(gvk = %gvk, %selector, error = %e, "listing owned objects failed; skipping kind");
                report.skipped_kinds.push(gvk.clone());
                return;
            }
        };
        debug!(gvk = %gvk, count = objects.len(), "listed owned objects");

        for obj in objects {
            let owned = obj
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(&self.owner_label))
                .map(|v| v == &self.owner_value)
                .unwrap_or(false);
            if !owned {
                continue;
            }
            let key = match key_for(&obj, &info) {
                Ok(key) => key,
                Err(e) => {
                    warn!(gvk = %gvk, error = %e, "listed object has no usable key; skipping");
                    continue;
                }
            };
            if tracked.contains(&key) {
                report.kept += 1;
                continue;
            }
            if key.is_cluster_scoped() && !self.allow.permits(gvk) {
                info!(object = %key, "untracked cluster-scoped object not in allow-list; leaving it");
                counter!("converge_prune_protected", 1u64);
                report.protected.push(key);
                continue;
            }
            if self.dry_run {
                info!(object = %key, "dry-run: would delete orphan");
                report.candidates.push(key);
                continue;
            }
            match self.api.delete(&key, self.propagation).await {
                Ok(()) => {
                    info!(object = %key, "deleted orphan");
                    counter!("converge_prune_deleted", 1u64);
                    report.deleted.push(key);
                }
                Err(e) if e.is_not_found() => {
                    debug!(object = %key, "orphan already gone");
                    report.deleted.push(key);
                }
                Err(e) => {
                    warn!(object = %key, error = %e, "deleting orphan failed; will retry next pass");
                    counter!("converge_prune_failed", 1u64);
                    report.failed.push((key, e.to_string()));
                }
            }
        }
    }
}

/// Delete objects of `kinds` labelled `owner_label=owner_value` that are not
/// in `tracked`. Cluster-scoped objects are only deleted when their kind is in
/// `allow`.
pub async fn cleanup_orphans(
    api: &dyn ClusterApi,
    tracked: &TrackedSet,
    owner_label: &str,
    owner_value: &str,
    kinds: Vec<Gvk>,
    allow: ClusterScopedAllowList,
) -> CleanupReport {
    OrphanCleanup::new(api, owner_label, owner_value, kinds)
        .allow_cluster_scoped(allow)
        .run(tracked)
        .await
}
