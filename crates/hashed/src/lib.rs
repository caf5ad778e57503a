//! Converge hashed: configuration objects named after their content.
//!
//! A [`HashedObjectManager`] writes a ConfigMap or Secret called
//! `<base>-<hash>`, where the hash is derived from the payload bytes. Anything
//! that mounts the object by name sees a new name whenever the content
//! changes, which forces a rollout. Superseded generations are pruned after
//! each apply.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use converge_core::{label_selector, DeletePropagation, Gvk, ResourceKey, Settings, MANAGED_TRUE};
use converge_core::settings::{clamp_hash_len, MAX_HASH_LEN, MIN_HASH_LEN};
use converge_kubehub::{to_dynamic, ClusterApi, ClusterError};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::core::DynamicObject;
use metrics::counter;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Longest object name the API server accepts (DNS subdomain).
const MAX_NAME_LEN: usize = 253;

#[derive(Debug, Error)]
pub enum HashedError {
    #[error("invalid base name {name:?}: {reason}")]
    InvalidBaseName { name: String, reason: &'static str },
    #[error("invalid marker label: {0}")]
    InvalidMarker(String),
    #[error("field manager must not be empty")]
    EmptyFieldManager,
    #[error("{op} {name} failed: {source}")]
    Cluster {
        op: &'static str,
        name: String,
        #[source]
        source: ClusterError,
    },
}

impl HashedError {
    pub fn cluster_error(&self) -> Option<&ClusterError> {
        match self {
            HashedError::Cluster { source, .. } => Some(source),
            _ => None,
        }
    }

    /// The payload kind is not served by the cluster.
    pub fn is_kind_not_registered(&self) -> bool {
        self.cluster_error().map(ClusterError::is_kind_not_registered).unwrap_or(false)
    }
}

/// Which kind carries the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadKind {
    #[default]
    ConfigMap,
    Secret,
}

impl PayloadKind {
    pub fn gvk(self) -> Gvk {
        match self {
            PayloadKind::ConfigMap => Gvk::new("", "v1", "ConfigMap"),
            PayloadKind::Secret => Gvk::new("", "v1", "Secret"),
        }
    }
}

/// Lowercase hex SHA-256 of `content`, truncated to `len` characters
/// (clamped to 4..=64).
pub fn content_hash(content: &[u8], len: usize) -> String {
    let mut digest = hex::encode(Sha256::digest(content));
    digest.truncate(clamp_hash_len(len));
    digest
}

pub fn hashed_name(base: &str, hash: &str) -> String {
    format!("{}-{}", base, hash)
}

/// Whether `name` is `<base>-` followed by a lowercase hex suffix of any
/// length a hash may have been cut to, so generations written under an
/// earlier hash length still match. Objects of a different base sharing
/// the prefix (e.g. `<base>-extra-<hash>`) never match.
pub fn is_generation_of(name: &str, base: &str) -> bool {
    let Some(suffix) = name.strip_prefix(base).and_then(|rest| rest.strip_prefix('-')) else {
        return false;
    };
    (MIN_HASH_LEN..=MAX_HASH_LEN).contains(&suffix.len())
        && suffix.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

pub struct HashedObjectManager {
    api: Arc<dyn ClusterApi>,
    base_name: String,
    namespace: String,
    data_key: String,
    marker_label: String,
    field_manager: String,
    hash_len: usize,
    kind: PayloadKind,
    propagation: DeletePropagation,
}

impl HashedObjectManager {
    /// A ConfigMap manager with the default hash length. `marker_label` is the
    /// label key set to `"true"` on every generation.
    pub fn new(
        api: Arc<dyn ClusterApi>,
        base_name: &str,
        namespace: &str,
        data_key: &str,
        marker_label: &str,
        field_manager: &str,
    ) -> Result<Self, HashedError> {
        let settings = Settings::default();
        let me = Self {
            api,
            base_name: base_name.to_string(),
            namespace: namespace.to_string(),
            data_key: data_key.to_string(),
            marker_label: marker_label.to_string(),
            field_manager: field_manager.to_string(),
            hash_len: settings.hash_len,
            kind: PayloadKind::ConfigMap,
            propagation: settings.propagation,
        };
        me.validate()?;
        Ok(me)
    }

    fn validate(&self) -> Result<(), HashedError> {
        let bad = |reason| Err(HashedError::InvalidBaseName { name: self.base_name.clone(), reason });
        if self.base_name.is_empty() {
            return bad("must not be empty");
        }
        if self.base_name.len() + 1 + self.hash_len > MAX_NAME_LEN {
            return bad("too long once the hash suffix is added");
        }
        if !self.base_name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.') {
            return bad("only lowercase alphanumerics, '-' and '.' are allowed");
        }
        if self.marker_label.is_empty() {
            return Err(HashedError::InvalidMarker("label key must not be empty".into()));
        }
        if self.field_manager.is_empty() {
            return Err(HashedError::EmptyFieldManager);
        }
        Ok(())
    }

    pub fn secret(mut self) -> Self {
        self.kind = PayloadKind::Secret;
        self
    }

    pub fn hash_len(mut self, len: usize) -> Result<Self, HashedError> {
        self.hash_len = clamp_hash_len(len);
        self.validate()?;
        Ok(self)
    }

    /// Take hash length and delete propagation from environment settings.
    pub fn with_settings(mut self, settings: &Settings) -> Result<Self, HashedError> {
        self.propagation = settings.propagation;
        self.hash_len(settings.hash_len)
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    /// The name `apply` will use for `content`.
    pub fn name_for(&self, content: &[u8]) -> String {
        hashed_name(&self.base_name, &content_hash(content, self.hash_len))
    }

    fn desired(&self, name: &str, content: &[u8], owner: &OwnerReference) -> Result<DynamicObject, ClusterError> {
        let metadata = ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(BTreeMap::from([(self.marker_label.clone(), MANAGED_TRUE.to_string())])),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        };
        match self.kind {
            PayloadKind::ConfigMap => {
                let mut cm = ConfigMap { metadata, ..Default::default() };
                match std::str::from_utf8(content) {
                    Ok(text) => cm.data = Some(BTreeMap::from([(self.data_key.clone(), text.to_string())])),
                    Err(_) => {
                        cm.binary_data = Some(BTreeMap::from([(self.data_key.clone(), ByteString(content.to_vec()))]))
                    }
                }
                to_dynamic(&cm)
            }
            PayloadKind::Secret => {
                let secret = Secret {
                    metadata,
                    data: Some(BTreeMap::from([(self.data_key.clone(), ByteString(content.to_vec()))])),
                    ..Default::default()
                };
                to_dynamic(&secret)
            }
        }
    }

    /// Write the current generation for `content`, then prune older ones.
    /// Only the write can fail; pruning problems are logged and retried on
    /// the next call.
    pub async fn apply(&self, content: &[u8], owner: &OwnerReference) -> Result<(String, DynamicObject), HashedError> {
        let name = self.name_for(content);
        let obj = self
            .desired(&name, content, owner)
            .map_err(|source| HashedError::Cluster { op: "build", name: name.clone(), source })?;
        let applied = self
            .api
            .apply(&obj, &self.field_manager)
            .await
            .map_err(|source| HashedError::Cluster { op: "apply", name: name.clone(), source })?;
        debug!(ns = %self.namespace, %name, kind = ?self.kind, "applied hashed object");

        let pruned = self.cleanup_old(&name).await;
        if pruned > 0 {
            counter!("converge_hashed_rotations", 1u64);
            info!(ns = %self.namespace, base = %self.base_name, current = %name, pruned, "rotated hashed object");
        }
        Ok((name, applied))
    }

    /// Delete marked generations of this base other than `current`. Returns
    /// how many were removed; failures are logged, never returned.
    pub async fn cleanup_old(&self, current: &str) -> usize {
        let gvk = self.kind.gvk();
        let selector = label_selector(&self.marker_label, MANAGED_TRUE);
        let siblings = match self.api.list(&gvk, Some(&self.namespace), &selector).await {
            Ok(list) => list,
            Err(e) => {
                warn!(ns = %self.namespace, base = %self.base_name, error = %e, "listing old generations failed");
                return 0;
            }
        };
        let mut removed = 0;
        for obj in siblings {
            let Some(name) = obj.metadata.name.as_deref() else { continue };
            if name == current || !is_generation_of(name, &self.base_name) {
                continue;
            }
            let key = ResourceKey::namespaced(gvk.clone(), self.namespace.clone(), name);
            match self.api.delete(&key, self.propagation).await {
                Ok(()) => {
                    debug!(object = %key, "deleted old generation");
                    removed += 1;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(object = %key, error = %e, "deleting old generation failed; will retry"),
            }
        }
        removed
    }
}
