//! Type identifiers and resource keys.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Group/Version/Kind. The core API group is the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Split an `apiVersion` (`v1` or `apps/v1`) and pair it with `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Result<Self, CoreError> {
        if api_version.is_empty() || kind.is_empty() {
            return Err(CoreError::InvalidGvk(format!("{}/{}", api_version, kind)));
        }
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        if version.is_empty() || version.contains('/') {
            return Err(CoreError::InvalidGvk(format!("{}/{}", api_version, kind)));
        }
        Ok(Self::new(group, version, kind))
    }

    /// Parse the short form used in configuration: `v1/Kind` or `group/v1/Kind`.
    pub fn parse_key(key: &str) -> Result<Self, CoreError> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", *version, *kind)),
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(*group, *version, *kind))
            }
            _ => Err(CoreError::InvalidGvk(key.to_string())),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Namespaced,
    Cluster,
}

/// Identifies one cluster object. `namespace` is empty exactly for cluster-scoped kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub gvk: Gvk,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    /// Build a key through the kind's scope; any namespace given for a
    /// cluster-scoped kind is dropped.
    pub fn new(gvk: Gvk, scope: Scope, namespace: Option<&str>, name: impl Into<String>) -> Self {
        let namespace = match scope {
            Scope::Namespaced => namespace.unwrap_or_default().to_string(),
            Scope::Cluster => String::new(),
        };
        Self { gvk, namespace, name: name.into() }
    }

    pub fn namespaced(gvk: Gvk, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { gvk, namespace: namespace.into(), name: name.into() }
    }

    pub fn cluster(gvk: Gvk, name: impl Into<String>) -> Self {
        Self { gvk, namespace: String::new(), name: name.into() }
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }

    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() { None } else { Some(&self.namespace) }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}", self.gvk, self.name)
        } else {
            write!(f, "{} {}/{}", self.gvk, self.namespace, self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_round_trips_core_and_named_groups() {
        let core = Gvk::from_api_version("v1", "ConfigMap").unwrap();
        assert_eq!(core.group, "");
        assert_eq!(core.api_version(), "v1");
        assert_eq!(core.key(), "v1/ConfigMap");

        let apps = Gvk::from_api_version("apps/v1", "Deployment").unwrap();
        assert_eq!(apps.group, "apps");
        assert_eq!(apps.api_version(), "apps/v1");
        assert_eq!(apps.to_string(), "apps/v1/Deployment");
    }

    #[test]
    fn malformed_api_versions_are_rejected() {
        assert!(Gvk::from_api_version("", "ConfigMap").is_err());
        assert!(Gvk::from_api_version("apps/", "Deployment").is_err());
        assert!(Gvk::from_api_version("a/b/c", "Thing").is_err());
        assert!(Gvk::from_api_version("v1", "").is_err());
    }

    #[test]
    fn parse_key_accepts_short_forms() {
        assert_eq!(Gvk::parse_key("v1/Secret").unwrap(), Gvk::new("", "v1", "Secret"));
        assert_eq!(
            Gvk::parse_key("rbac.authorization.k8s.io/v1/ClusterRole").unwrap(),
            Gvk::new("rbac.authorization.k8s.io", "v1", "ClusterRole")
        );
        let err = Gvk::parse_key("Secret").unwrap_err();
        assert!(err.to_string().contains("invalid gvk key"));
    }

    #[test]
    fn keys_compare_on_all_components() {
        let cm = Gvk::new("", "v1", "ConfigMap");
        let a = ResourceKey::namespaced(cm.clone(), "ns", "x");
        let b = ResourceKey::namespaced(cm.clone(), "ns", "x");
        let other_ns = ResourceKey::namespaced(cm.clone(), "other", "x");
        let other_kind = ResourceKey::namespaced(Gvk::new("", "v1", "Secret"), "ns", "x");
        assert_eq!(a, b);
        assert_ne!(a, other_ns);
        assert_ne!(a, other_kind);
    }

    #[test]
    fn cluster_scope_drops_namespace() {
        let cr = Gvk::new("rbac.authorization.k8s.io", "v1", "ClusterRole");
        let k = ResourceKey::new(cr.clone(), Scope::Cluster, Some("ns"), "reader");
        assert!(k.is_cluster_scoped());
        assert_eq!(k.namespace(), None);
        assert_eq!(k, ResourceKey::cluster(cr, "reader"));
        assert_eq!(k.to_string(), "rbac.authorization.k8s.io/v1/ClusterRole reader");
    }
}
