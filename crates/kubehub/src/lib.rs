//! Converge kubehub: the cluster API boundary.
//!
//! [`ClusterApi`] is the narrow set of calls the reconciliation engine makes.
//! [`KubeCluster`] speaks to a live cluster through kube-rs; [`MemoryCluster`]
//! keeps objects in memory for tests and embedders.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use converge_core::{DeletePropagation, Gvk, ResourceKey, Scope};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::Resource;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

mod cluster;
mod error;
pub mod memory;
pub mod selector;

pub use cluster::KubeCluster;
pub use error::ClusterError;
pub use memory::MemoryCluster;

/// What the cluster knows about a kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindInfo {
    pub gvk: Gvk,
    pub plural: String,
    pub scope: Scope,
}

impl KindInfo {
    pub fn namespaced(&self) -> bool {
        self.scope == Scope::Namespaced
    }
}

/// Patch flavours accepted by [`ClusterApi::patch`].
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectPatch {
    /// RFC 7386 JSON merge patch.
    Merge(Json),
    /// Strategic merge patch (built-in kinds only on a live cluster).
    Strategic(Json),
    /// Server-side apply of a partial object; always forces field ownership.
    Apply(Json),
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Resolve a kind to its plural and scope. Fails with
    /// [`ClusterError::KindNotRegistered`] when the cluster does not serve it.
    async fn resolve(&self, gvk: &Gvk) -> Result<KindInfo, ClusterError>;

    async fn get(&self, key: &ResourceKey) -> Result<Option<DynamicObject>, ClusterError>;

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError>;

    /// Optimistic-concurrency update; `metadata.resourceVersion` must be set.
    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError>;

    /// Server-side apply with `field_manager`, forcing ownership of conflicting fields.
    async fn apply(&self, obj: &DynamicObject, field_manager: &str) -> Result<DynamicObject, ClusterError>;

    async fn patch(
        &self,
        key: &ResourceKey,
        patch: &ObjectPatch,
        field_manager: &str,
    ) -> Result<DynamicObject, ClusterError>;

    /// List objects of `gvk` matching `label_selector`. `namespace` narrows
    /// namespaced kinds; `None` lists across all namespaces.
    async fn list(
        &self,
        gvk: &Gvk,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, ClusterError>;

    async fn delete(&self, key: &ResourceKey, propagation: DeletePropagation) -> Result<(), ClusterError>;
}

/// Read the type identifier from an object's `apiVersion`/`kind`.
pub fn gvk_of(obj: &DynamicObject) -> Result<Gvk, ClusterError> {
    let types = obj
        .types
        .as_ref()
        .ok_or_else(|| ClusterError::Invalid("object missing apiVersion/kind".into()))?;
    Ok(Gvk::from_api_version(&types.api_version, &types.kind)?)
}

/// Key an object through its kind's scope. Namespaced objects must carry a namespace.
pub fn key_for(obj: &DynamicObject, info: &KindInfo) -> Result<ResourceKey, ClusterError> {
    let name = obj
        .metadata
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ClusterError::Invalid(format!("{} object missing metadata.name", info.gvk)))?;
    let ns = obj.metadata.namespace.as_deref().filter(|n| !n.is_empty());
    if info.namespaced() && ns.is_none() {
        return Err(ClusterError::Invalid(format!("namespace required for namespaced kind {} ({})", info.gvk, name)));
    }
    Ok(ResourceKey::new(info.gvk.clone(), info.scope, ns, name))
}

/// Resolve an object's kind and key in one step.
pub async fn resolve_key(api: &dyn ClusterApi, obj: &DynamicObject) -> Result<(KindInfo, ResourceKey), ClusterError> {
    let gvk = gvk_of(obj)?;
    let info = api.resolve(&gvk).await?;
    let key = key_for(obj, &info)?;
    Ok((info, key))
}

/// Convert a typed object (e.g. a `k8s_openapi` ConfigMap) into a [`DynamicObject`].
pub fn to_dynamic<K>(obj: &K) -> Result<DynamicObject, ClusterError>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let mut raw = serde_json::to_value(obj)?;
    if let Some(map) = raw.as_object_mut() {
        map.insert("apiVersion".into(), Json::String(K::api_version(&()).into_owned()));
        map.insert("kind".into(), Json::String(K::kind(&()).into_owned()));
    }
    Ok(serde_json::from_value(raw)?)
}

/// Convert a [`DynamicObject`] back into a typed object.
pub fn from_dynamic<K>(obj: &DynamicObject) -> Result<K, ClusterError>
where
    K: for<'de> Deserialize<'de>,
{
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub fn kube_gvk(gvk: &Gvk) -> GroupVersionKind {
    GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn cm_info() -> KindInfo {
        KindInfo { gvk: Gvk::new("", "v1", "ConfigMap"), plural: "configmaps".into(), scope: Scope::Namespaced }
    }

    #[test]
    fn typed_objects_convert_with_type_meta() {
        let cm = ConfigMap {
            metadata: ObjectMeta { name: Some("cm-1".into()), namespace: Some("ns".into()), ..Default::default() },
            data: Some(BTreeMap::from([("k".to_string(), "v".to_string())])),
            ..Default::default()
        };
        let dynamic = to_dynamic(&cm).unwrap();
        assert_eq!(gvk_of(&dynamic).unwrap(), Gvk::new("", "v1", "ConfigMap"));
        assert_eq!(dynamic.data["data"]["k"], "v");

        let back: ConfigMap = from_dynamic(&dynamic).unwrap();
        assert_eq!(back, cm);
    }

    #[test]
    fn key_for_requires_name_and_namespace() {
        let mut obj = DynamicObject::new("x", &kube::core::ApiResource::erase::<ConfigMap>(&()));
        assert!(matches!(key_for(&obj, &cm_info()), Err(ClusterError::Invalid(_))));
        obj.metadata.namespace = Some("ns".into());
        let key = key_for(&obj, &cm_info()).unwrap();
        assert_eq!(key, ResourceKey::namespaced(Gvk::new("", "v1", "ConfigMap"), "ns", "x"));

        obj.metadata.name = Some(String::new());
        assert!(key_for(&obj, &cm_info()).is_err());
    }

    #[test]
    fn cluster_scoped_keys_ignore_stray_namespace() {
        let info = KindInfo {
            gvk: Gvk::new("rbac.authorization.k8s.io", "v1", "ClusterRole"),
            plural: "clusterroles".into(),
            scope: Scope::Cluster,
        };
        let mut obj = DynamicObject::new("reader", &kube::core::ApiResource::from_gvk(&kube_gvk(&info.gvk)));
        obj.metadata.namespace = Some("leaked".into());
        let key = key_for(&obj, &info).unwrap();
        assert!(key.is_cluster_scoped());
    }

    #[test]
    fn objects_without_type_meta_are_invalid() {
        let mut obj = DynamicObject::new("x", &kube::core::ApiResource::erase::<ConfigMap>(&()));
        obj.types = None;
        assert!(matches!(gvk_of(&obj), Err(ClusterError::Invalid(_))));
    }
}
