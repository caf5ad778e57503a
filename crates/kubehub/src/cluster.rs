//! Live-cluster implementation over kube-rs.

use async_trait::async_trait;
use converge_core::{DeletePropagation, Gvk, ResourceKey, Scope};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery, Client,
};
use tracing::{debug, trace};

use crate::{gvk_of, key_for, kube_gvk, ClusterApi, ClusterError, KindInfo, ObjectPatch};

/// [`ClusterApi`] backed by a kube [`Client`]. Kinds are resolved with a
/// pinned discovery call per operation; nothing is cached between calls.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> Result<Self, kube::Error> {
        Ok(Self::new(Client::try_default().await?))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn find_api_resource(&self, gvk: &Gvk) -> Result<(ApiResource, Scope), ClusterError> {
        let (ar, caps) = discovery::pinned_kind(&self.client, &kube_gvk(gvk))
            .await
            .map_err(|e| ClusterError::from_discovery(gvk, e))?;
        let scope = match caps.scope {
            discovery::Scope::Namespaced => Scope::Namespaced,
            discovery::Scope::Cluster => Scope::Cluster,
        };
        trace!(gvk = %gvk, plural = %ar.plural, ?scope, "resolved kind");
        Ok((ar, scope))
    }

    fn api(&self, ar: &ApiResource, scope: Scope, namespace: Option<&str>) -> Api<DynamicObject> {
        match (scope, namespace) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, ar),
            _ => Api::all_with(self.client.clone(), ar),
        }
    }

    async fn api_for_key(&self, key: &ResourceKey) -> Result<Api<DynamicObject>, ClusterError> {
        let (ar, scope) = self.find_api_resource(&key.gvk).await?;
        Ok(self.api(&ar, scope, key.namespace()))
    }

    async fn api_for_object(&self, obj: &DynamicObject) -> Result<(Api<DynamicObject>, ResourceKey), ClusterError> {
        let gvk = gvk_of(obj)?;
        let (ar, scope) = self.find_api_resource(&gvk).await?;
        let info = KindInfo { gvk, plural: ar.plural.clone(), scope };
        let key = key_for(obj, &info)?;
        Ok((self.api(&ar, scope, key.namespace()), key))
    }
}

/// Server-populated metadata must not be sent back in an apply body.
fn apply_body(obj: &DynamicObject) -> DynamicObject {
    let mut body = obj.clone();
    body.metadata.managed_fields = None;
    body.metadata.resource_version = None;
    body.metadata.uid = None;
    body.metadata.creation_timestamp = None;
    body.metadata.generation = None;
    body
}

fn delete_params(propagation: DeletePropagation) -> DeleteParams {
    match propagation {
        DeletePropagation::Background => DeleteParams::background(),
        DeletePropagation::Foreground => DeleteParams::foreground(),
        DeletePropagation::Orphan => DeleteParams::orphan(),
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn resolve(&self, gvk: &Gvk) -> Result<KindInfo, ClusterError> {
        let (ar, scope) = self.find_api_resource(gvk).await?;
        Ok(KindInfo { gvk: gvk.clone(), plural: ar.plural, scope })
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<DynamicObject>, ClusterError> {
        let api = self.api_for_key(key).await?;
        api.get_opt(&key.name).await.map_err(|e| ClusterError::from_kube("get", key, e))
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let (api, key) = self.api_for_object(obj).await?;
        debug!(object = %key, "create");
        api.create(&PostParams::default(), obj).await.map_err(|e| ClusterError::from_kube("create", &key, e))
    }

    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let (api, key) = self.api_for_object(obj).await?;
        if obj.metadata.resource_version.as_deref().unwrap_or_default().is_empty() {
            return Err(ClusterError::Invalid(format!("update of {} requires metadata.resourceVersion", key)));
        }
        debug!(object = %key, "replace");
        api.replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| ClusterError::from_kube("update", &key, e))
    }

    async fn apply(&self, obj: &DynamicObject, field_manager: &str) -> Result<DynamicObject, ClusterError> {
        let (api, key) = self.api_for_object(obj).await?;
        debug!(object = %key, %field_manager, "server-side apply");
        let pp = PatchParams::apply(field_manager).force();
        api.patch(&key.name, &pp, &Patch::Apply(&apply_body(obj)))
            .await
            .map_err(|e| ClusterError::from_kube("apply", &key, e))
    }

    async fn patch(
        &self,
        key: &ResourceKey,
        patch: &ObjectPatch,
        field_manager: &str,
    ) -> Result<DynamicObject, ClusterError> {
        let api = self.api_for_key(key).await?;
        let res = match patch {
            ObjectPatch::Merge(body) => {
                let pp = PatchParams { field_manager: Some(field_manager.to_string()), ..Default::default() };
                api.patch(&key.name, &pp, &Patch::Merge(body)).await
            }
            ObjectPatch::Strategic(body) => {
                let pp = PatchParams { field_manager: Some(field_manager.to_string()), ..Default::default() };
                api.patch(&key.name, &pp, &Patch::Strategic(body)).await
            }
            ObjectPatch::Apply(body) => {
                let pp = PatchParams::apply(field_manager).force();
                api.patch(&key.name, &pp, &Patch::Apply(body)).await
            }
        };
        res.map_err(|e| ClusterError::from_kube("patch", key, e))
    }

    async fn list(
        &self,
        gvk: &Gvk,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let (ar, scope) = self.find_api_resource(gvk).await?;
        let api = self.api(&ar, scope, namespace);
        let lp = ListParams::default().labels(label_selector);
        let list = api.list(&lp).await.map_err(|e| ClusterError::Api {
            op: "list",
            target: format!("{} ({})", gvk, label_selector),
            source: e,
        })?;
        // List responses omit per-item apiVersion/kind.
        Ok(list
            .items
            .into_iter()
            .map(|mut o| {
                if o.types.is_none() {
                    o.types = Some(kube::core::TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
                }
                o
            })
            .collect())
    }

    async fn delete(&self, key: &ResourceKey, propagation: DeletePropagation) -> Result<(), ClusterError> {
        let api = self.api_for_key(key).await?;
        debug!(object = %key, policy = propagation.as_str(), "delete");
        api.delete(&key.name, &delete_params(propagation))
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::from_kube("delete", key, e))
    }
}
