//! In-memory [`ClusterApi`].
//!
//! Models what the reconciliation engine depends on: kind registration and
//! scope, label-selector listing, resource versions with optimistic
//! concurrency, and the `AlreadyExists`/`NotFound`/`Conflict` conditions.
//! Server-side apply is approximated by a field-level JSON merge, so fields
//! dropped from a later apply are not removed. Failures can be injected per
//! object (delete) or per kind (list).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use converge_core::{DeletePropagation, Gvk, ResourceKey, Scope};
use kube::core::{DynamicObject, TypeMeta};
use serde_json::Value as Json;
use tracing::trace;

use crate::selector::Selector;
use crate::{gvk_of, key_for, ClusterApi, ClusterError, KindInfo, ObjectPatch};

const BUILTIN_KINDS: &[(&str, &str, &str, &str, Scope)] = &[
    ("", "v1", "ConfigMap", "configmaps", Scope::Namespaced),
    ("", "v1", "Secret", "secrets", Scope::Namespaced),
    ("", "v1", "Service", "services", Scope::Namespaced),
    ("", "v1", "ServiceAccount", "serviceaccounts", Scope::Namespaced),
    ("", "v1", "Namespace", "namespaces", Scope::Cluster),
    ("apps", "v1", "Deployment", "deployments", Scope::Namespaced),
    ("apps", "v1", "StatefulSet", "statefulsets", Scope::Namespaced),
    ("rbac.authorization.k8s.io", "v1", "Role", "roles", Scope::Namespaced),
    ("rbac.authorization.k8s.io", "v1", "RoleBinding", "rolebindings", Scope::Namespaced),
    ("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", Scope::Cluster),
    ("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding", "clusterrolebindings", Scope::Cluster),
];

const CONFLICT_MESSAGE: &str =
    "the object has been modified; please apply your changes to the latest version and try again";

#[derive(Default)]
struct State {
    kinds: HashMap<Gvk, KindInfo>,
    objects: BTreeMap<ResourceKey, DynamicObject>,
    revision: u64,
    writes: u64,
    failing_deletes: HashSet<ResourceKey>,
    failing_lists: HashSet<Gvk>,
}

impl State {
    fn resolve(&self, gvk: &Gvk) -> Result<KindInfo, ClusterError> {
        self.kinds.get(gvk).cloned().ok_or_else(|| ClusterError::KindNotRegistered(gvk.clone()))
    }

    fn key_of(&self, obj: &DynamicObject) -> Result<ResourceKey, ClusterError> {
        let info = self.resolve(&gvk_of(obj)?)?;
        key_for(obj, &info)
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn insert_new(&mut self, key: ResourceKey, mut obj: DynamicObject) -> DynamicObject {
        let rev = self.next_revision();
        obj.metadata.namespace = key.namespace().map(str::to_string);
        obj.metadata.uid = Some(format!("00000000-0000-0000-0000-{:012}", rev));
        obj.metadata.resource_version = Some(rev.to_string());
        obj.metadata.managed_fields = None;
        self.writes += 1;
        self.objects.insert(key, obj.clone());
        obj
    }

    /// Store `next` over `current` unless nothing changed; identity fields
    /// always come from `current`.
    fn store_merged(&mut self, key: &ResourceKey, current: &DynamicObject, mut next: DynamicObject) -> DynamicObject {
        next.metadata.name = current.metadata.name.clone();
        next.metadata.namespace = current.metadata.namespace.clone();
        next.metadata.uid = current.metadata.uid.clone();
        next.metadata.resource_version = current.metadata.resource_version.clone();
        next.metadata.managed_fields = None;
        next.types = current.types.clone();
        if object_json(&next) == object_json(current) {
            trace!(object = %key, "no-op write");
            return current.clone();
        }
        next.metadata.resource_version = Some(self.next_revision().to_string());
        self.writes += 1;
        self.objects.insert(key.clone(), next.clone());
        next
    }
}

pub struct MemoryCluster {
    state: Mutex<State>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    /// A cluster serving the common built-in kinds (core, apps, rbac).
    pub fn new() -> Self {
        let me = Self::empty();
        for (group, version, kind, plural, scope) in BUILTIN_KINDS {
            me.register(Gvk::new(*group, *version, *kind), plural, *scope);
        }
        me
    }

    /// A cluster serving no kinds at all.
    pub fn empty() -> Self {
        Self { state: Mutex::new(State::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serve a kind, e.g. a CRD.
    pub fn register(&self, gvk: Gvk, plural: &str, scope: Scope) {
        let info = KindInfo { gvk: gvk.clone(), plural: plural.to_string(), scope };
        self.lock().kinds.insert(gvk, info);
    }

    /// Insert an object as if someone else had created it. Not counted as a write.
    pub fn seed(&self, obj: DynamicObject) -> Result<DynamicObject, ClusterError> {
        let mut st = self.lock();
        let key = st.key_of(&obj)?;
        let stored = st.insert_new(key, obj);
        st.writes -= 1;
        Ok(stored)
    }

    pub fn object(&self, key: &ResourceKey) -> Option<DynamicObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.lock().objects.contains_key(key)
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Mutating calls that changed stored state (creates, changing updates/applies/patches, deletes).
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    /// Make every delete of `key` fail with a server-side rejection.
    pub fn fail_deletes_of(&self, key: ResourceKey) {
        self.lock().failing_deletes.insert(key);
    }

    /// Make every list of `gvk` fail with a server-side rejection.
    pub fn fail_lists_of(&self, gvk: Gvk) {
        self.lock().failing_lists.insert(gvk);
    }
}

fn object_json(obj: &DynamicObject) -> Json {
    serde_json::to_value(obj).unwrap_or(Json::Null)
}

/// RFC 7386 merge: objects merge recursively, `null` removes, anything else replaces.
fn merge_json(target: &mut Json, patch: &Json) {
    match patch {
        Json::Object(patch_map) => {
            if !target.is_object() {
                *target = Json::Object(serde_json::Map::new());
            }
            if let Json::Object(target_map) = target {
                for (k, v) in patch_map {
                    if v.is_null() {
                        target_map.remove(k);
                    } else {
                        merge_json(target_map.entry(k.clone()).or_insert(Json::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn merged(current: &DynamicObject, patch: &Json) -> Result<DynamicObject, ClusterError> {
    let mut doc = serde_json::to_value(current)?;
    merge_json(&mut doc, patch);
    Ok(serde_json::from_value(doc)?)
}

fn apply_patch_body(obj: &DynamicObject) -> Result<Json, ClusterError> {
    let mut body = serde_json::to_value(obj)?;
    if let Some(meta) = body.get_mut("metadata").and_then(Json::as_object_mut) {
        for server_field in ["resourceVersion", "uid", "managedFields", "creationTimestamp", "generation"] {
            meta.remove(server_field);
        }
    }
    Ok(body)
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn resolve(&self, gvk: &Gvk) -> Result<KindInfo, ClusterError> {
        self.lock().resolve(gvk)
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<DynamicObject>, ClusterError> {
        let st = self.lock();
        st.resolve(&key.gvk)?;
        Ok(st.objects.get(key).cloned())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let mut st = self.lock();
        let key = st.key_of(obj)?;
        if st.objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(key));
        }
        Ok(st.insert_new(key, obj.clone()))
    }

    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let mut st = self.lock();
        let key = st.key_of(obj)?;
        let current = st.objects.get(&key).cloned().ok_or_else(|| ClusterError::NotFound(key.clone()))?;
        let rv = obj.metadata.resource_version.as_deref().unwrap_or_default();
        if rv.is_empty() {
            return Err(ClusterError::Invalid(format!("update of {} requires metadata.resourceVersion", key)));
        }
        if Some(rv) != current.metadata.resource_version.as_deref() {
            return Err(ClusterError::Conflict {
                key,
                message: CONFLICT_MESSAGE.into(),
            });
        }
        Ok(st.store_merged(&key, &current, obj.clone()))
    }

    async fn apply(&self, obj: &DynamicObject, field_manager: &str) -> Result<DynamicObject, ClusterError> {
        let mut st = self.lock();
        let key = st.key_of(obj)?;
        trace!(object = %key, %field_manager, "memory apply");
        match st.objects.get(&key).cloned() {
            Some(current) => {
                let next = merged(&current, &apply_patch_body(obj)?)?;
                Ok(st.store_merged(&key, &current, next))
            }
            None => Ok(st.insert_new(key, obj.clone())),
        }
    }

    async fn patch(
        &self,
        key: &ResourceKey,
        patch: &ObjectPatch,
        field_manager: &str,
    ) -> Result<DynamicObject, ClusterError> {
        let mut st = self.lock();
        st.resolve(&key.gvk)?;
        trace!(object = %key, %field_manager, "memory patch");
        let body = match patch {
            ObjectPatch::Merge(b) | ObjectPatch::Strategic(b) | ObjectPatch::Apply(b) => b,
        };
        if !body.is_object() {
            return Err(ClusterError::Invalid(format!("patch body for {} must be an object", key)));
        }
        match (st.objects.get(key).cloned(), patch) {
            (Some(current), _) => {
                let next = merged(&current, body)?;
                Ok(st.store_merged(key, &current, next))
            }
            (None, ObjectPatch::Apply(_)) => {
                let mut obj: DynamicObject = serde_json::from_value(body.clone())?;
                obj.types = Some(TypeMeta { api_version: key.gvk.api_version(), kind: key.gvk.kind.clone() });
                obj.metadata.name = Some(key.name.clone());
                Ok(st.insert_new(key.clone(), obj))
            }
            (None, _) => Err(ClusterError::NotFound(key.clone())),
        }
    }

    async fn list(
        &self,
        gvk: &Gvk,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let st = self.lock();
        let info = st.resolve(gvk)?;
        if st.failing_lists.contains(gvk) {
            return Err(ClusterError::Rejected {
                op: "list",
                target: gvk.to_string(),
                message: "injected failure".into(),
            });
        }
        let selector = Selector::parse(label_selector)?;
        let empty = BTreeMap::new();
        Ok(st
            .objects
            .iter()
            .filter(|(k, _)| &k.gvk == gvk)
            .filter(|(k, _)| match (info.scope, namespace) {
                (Scope::Namespaced, Some(ns)) => k.namespace == ns,
                _ => true,
            })
            .filter(|(_, o)| selector.matches(o.metadata.labels.as_ref().unwrap_or(&empty)))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn delete(&self, key: &ResourceKey, propagation: DeletePropagation) -> Result<(), ClusterError> {
        let mut st = self.lock();
        st.resolve(&key.gvk)?;
        if st.failing_deletes.contains(key) {
            return Err(ClusterError::Rejected {
                op: "delete",
                target: key.to_string(),
                message: "injected failure".into(),
            });
        }
        trace!(object = %key, policy = propagation.as_str(), "memory delete");
        match st.objects.remove(key) {
            Some(_) => {
                st.writes += 1;
                Ok(())
            }
            None => Err(ClusterError::NotFound(key.clone())),
        }
    }
}
