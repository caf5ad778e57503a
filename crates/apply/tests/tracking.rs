#![forbid(unsafe_code)]

use std::sync::Arc;

use converge_apply::{ownership_for, ApplyError, OperationResult, TrackingClient};
use converge_core::{Gvk, ResourceKey};
use converge_kubehub::{ClusterApi, MemoryCluster, ObjectPatch};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::rbac::v1::ClusterRole;
use kube::api::ObjectMeta;
use kube::core::{ApiResource, DynamicObject};
use serde_json::json;

fn owner() -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some("svc-a".into()),
            namespace: Some("apps".into()),
            uid: Some("11111111-2222-3333-4444-555555555555".into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn client(cluster: &Arc<MemoryCluster>) -> TrackingClient {
    let cfg = ownership_for(&owner(), "example.io", "gateway", "converge-test").unwrap();
    TrackingClient::new(cluster.clone(), cfg)
}

fn cm(name: &str, data: serde_json::Value) -> DynamicObject {
    let mut o = DynamicObject::new(name, &ApiResource::erase::<ConfigMap>(&())).within("apps");
    o.data = json!({ "data": data });
    o
}

fn cm_key(name: &str) -> ResourceKey {
    ResourceKey::namespaced(Gvk::new("", "v1", "ConfigMap"), "apps", name)
}

#[tokio::test]
async fn apply_owned_stamps_ownership_and_tracks() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut tc = client(&cluster);

    let applied = tc.apply_owned(cm("cm-1", json!({"k": "v"}))).await.unwrap();
    let labels = applied.metadata.labels.clone().unwrap_or_default();
    assert_eq!(labels.get("example.io/owner").map(String::as_str), Some("svc-a"));
    assert_eq!(labels.get("example.io/component").map(String::as_str), Some("gateway"));
    let refs = applied.metadata.owner_references.clone().unwrap_or_default();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].name, "svc-a");
    assert_eq!(refs[0].controller, Some(true));
    assert!(tc.is_tracked(&cm_key("cm-1")));
}

#[tokio::test]
async fn applying_twice_yields_one_key_and_one_object() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut tc = client(&cluster);

    tc.apply_owned(cm("cm-1", json!({"k": "v"}))).await.unwrap();
    tc.apply_owned(cm("cm-1", json!({"k": "v"}))).await.unwrap();

    assert_eq!(tc.tracked_resources(), vec![cm_key("cm-1")]);
    assert_eq!(cluster.keys(), vec![cm_key("cm-1")]);
    assert_eq!(cluster.write_count(), 1);
}

#[tokio::test]
async fn cluster_scoped_objects_get_labels_but_no_cross_scope_owner_ref() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut tc = client(&cluster);

    let mut cr = DynamicObject::new("reader", &ApiResource::erase::<ClusterRole>(&()));
    cr.data = json!({ "rules": [] });
    let applied = tc.apply_owned(cr).await.unwrap();

    assert!(applied.metadata.owner_references.unwrap_or_default().is_empty());
    assert_eq!(
        applied.metadata.labels.unwrap_or_default().get("example.io/owner").map(String::as_str),
        Some("svc-a")
    );
    let key = ResourceKey::cluster(Gvk::new("rbac.authorization.k8s.io", "v1", "ClusterRole"), "reader");
    assert!(tc.is_tracked(&key));
}

#[tokio::test]
async fn unregistered_kinds_fail_distinctly_or_skip() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut tc = client(&cluster);

    let cert = || {
        let ar = ApiResource::from_gvk(&kube::core::GroupVersionKind::gvk("cert-manager.io", "v1", "Certificate"));
        DynamicObject::new("tls", &ar).within("apps")
    };
    let err = tc.apply_owned(cert()).await.unwrap_err();
    assert!(err.is_kind_not_registered(), "{err}");

    assert!(tc.apply_owned_if_registered(cert()).await.unwrap().is_none());
    assert!(tc.tracked_resources().is_empty());
}

#[tokio::test]
async fn create_already_exists_is_returned_but_tracked() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.seed(cm("cm-1", json!({}))).unwrap();
    let mut tc = client(&cluster);

    let err = tc.create(cm("cm-1", json!({"k": "v"}))).await.unwrap_err();
    assert!(err.is_already_exists());
    assert!(tc.is_tracked(&cm_key("cm-1")));

    tc.create(cm("cm-2", json!({}))).await.unwrap();
    assert!(tc.is_tracked(&cm_key("cm-2")));
}

#[tokio::test]
async fn failed_writes_are_not_tracked() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut tc = client(&cluster);

    let mut no_ns = cm("cm-1", json!({}));
    no_ns.metadata.namespace = None;
    assert!(tc.create(no_ns).await.is_err());

    let missing = tc.patch(&cm_key("ghost"), &ObjectPatch::Merge(json!({"data": {"a": "b"}}))).await;
    assert!(missing.is_err());

    assert!(tc.tracked_resources().is_empty());
}

#[tokio::test]
async fn update_uses_resource_version_and_tracks_on_success() {
    let cluster = Arc::new(MemoryCluster::new());
    let live = cluster.seed(cm("cm-1", json!({"k": "v"}))).unwrap();
    let mut tc = client(&cluster);

    let mut stale = live.clone();
    stale.metadata.resource_version = Some("999".into());
    let err = tc.update(stale).await.unwrap_err();
    assert!(err.is_conflict());
    assert!(!tc.is_tracked(&cm_key("cm-1")));

    let mut fresh = live;
    fresh.data = json!({ "data": { "k": "v2" } });
    let updated = tc.update(fresh).await.unwrap();
    assert_eq!(updated.data["data"]["k"], "v2");
    assert!(tc.is_tracked(&cm_key("cm-1")));
}

#[tokio::test]
async fn patch_tracks_on_success() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.seed(cm("cm-1", json!({"k": "v"}))).unwrap();
    let mut tc = client(&cluster);

    let patched = tc.patch(&cm_key("cm-1"), &ObjectPatch::Merge(json!({"data": {"extra": "1"}}))).await.unwrap();
    assert_eq!(patched.data["data"], json!({"k": "v", "extra": "1"}));
    assert!(tc.is_tracked(&cm_key("cm-1")));
}

#[tokio::test]
async fn create_or_update_walks_created_updated_unchanged() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut tc = client(&cluster);

    let set = |value: &'static str| {
        move |o: &mut DynamicObject| -> anyhow::Result<()> {
            o.data = json!({ "data": { "k": value } });
            Ok(())
        }
    };

    let (_, r1) = tc.create_or_update(cm("cm-1", json!({})), set("v")).await.unwrap();
    assert_eq!(r1, OperationResult::Created);
    let (_, r2) = tc.create_or_update(cm("cm-1", json!({})), set("v2")).await.unwrap();
    assert_eq!(r2, OperationResult::Updated);
    let writes = cluster.write_count();
    let (obj, r3) = tc.create_or_update(cm("cm-1", json!({})), set("v2")).await.unwrap();
    assert_eq!(r3, OperationResult::Unchanged);
    assert_eq!(cluster.write_count(), writes);
    assert_eq!(obj.data["data"]["k"], "v2");
    assert_eq!(tc.tracked_resources(), vec![cm_key("cm-1")]);
}

#[tokio::test]
async fn create_or_update_unchanged_preexisting_object_is_tracked() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut tc = client(&cluster);
    // First pass leaves a fully-owned object behind.
    tc.apply_owned(cm("cm-1", json!({"k": "v"}))).await.unwrap();

    let mut next_pass = client(&cluster);
    let writes = cluster.write_count();
    let (_, result) = next_pass.create_or_update(cm("cm-1", json!({})), |_| Ok(())).await.unwrap();
    assert_eq!(result, OperationResult::Unchanged);
    assert_eq!(cluster.write_count(), writes);
    assert!(next_pass.is_tracked(&cm_key("cm-1")));
}

#[tokio::test]
async fn failing_mutation_tracks_nothing() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut tc = client(&cluster);

    let err = tc
        .create_or_update(cm("cm-1", json!({})), |_| Err(anyhow::anyhow!("template render failed")))
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::MutationFailed { .. }));
    assert!(err.to_string().contains("cm-1"));
    assert!(tc.tracked_resources().is_empty());
    assert!(!cluster.contains(&cm_key("cm-1")));
}

#[tokio::test]
async fn mutation_may_not_rename() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut tc = client(&cluster);

    let err = tc
        .create_or_update(cm("cm-1", json!({})), |o| {
            o.metadata.name = Some("other".into());
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::MutationRenamed { .. }));
    assert!(tc.tracked_resources().is_empty());
}

#[tokio::test]
async fn foreign_controller_is_not_overridden() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut tc = client(&cluster);

    let mut obj = cm("cm-1", json!({}));
    obj.metadata.owner_references = Some(vec![k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
        api_version: "apps/v1".into(),
        kind: "Deployment".into(),
        name: "someone-else".into(),
        uid: "99999999-0000-0000-0000-000000000000".into(),
        controller: Some(true),
        ..Default::default()
    }]);
    let err = tc.apply_owned(obj).await.unwrap_err();
    assert!(matches!(err, ApplyError::AlreadyControlled { .. }));
    assert!(!tc.is_tracked(&cm_key("cm-1")));
}

#[tokio::test]
async fn tracked_snapshot_is_sorted_and_survives_into_tracked() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut tc = client(&cluster);

    let mut dep = DynamicObject::new("dep-1", &ApiResource::erase::<Deployment>(&())).within("apps");
    dep.data = json!({ "spec": { "replicas": 1 } });
    tc.apply_owned(dep).await.unwrap();
    tc.apply_owned(cm("b", json!({}))).await.unwrap();
    tc.apply_owned(cm("a", json!({}))).await.unwrap();

    let snapshot = tc.tracked_resources();
    let mut sorted = snapshot.clone();
    sorted.sort();
    assert_eq!(snapshot, sorted);
    assert_eq!(snapshot.len(), 3);

    let info = cluster.resolve(&Gvk::new("apps", "v1", "Deployment")).await.unwrap();
    assert_eq!(info.plural, "deployments");

    let tracked = tc.into_tracked();
    assert!(tracked.contains(&cm_key("a")));
    assert!(tracked.contains(&ResourceKey::namespaced(Gvk::new("apps", "v1", "Deployment"), "apps", "dep-1")));
}
