//! Unit tests for drift detection and convergence

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, ResourceQuota, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tenant_operator::controller::Error;
use tenant_operator::resources::converge::{
    Outcome, PodWorkload, changed_fields, converge, foreign_controller,
};
use tenant_operator::resources::{api_server, cache, namespace, network_policy, quota};
use tenant_operator::store::{InMemoryStore, ResourceStore, WriteOp};

use crate::common::*;

const IDENTITY_URL: &str = "http://auth:3000";

/// Store with the tenant namespace already present
async fn store_with_namespace(tenant: &tenant_operator::crd::Tenant) -> InMemoryStore {
    let store = InMemoryStore::new();
    store
        .create(&namespace::generate_namespace(tenant).unwrap())
        .await
        .unwrap();
    store.clear_writes();
    store
}

mod outcome_tests {
    use super::*;

    #[tokio::test]
    async fn test_created_then_unchanged() {
        let tenant = create_test_tenant("acme");
        let store = store_with_namespace(&tenant).await;
        let desired = cache::generate_statefulset(&tenant).unwrap();

        let first = converge(&store, &desired).await.unwrap();
        assert_eq!(first.outcome, Outcome::Created);

        let second = converge(&store, &desired).await.unwrap();
        assert_eq!(second.outcome, Outcome::Unchanged);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_every_kind_is_stable_after_create() {
        let tenant = TenantBuilder::new("acme")
            .with_tenant_resources(("1", "2"), ("1Gi", "2Gi"))
            .with_ingress_rule(&[("app", "gateway")], &[("TCP", 8080)])
            .with_server_env("TEST_ENV", "test-value")
            .build();
        let store = store_with_namespace(&tenant).await;

        macro_rules! twice {
            ($desired:expr) => {{
                let desired = $desired;
                converge(&store, &desired).await.unwrap();
                assert_eq!(converge(&store, &desired).await.unwrap().outcome, Outcome::Unchanged);
            }};
        }

        twice!(namespace::generate_namespace(&tenant).unwrap());
        twice!(quota::generate_resource_quota(&tenant).unwrap().unwrap());
        twice!(cache::generate_config_map(&tenant).unwrap());
        twice!(cache::generate_service(&tenant).unwrap());
        twice!(cache::generate_statefulset(&tenant).unwrap());
        twice!(api_server::generate_deployment(&tenant, IDENTITY_URL).unwrap());
        twice!(api_server::generate_service(&tenant).unwrap());
        for policy in network_policy::generate_network_policies(&tenant).unwrap() {
            twice!(policy);
        }
    }

    #[tokio::test]
    async fn test_replicas_drift_is_corrected() {
        let tenant = create_test_tenant("acme");
        let store = store_with_namespace(&tenant).await;
        let desired = api_server::generate_deployment(&tenant, IDENTITY_URL).unwrap();
        converge(&store, &desired).await.unwrap();

        store
            .mutate::<Deployment, _>(Some("tenant-acme"), "acme-server", |d| {
                d.set_replicas(Some(5));
            })
            .unwrap();

        let result = converge(&store, &desired).await.unwrap();
        assert_eq!(result.outcome, Outcome::Updated(vec!["replicas"]));
        assert_eq!(result.object.replicas(), 1);
    }

    #[tokio::test]
    async fn test_config_drift_is_corrected() {
        let tenant = create_test_tenant("acme");
        let store = store_with_namespace(&tenant).await;
        let desired = cache::generate_config_map(&tenant).unwrap();
        converge(&store, &desired).await.unwrap();

        store
            .mutate::<ConfigMap, _>(Some("tenant-acme"), "acme-cache-config", |cm| {
                cm.data = None;
            })
            .unwrap();

        let result = converge(&store, &desired).await.unwrap();
        assert_eq!(result.outcome, Outcome::Updated(vec!["data"]));
        assert_eq!(result.object.data, desired.data);
    }

    #[tokio::test]
    async fn test_only_replace_is_written_on_drift() {
        let tenant = create_test_tenant("acme");
        let store = store_with_namespace(&tenant).await;
        let desired = cache::generate_statefulset(&tenant).unwrap();
        converge(&store, &desired).await.unwrap();
        store
            .mutate::<StatefulSet, _>(Some("tenant-acme"), "acme-cache", |sts| {
                sts.set_replicas(Some(0));
            })
            .unwrap();
        store.clear_writes();

        converge(&store, &desired).await.unwrap();
        let writes = store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].op, WriteOp::Replace);
        assert_eq!(writes[0].kind, "StatefulSet");
    }
}

mod ownership_tests {
    use super::*;

    #[tokio::test]
    async fn test_foreign_namespace_labels_kept() {
        let tenant = create_test_tenant("acme");
        let store = store_with_namespace(&tenant).await;
        store
            .mutate::<Namespace, _>(None, "tenant-acme", |ns| {
                ns.metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .insert("team".to_string(), "payments".to_string());
            })
            .unwrap();

        let desired = namespace::generate_namespace(&tenant).unwrap();
        let result = converge(&store, &desired).await.unwrap();
        assert_eq!(result.outcome, Outcome::Unchanged);
        let labels = result.object.metadata.labels.unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("payments"));
    }

    #[tokio::test]
    async fn test_orphan_is_adopted() {
        let tenant = create_test_tenant("acme");
        let store = store_with_namespace(&tenant).await;
        let mut orphan = cache::generate_service(&tenant).unwrap();
        orphan.metadata.owner_references = None;
        store.create(&orphan).await.unwrap();

        let desired = cache::generate_service(&tenant).unwrap();
        let result = converge(&store, &desired).await.unwrap();
        assert_eq!(result.outcome, Outcome::Updated(vec!["ownerReferences"]));
        let owners = result.object.metadata.owner_references.unwrap();
        assert_eq!(owners[0].uid, TEST_UID);
    }

    #[tokio::test]
    async fn test_object_of_another_controller_is_not_adopted() {
        let tenant = create_test_tenant("acme");
        let store = store_with_namespace(&tenant).await;
        // Left behind by an earlier tenant of the same name
        let previous = TenantBuilder::new("acme").with_uid("previous-uid").build();
        store
            .create(&cache::generate_service(&previous).unwrap())
            .await
            .unwrap();
        store.clear_writes();

        let desired = cache::generate_service(&tenant).unwrap();
        let err = converge(&store, &desired).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { kind: "Service", .. }));
        assert!(err.is_retryable());
        assert_eq!(store.write_count(), 0);

        let live: Service = store
            .snapshot(Some("tenant-acme"), &cache::cache_name("acme"))
            .unwrap();
        let owners = live.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].uid, "previous-uid");
    }

    #[test]
    fn test_foreign_controller_detection() {
        let ours = cache::generate_service(&create_test_tenant("acme")).unwrap();
        let theirs = cache::generate_service(
            &TenantBuilder::new("acme").with_uid("previous-uid").build(),
        )
        .unwrap();
        let mut orphan = ours.clone();
        orphan.metadata.owner_references = None;
        // A non-controller owner does not block adoption
        let mut shared = ours.clone();
        for owner in shared.metadata.owner_references.iter_mut().flatten() {
            owner.uid = "someone-else".to_string();
            owner.controller = Some(false);
        }

        assert!(foreign_controller(&ours, &ours).is_none());
        assert!(foreign_controller(&orphan, &ours).is_none());
        assert!(foreign_controller(&shared, &ours).is_none());
        assert_eq!(
            foreign_controller(&theirs, &ours).map(|r| r.uid.as_str()),
            Some("previous-uid")
        );
    }

    #[tokio::test]
    async fn test_concurrent_write_surfaces_conflict() {
        let tenant = create_test_tenant("acme");
        let store = store_with_namespace(&tenant).await;
        let desired = cache::generate_config_map(&tenant).unwrap();
        let created = converge(&store, &desired).await.unwrap().object;

        store
            .mutate::<ConfigMap, _>(Some("tenant-acme"), "acme-cache-config", |cm| {
                cm.data = None;
            })
            .unwrap();

        // A writer holding the old resourceVersion loses
        let err = store.replace(&created).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert!(err.is_retryable());
    }
}

mod comparison_tests {
    use super::*;

    #[test]
    fn test_quantities_compare_by_value() {
        let tenant = create_test_tenant("acme");
        let desired = cache::generate_statefulset(&tenant).unwrap();
        let mut live = desired.clone();
        let resources = live.pod_spec_mut().unwrap().containers[0]
            .resources
            .as_mut()
            .unwrap();
        resources
            .limits
            .as_mut()
            .unwrap()
            .insert("cpu".to_string(), Quantity("0.3".to_string()));
        resources
            .requests
            .as_mut()
            .unwrap()
            .insert("memory".to_string(), Quantity("134217728".to_string()));

        assert!(changed_fields(&live, &desired).is_empty());
    }

    #[test]
    fn test_volume_claim_templates_are_not_compared() {
        let tenant = create_test_tenant("acme");
        let desired = cache::generate_statefulset(&tenant).unwrap();
        let mut live = desired.clone();
        live.spec.as_mut().unwrap().volume_claim_templates = None;

        assert!(changed_fields(&live, &desired).is_empty());
    }

    #[test]
    fn test_image_change_detected() {
        let tenant = create_test_tenant("acme");
        let desired = api_server::generate_deployment(&tenant, IDENTITY_URL).unwrap();
        let other = TenantBuilder::new("acme").with_server_image("server:v2").build();
        let live = api_server::generate_deployment(&other, IDENTITY_URL).unwrap();

        assert_eq!(changed_fields(&live, &desired), vec!["image"]);
    }

    #[test]
    fn test_env_order_ignored() {
        let tenant = TenantBuilder::new("acme")
            .with_server_env("A", "1")
            .with_server_env("B", "2")
            .build();
        let desired = api_server::generate_deployment(&tenant, IDENTITY_URL).unwrap();
        let mut live = desired.clone();
        live.pod_spec_mut().unwrap().containers[0]
            .env
            .as_mut()
            .unwrap()
            .reverse();

        assert!(changed_fields(&live, &desired).is_empty());
    }

    #[test]
    fn test_service_defaults_applied() {
        let tenant = create_test_tenant("acme");
        let desired = cache::generate_service(&tenant).unwrap();
        let mut live: Service = desired.clone();
        let port = &mut live.spec.as_mut().unwrap().ports.as_mut().unwrap()[0];
        port.protocol = None;
        // Cluster-assigned fields are never compared
        live.spec.as_mut().unwrap().cluster_ips = Some(vec!["None".to_string()]);

        assert!(changed_fields(&live, &desired).is_empty());
    }

    #[test]
    fn test_network_policy_normalisation() {
        let tenant = TenantBuilder::new("acme")
            .with_ingress_rule(&[], &[("TCP", 8080)])
            .build();
        let policies = network_policy::generate_network_policies(&tenant).unwrap();
        let desired: &NetworkPolicy = &policies[3];
        let mut live = desired.clone();
        let spec = live.spec.as_mut().unwrap();
        spec.egress = Some(Vec::new());
        spec.ingress.as_mut().unwrap()[0].ports.as_mut().unwrap()[0].protocol = None;

        assert!(changed_fields(&live, desired).is_empty());
    }

    #[test]
    fn test_quota_change_detected() {
        let small = TenantBuilder::new("acme")
            .with_tenant_resources(("1", "2"), ("1Gi", "2Gi"))
            .build();
        let large = TenantBuilder::new("acme")
            .with_tenant_resources(("1", "4"), ("1Gi", "2Gi"))
            .build();
        let live: ResourceQuota = quota::generate_resource_quota(&small).unwrap().unwrap();
        let desired = quota::generate_resource_quota(&large).unwrap().unwrap();

        assert_eq!(changed_fields(&live, &desired), vec!["hard"]);
    }
}
