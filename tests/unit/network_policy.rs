//! Unit tests for tenant network isolation

use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tenant_operator::resources::common::POLICY_LABEL;
use tenant_operator::resources::network_policy::{
    ALLOW_API, ALLOW_INTERNAL, DENY_ALL, generate_allow_api, generate_network_policies,
    isolation_enabled, owned_selector, stale_policies,
};

use crate::common::*;

fn names(policies: &[NetworkPolicy]) -> Vec<&str> {
    policies
        .iter()
        .map(|p| p.metadata.name.as_deref().unwrap())
        .collect()
}

mod default_behavior_tests {
    use super::*;

    #[test]
    fn test_isolation_enabled_by_default() {
        assert!(isolation_enabled(&create_test_tenant("acme")));
    }

    #[test]
    fn test_default_policies() {
        let policies = generate_network_policies(&create_test_tenant("acme")).unwrap();
        assert_eq!(names(&policies), vec![DENY_ALL, ALLOW_INTERNAL, ALLOW_API]);

        for policy in &policies {
            assert_eq!(policy.metadata.namespace.as_deref(), Some("tenant-acme"));
            let labels = policy.metadata.labels.as_ref().unwrap();
            assert_eq!(labels.get(POLICY_LABEL).map(String::as_str), Some("default"));
            assert_eq!(policy.metadata.owner_references.as_ref().unwrap().len(), 1);
        }
    }

    #[test]
    fn test_deny_all_selects_every_pod() {
        let policies = generate_network_policies(&create_test_tenant("acme")).unwrap();
        let spec = policies[0].spec.as_ref().unwrap();

        let selector = spec.pod_selector.as_ref().unwrap();
        assert!(selector.match_labels.is_none());
        assert!(spec.ingress.is_none());
        assert_eq!(spec.policy_types, Some(vec!["Ingress".to_string()]));
    }

    #[test]
    fn test_disabled_generates_nothing() {
        let tenant = TenantBuilder::new("acme").without_network_policy().build();
        assert!(!isolation_enabled(&tenant));
        assert!(generate_network_policies(&tenant).unwrap().is_empty());
    }
}

mod api_access_tests {
    use super::*;

    #[test]
    fn test_api_open_without_allowed_namespaces() {
        let policy = generate_allow_api(&create_test_tenant("acme")).unwrap();
        let spec = policy.spec.unwrap();

        let rule = &spec.ingress.unwrap()[0];
        assert!(rule.from.is_none());
        let port = &rule.ports.as_ref().unwrap()[0];
        assert_eq!(port.port, Some(IntOrString::String("http".to_string())));
        let selector = spec.pod_selector.unwrap().match_labels.unwrap();
        assert_eq!(selector.get("app").map(String::as_str), Some("server"));
    }

    #[test]
    fn test_allowed_namespaces_become_peers() {
        let tenant = TenantBuilder::new("acme")
            .with_allowed_namespace("ingress-nginx")
            .with_allowed_namespace("monitoring")
            .build();
        let policy = generate_allow_api(&tenant).unwrap();
        let rule = &policy.spec.unwrap().ingress.unwrap()[0];

        let peers = rule.from.as_ref().unwrap();
        assert_eq!(peers.len(), 2);
        let selector = peers[1].namespace_selector.as_ref().unwrap();
        assert_eq!(
            selector
                .match_labels
                .as_ref()
                .unwrap()
                .get("kubernetes.io/metadata.name")
                .map(String::as_str),
            Some("monitoring")
        );
    }
}

mod custom_rule_tests {
    use super::*;

    #[test]
    fn test_custom_rules_appended_in_order() {
        let tenant = TenantBuilder::new("acme")
            .with_ingress_rule(&[("app", "gateway")], &[("TCP", 8080)])
            .with_ingress_rule(&[], &[])
            .with_egress_rule(&[("app", "db")], &[("TCP", 5432)])
            .build();
        let policies = generate_network_policies(&tenant).unwrap();

        assert_eq!(
            names(&policies),
            vec![
                DENY_ALL,
                ALLOW_INTERNAL,
                ALLOW_API,
                "custom-ingress-0",
                "custom-ingress-1",
                "custom-egress-0",
            ]
        );
        let labels = policies[3].metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(POLICY_LABEL).map(String::as_str), Some("custom"));
    }

    #[test]
    fn test_ingress_rule_peers_and_ports() {
        let tenant = TenantBuilder::new("acme")
            .with_ingress_rule(&[("app", "gateway")], &[("TCP", 8080), ("UDP", 0)])
            .build();
        let policies = generate_network_policies(&tenant).unwrap();
        let rule = &policies[3].spec.as_ref().unwrap().ingress.as_ref().unwrap()[0];

        let peer = &rule.from.as_ref().unwrap()[0];
        let labels = peer.pod_selector.as_ref().unwrap().match_labels.as_ref().unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("gateway"));

        let ports = rule.ports.as_ref().unwrap();
        assert_eq!(ports[0].port, Some(IntOrString::Int(8080)));
        // Port 0 means every port of the protocol
        assert_eq!(ports[1].port, None);
        assert_eq!(ports[1].protocol.as_deref(), Some("UDP"));
    }

    #[test]
    fn test_empty_rule_allows_any_peer() {
        let tenant = TenantBuilder::new("acme").with_ingress_rule(&[], &[]).build();
        let policies = generate_network_policies(&tenant).unwrap();
        let rule = &policies[3].spec.as_ref().unwrap().ingress.as_ref().unwrap()[0];
        assert!(rule.from.is_none());
        assert!(rule.ports.is_none());
    }

    #[test]
    fn test_egress_rule() {
        let tenant = TenantBuilder::new("acme")
            .with_egress_rule(&[("app", "db")], &[("TCP", 5432)])
            .build();
        let policies = generate_network_policies(&tenant).unwrap();
        let spec = policies[3].spec.as_ref().unwrap();

        assert_eq!(spec.policy_types, Some(vec!["Egress".to_string()]));
        let rule = &spec.egress.as_ref().unwrap()[0];
        assert!(rule.to.is_some());
        assert_eq!(
            rule.ports.as_ref().unwrap()[0].port,
            Some(IntOrString::Int(5432))
        );
    }

    #[test]
    fn test_disabled_ignores_custom_rules() {
        let tenant = TenantBuilder::new("acme")
            .with_ingress_rule(&[("app", "gateway")], &[])
            .without_network_policy()
            .build();
        assert!(generate_network_policies(&tenant).unwrap().is_empty());
    }
}

mod cleanup_tests {
    use super::*;

    fn with_two_rules() -> TenantBuilder {
        TenantBuilder::new("acme")
            .with_ingress_rule(&[("app", "gateway")], &[])
            .with_ingress_rule(&[], &[])
    }

    #[test]
    fn test_selector_targets_tenant_policies() {
        assert_eq!(
            owned_selector("acme"),
            "tenants.example.com/tenant=acme,tenants.example.com/component=network-policy"
        );
    }

    #[test]
    fn test_removed_rule_is_stale() {
        let existing = generate_network_policies(&with_two_rules().build()).unwrap();
        let tenant = TenantBuilder::new("acme")
            .with_ingress_rule(&[("app", "gateway")], &[])
            .build();
        let desired = generate_network_policies(&tenant).unwrap();

        assert_eq!(stale_policies(&tenant, &existing, &desired), vec!["custom-ingress-1"]);
    }

    #[test]
    fn test_disabling_makes_everything_stale() {
        let existing = generate_network_policies(&with_two_rules().build()).unwrap();
        let tenant = with_two_rules().without_network_policy().build();
        let desired = generate_network_policies(&tenant).unwrap();

        let stale = stale_policies(&tenant, &existing, &desired);
        assert_eq!(stale.len(), existing.len());
        assert!(stale.iter().any(|name| name == DENY_ALL));
    }

    #[test]
    fn test_foreign_policies_are_kept() {
        let existing = generate_network_policies(&with_two_rules().build()).unwrap();
        let other = TenantBuilder::new("acme")
            .with_uid("another-uid")
            .without_network_policy()
            .build();

        assert!(stale_policies(&other, &existing, &[]).is_empty());
    }

    #[test]
    fn test_nothing_stale_when_unchanged() {
        let tenant = with_two_rules().build();
        let policies = generate_network_policies(&tenant).unwrap();
        assert!(stale_policies(&tenant, &policies, &policies).is_empty());
    }
}
