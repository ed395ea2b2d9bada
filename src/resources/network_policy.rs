//! NetworkPolicy generation for tenant isolation
//!
//! Baseline policies, always created while isolation is enabled:
//! - `default-deny-all`: deny all ingress into the namespace
//! - `allow-internal-traffic`: pods of the tenant may talk to each other
//! - `allow-api-access`: ingress to the API server port, optionally only from
//!   an allow-list of namespaces
//!
//! Each custom rule in the spec becomes its own `custom-ingress-{i}` or
//! `custom-egress-{i}` policy. An empty selector map means "any peer", not
//! "no peer".
//!
//! Policies the tenant no longer wants are found through [`owned_selector`]
//! and removed, so disabling isolation or dropping a rule takes effect.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec as K8sNetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::controller::Result;
use crate::crd::{NetworkRule, PortSpec, Tenant};
use crate::resources::api_server;
use crate::resources::common::{
    COMPONENT_LABEL, POLICY_LABEL, TENANT_LABEL, component_labels, object_meta,
};

pub const COMPONENT: &str = "network-policy";
pub const DENY_ALL: &str = "default-deny-all";
pub const ALLOW_INTERNAL: &str = "allow-internal-traffic";
pub const ALLOW_API: &str = "allow-api-access";

const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

/// Whether the tenant wants isolation policies (on unless disabled)
pub fn isolation_enabled(tenant: &Tenant) -> bool {
    tenant
        .spec
        .network_policy
        .as_ref()
        .is_none_or(|np| np.is_enabled())
}

fn policy(
    tenant: &Tenant,
    name: &str,
    kind: &str,
    spec: K8sNetworkPolicySpec,
) -> Result<NetworkPolicy> {
    let mut labels = component_labels(&tenant.name_any(), COMPONENT);
    labels.insert(POLICY_LABEL.to_string(), kind.to_string());
    Ok(NetworkPolicy {
        metadata: object_meta(tenant, name.to_string(), labels)?,
        spec: Some(spec),
    })
}

fn match_labels(labels: BTreeMap<String, String>) -> LabelSelector {
    LabelSelector {
        match_labels: Some(labels),
        ..Default::default()
    }
}

fn convert_ports(ports: &[PortSpec]) -> Option<Vec<NetworkPolicyPort>> {
    if ports.is_empty() {
        return None;
    }
    Some(
        ports
            .iter()
            .map(|p| NetworkPolicyPort {
                protocol: p.protocol.clone(),
                port: (p.port != 0).then_some(IntOrString::Int(p.port)),
                ..Default::default()
            })
            .collect(),
    )
}

/// A single pod-selector peer, or no restriction when the selector is empty
fn convert_peers(selector: &BTreeMap<String, String>) -> Option<Vec<NetworkPolicyPeer>> {
    if selector.is_empty() {
        return None;
    }
    Some(vec![NetworkPolicyPeer {
        pod_selector: Some(match_labels(selector.clone())),
        ..Default::default()
    }])
}

/// Deny all ingress to pods in the tenant namespace
pub fn generate_deny_all(tenant: &Tenant) -> Result<NetworkPolicy> {
    policy(
        tenant,
        DENY_ALL,
        "default",
        K8sNetworkPolicySpec {
            pod_selector: Some(LabelSelector::default()),
            policy_types: Some(vec!["Ingress".to_string()]),
            ..Default::default()
        },
    )
}

/// Allow traffic between pods of the same tenant
pub fn generate_allow_internal(tenant: &Tenant) -> Result<NetworkPolicy> {
    policy(
        tenant,
        ALLOW_INTERNAL,
        "default",
        K8sNetworkPolicySpec {
            pod_selector: Some(LabelSelector::default()),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: Some(vec![NetworkPolicyPeer {
                    pod_selector: Some(LabelSelector::default()),
                    ..Default::default()
                }]),
                ports: None,
            }]),
            policy_types: Some(vec!["Ingress".to_string()]),
            ..Default::default()
        },
    )
}

/// Allow ingress to the API server port, from the allowed namespaces when listed
pub fn generate_allow_api(tenant: &Tenant) -> Result<NetworkPolicy> {
    let allowed = tenant
        .spec
        .network_policy
        .as_ref()
        .map(|np| np.allowed_namespaces.as_slice())
        .unwrap_or_default();

    let from = (!allowed.is_empty()).then(|| {
        allowed
            .iter()
            .map(|ns| NetworkPolicyPeer {
                namespace_selector: Some(match_labels(BTreeMap::from([(
                    NAMESPACE_NAME_LABEL.to_string(),
                    ns.clone(),
                )]))),
                ..Default::default()
            })
            .collect()
    });

    policy(
        tenant,
        ALLOW_API,
        "default",
        K8sNetworkPolicySpec {
            pod_selector: Some(match_labels(BTreeMap::from([(
                "app".to_string(),
                api_server::COMPONENT.to_string(),
            )]))),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from,
                ports: Some(vec![NetworkPolicyPort {
                    protocol: Some("TCP".to_string()),
                    port: Some(IntOrString::String(api_server::PORT_NAME.to_string())),
                    ..Default::default()
                }]),
            }]),
            policy_types: Some(vec!["Ingress".to_string()]),
            ..Default::default()
        },
    )
}

pub fn generate_custom_ingress(
    tenant: &Tenant,
    index: usize,
    rule: &NetworkRule,
) -> Result<NetworkPolicy> {
    policy(
        tenant,
        &format!("custom-ingress-{index}"),
        "custom",
        K8sNetworkPolicySpec {
            pod_selector: Some(LabelSelector::default()),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: convert_peers(&rule.from),
                ports: convert_ports(&rule.ports),
            }]),
            policy_types: Some(vec!["Ingress".to_string()]),
            ..Default::default()
        },
    )
}

pub fn generate_custom_egress(
    tenant: &Tenant,
    index: usize,
    rule: &NetworkRule,
) -> Result<NetworkPolicy> {
    policy(
        tenant,
        &format!("custom-egress-{index}"),
        "custom",
        K8sNetworkPolicySpec {
            pod_selector: Some(LabelSelector::default()),
            egress: Some(vec![NetworkPolicyEgressRule {
                to: convert_peers(&rule.to),
                ports: convert_ports(&rule.ports),
            }]),
            policy_types: Some(vec!["Egress".to_string()]),
            ..Default::default()
        },
    )
}

/// Every policy the tenant should have, in creation order.
///
/// Empty when isolation is disabled.
pub fn generate_network_policies(tenant: &Tenant) -> Result<Vec<NetworkPolicy>> {
    if !isolation_enabled(tenant) {
        return Ok(Vec::new());
    }

    let mut policies = vec![
        generate_deny_all(tenant)?,
        generate_allow_internal(tenant)?,
        generate_allow_api(tenant)?,
    ];

    if let Some(spec) = tenant.spec.network_policy.as_ref() {
        for (i, rule) in spec.ingress_rules.iter().enumerate() {
            policies.push(generate_custom_ingress(tenant, i, rule)?);
        }
        for (i, rule) in spec.egress_rules.iter().enumerate() {
            policies.push(generate_custom_egress(tenant, i, rule)?);
        }
    }

    Ok(policies)
}

/// Label selector matching every policy generated for a tenant
pub fn owned_selector(tenant: &str) -> String {
    format!("{TENANT_LABEL}={tenant},{COMPONENT_LABEL}={COMPONENT}")
}

/// Names of `existing` policies owned by the tenant that `desired` no longer
/// contains. Policies owned by anything else are left alone.
pub fn stale_policies(
    tenant: &Tenant,
    existing: &[NetworkPolicy],
    desired: &[NetworkPolicy],
) -> Vec<String> {
    let uid = tenant.metadata.uid.as_deref();
    existing
        .iter()
        .filter(|policy| {
            policy
                .owner_references()
                .iter()
                .any(|r| Some(r.uid.as_str()) == uid)
        })
        .map(|policy| policy.name_any())
        .filter(|name| !desired.iter().any(|d| d.name_any() == *name))
        .collect()
}
