//! Common utilities for Kubernetes resource generation
//!
//! Names, labels and owner references shared by every generator, so that all
//! objects belonging to a tenant can be found and garbage collected together.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use crate::controller::{Error, Result};
use crate::crd::{ResourceLimit, ResourceSpec, Tenant};
use crate::resources::quantity;

/// API version for the Tenant CRD
pub const API_VERSION: &str = "tenants.example.com/v1";

/// Kind for the Tenant CRD
pub const KIND: &str = "Tenant";

/// Field manager and `app.kubernetes.io/managed-by` value
pub const FIELD_MANAGER: &str = "tenant-operator";

pub const TENANT_LABEL: &str = "tenants.example.com/tenant";
pub const COMPONENT_LABEL: &str = "tenants.example.com/component";
pub const POLICY_LABEL: &str = "tenants.example.com/policy";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Namespace provisioned for a tenant
pub fn namespace_name(tenant: &str) -> String {
    format!("tenant-{tenant}")
}

/// Generate an owner reference for a Tenant.
///
/// Every generated object carries one so the platform garbage collects it
/// when the tenant goes away.
pub fn owner_reference(tenant: &Tenant) -> Result<OwnerReference> {
    let uid = tenant
        .metadata
        .uid
        .clone()
        .ok_or(Error::MissingObjectKey("metadata.uid"))?;
    Ok(OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: tenant.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Labels carried by every object belonging to a tenant
pub fn standard_labels(tenant: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (TENANT_LABEL.to_string(), tenant.to_string()),
        (MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string()),
    ])
}

/// Standard labels plus the component label
pub fn component_labels(tenant: &str, component: &str) -> BTreeMap<String, String> {
    let mut labels = standard_labels(tenant);
    labels.insert(COMPONENT_LABEL.to_string(), component.to_string());
    labels
}

/// Metadata for an object in the tenant namespace
pub fn object_meta(
    tenant: &Tenant,
    name: String,
    labels: BTreeMap<String, String>,
) -> Result<ObjectMeta> {
    Ok(ObjectMeta {
        name: Some(name),
        namespace: Some(namespace_name(&tenant.name_any())),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference(tenant)?]),
        ..Default::default()
    })
}

/// Default container resources, each value overridable independently
#[derive(Clone, Copy, Debug)]
pub struct ResourceDefaults {
    pub cpu_request: &'static str,
    pub cpu_limit: &'static str,
    pub memory_request: &'static str,
    pub memory_limit: &'static str,
}

fn pick<'a>(limit: Option<&'a ResourceLimit>, request: bool, default: &'a str) -> &'a str {
    limit
        .and_then(|l| if request { l.request.as_deref() } else { l.limit.as_deref() })
        .unwrap_or(default)
}

fn checked(field: &str, value: &str) -> Result<K8sQuantity> {
    quantity::to_k8s(value).map_err(|e| Error::InvalidConfig(format!("{field}: {e}")))
}

/// Container resources from an optional spec fragment merged over defaults
pub fn container_resources(
    spec: Option<&ResourceSpec>,
    defaults: ResourceDefaults,
    field: &str,
) -> Result<ResourceRequirements> {
    let cpu = spec.and_then(|s| s.cpu.as_ref());
    let memory = spec.and_then(|s| s.memory.as_ref());

    let requests = BTreeMap::from([
        (
            "cpu".to_string(),
            checked(&format!("{field}.cpu.request"), pick(cpu, true, defaults.cpu_request))?,
        ),
        (
            "memory".to_string(),
            checked(
                &format!("{field}.memory.request"),
                pick(memory, true, defaults.memory_request),
            )?,
        ),
    ]);
    let limits = BTreeMap::from([
        (
            "cpu".to_string(),
            checked(&format!("{field}.cpu.limit"), pick(cpu, false, defaults.cpu_limit))?,
        ),
        (
            "memory".to_string(),
            checked(
                &format!("{field}.memory.limit"),
                pick(memory, false, defaults.memory_limit),
            )?,
        ),
    ]);

    Ok(ResourceRequirements {
        requests: Some(requests),
        limits: Some(limits),
        ..Default::default()
    })
}

/// Validate an optional quantity from the spec
pub fn spec_quantity(field: &str, value: &str) -> Result<K8sQuantity> {
    checked(field, value)
}
