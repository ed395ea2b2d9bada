//! Tenant-wide ResourceQuota generation
//!
//! `spec.resources` caps the sum of what the tenant's workloads may request.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ResourceQuota, ResourceQuotaSpec};
use kube::ResourceExt;

use crate::controller::Result;
use crate::crd::Tenant;
use crate::resources::common::{component_labels, object_meta, spec_quantity};

pub const COMPONENT: &str = "quota";

pub fn quota_name(tenant: &str) -> String {
    format!("{tenant}-quota")
}

/// Generate the quota, or `None` when the tenant sets no limits.
pub fn generate_resource_quota(tenant: &Tenant) -> Result<Option<ResourceQuota>> {
    let Some(resources) = tenant.spec.resources.as_ref().filter(|r| !r.is_empty()) else {
        return Ok(None);
    };

    let mut hard = BTreeMap::new();
    let pairs = [
        ("limits.cpu", resources.cpu.as_ref().and_then(|c| c.limit.as_ref())),
        ("requests.cpu", resources.cpu.as_ref().and_then(|c| c.request.as_ref())),
        ("limits.memory", resources.memory.as_ref().and_then(|m| m.limit.as_ref())),
        ("requests.memory", resources.memory.as_ref().and_then(|m| m.request.as_ref())),
        (
            "requests.storage",
            resources
                .storage
                .as_ref()
                .and_then(|s| s.request.as_ref().or(s.limit.as_ref())),
        ),
    ];
    for (key, value) in pairs {
        if let Some(value) = value {
            hard.insert(
                key.to_string(),
                spec_quantity(&format!("resources.{key}"), value)?,
            );
        }
    }

    let name = tenant.name_any();
    Ok(Some(ResourceQuota {
        metadata: object_meta(tenant, quota_name(&name), component_labels(&name, COMPONENT))?,
        spec: Some(ResourceQuotaSpec {
            hard: Some(hard),
            ..Default::default()
        }),
        ..Default::default()
    }))
}
