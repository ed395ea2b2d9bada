//! Tenant namespace generation

use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::controller::Result;
use crate::crd::Tenant;
use crate::resources::common::{namespace_name, owner_reference, standard_labels};

/// Generate the namespace that holds every object of a tenant.
///
/// Only the tenant and managed-by labels are enforced; labels added by other
/// actors are left alone on update.
pub fn generate_namespace(tenant: &Tenant) -> Result<Namespace> {
    let name = tenant.name_any();
    Ok(Namespace {
        metadata: ObjectMeta {
            name: Some(namespace_name(&name)),
            labels: Some(standard_labels(&name)),
            owner_references: Some(vec![owner_reference(tenant)?]),
            ..Default::default()
        },
        ..Default::default()
    })
}
