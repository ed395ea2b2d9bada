//! Sub-resource reconcilers
//!
//! Each reconciler turns one fragment of the tenant spec into desired
//! documents and converges them. They are independent and idempotent; the
//! tenant loop calls them in a fixed order.

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::status::aggregate;
use crate::crd::{ComponentPhase, ComponentStatus, Tenant};
use crate::resources::converge::{Outcome, PodWorkload, converge};
use crate::resources::{api_server, cache, namespace, namespace_name, network_policy, quota};
use crate::store::ResourceStore;

/// Display names used in component status messages
pub const CACHE_COMPONENT: &str = "Cache";
pub const SERVER_COMPONENT: &str = "Server";

fn record_replicas<S: ResourceStore>(
    ctx: &Context<S>,
    tenant: &str,
    component: &str,
    status: &ComponentStatus,
) {
    if let Some(health) = &ctx.health_state {
        health.metrics.set_component_replicas(
            tenant,
            component,
            i64::from(status.total_replicas),
            i64::from(status.ready_replicas),
        );
    }
}

/// Create the tenant namespace or repair its labels
#[instrument(skip_all)]
pub async fn reconcile_namespace<S: ResourceStore>(
    ctx: &Context<S>,
    tenant: &Tenant,
) -> Result<Namespace> {
    let desired = namespace::generate_namespace(tenant)?;
    Ok(converge(ctx.store.as_ref(), &desired).await?.object)
}

/// Converge the tenant ResourceQuota when the spec sets limits
#[instrument(skip_all)]
pub async fn reconcile_quota<S: ResourceStore>(
    ctx: &Context<S>,
    tenant: &Tenant,
) -> Result<Option<Outcome>> {
    let Some(desired) = quota::generate_resource_quota(tenant)? else {
        debug!("No tenant resource limits, skipping quota");
        return Ok(None);
    };
    Ok(Some(converge(ctx.store.as_ref(), &desired).await?.outcome))
}

/// Converge the cache ConfigMap, Service and StatefulSet
#[instrument(skip_all)]
pub async fn reconcile_cache<S: ResourceStore>(
    ctx: &Context<S>,
    tenant: &Tenant,
) -> Result<ComponentStatus> {
    let store = ctx.store.as_ref();
    converge(store, &cache::generate_config_map(tenant)?).await?;
    converge(store, &cache::generate_service(tenant)?).await?;
    let sts = converge(store, &cache::generate_statefulset(tenant)?)
        .await?
        .object;

    let ready = sts
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    let status = aggregate(CACHE_COMPONENT, ready, sts.replicas());
    record_replicas(ctx, &tenant.name_any(), cache::COMPONENT, &status);
    Ok(status)
}

/// Converge the API server Deployment and Service
#[instrument(skip_all)]
pub async fn reconcile_api_server<S: ResourceStore>(
    ctx: &Context<S>,
    tenant: &Tenant,
) -> Result<ComponentStatus> {
    let store = ctx.store.as_ref();
    let deployment = api_server::generate_deployment(tenant, &ctx.config.identity_service_url)?;
    let deployment = converge(store, &deployment).await?.object;
    converge(store, &api_server::generate_service(tenant)?).await?;

    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    let status = aggregate(SERVER_COMPONENT, ready, deployment.replicas());
    record_replicas(ctx, &tenant.name_any(), api_server::COMPONENT, &status);
    Ok(status)
}

/// Converge the isolation policies and remove the ones the spec dropped.
///
/// The status counts the tenant's policies as listed after cleanup, so a
/// policy that could not be removed keeps the component out of Running.
#[instrument(skip_all)]
pub async fn reconcile_network_policies<S: ResourceStore>(
    ctx: &Context<S>,
    tenant: &Tenant,
) -> Result<ComponentStatus> {
    let store = ctx.store.as_ref();
    let name = tenant.name_any();
    let ns = namespace_name(&name);
    let selector = network_policy::owned_selector(&name);

    let desired = network_policy::generate_network_policies(tenant)?;
    for policy in &desired {
        converge(store, policy).await?;
    }

    let existing: Vec<NetworkPolicy> = store.list(Some(&ns), &selector).await?;
    for stale in network_policy::stale_policies(tenant, &existing, &desired) {
        if store.delete::<NetworkPolicy>(Some(&ns), &stale).await? {
            info!(policy = %stale, "Removed network policy no longer in spec");
        }
    }

    let present: Vec<NetworkPolicy> = store.list(Some(&ns), &selector).await?;
    let lingering = network_policy::stale_policies(tenant, &present, &desired).len();
    let applied = present
        .iter()
        .filter(|p| desired.iter().any(|d| d.name_any() == p.name_any()))
        .count();
    Ok(policy_status(desired.len(), applied, lingering))
}

fn policy_status(desired: usize, applied: usize, lingering: usize) -> ComponentStatus {
    let count = |n: usize| i32::try_from(n).unwrap_or(i32::MAX);
    let (phase, message) = if lingering > 0 {
        (
            ComponentPhase::Provisioning,
            format!("{lingering} network policies awaiting removal"),
        )
    } else if applied < desired {
        (
            ComponentPhase::Provisioning,
            format!("{applied}/{desired} network policies applied"),
        )
    } else if desired == 0 {
        (
            ComponentPhase::Running,
            "Network isolation disabled".to_string(),
        )
    } else {
        (
            ComponentPhase::Running,
            format!("{applied} network policies applied"),
        )
    };

    ComponentStatus {
        phase,
        message,
        ready_replicas: count(applied),
        total_replicas: count(desired),
    }
}
