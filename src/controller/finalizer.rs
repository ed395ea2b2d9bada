//! Finalizer handling and the tenant finalization sequence
//!
//! The identity service is outside the cluster, so a tenant cannot simply be
//! left to garbage collection. The finalizer holds the Tenant object until the
//! namespace is gone and deregistration has been attempted.

use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::reconciler::Next;
use crate::controller::state_machine::{TenantEvent, TransitionContext, TransitionResult};
use crate::controller::status::StatusManager;
use crate::crd::{Tenant, TenantPhase};
use crate::resources::common::namespace_name;
use crate::store::ResourceStore;

pub const FINALIZER: &str = "tenants.example.com/finalizer";

pub fn has_finalizer(tenant: &Tenant) -> bool {
    tenant.finalizers().iter().any(|f| f == FINALIZER)
}

/// Attach the finalizer
pub async fn add_finalizer<S: ResourceStore>(store: &S, tenant: &Tenant) -> Result<()> {
    let mut updated = tenant.clone();
    updated.finalizers_mut().push(FINALIZER.to_string());
    store.replace(&updated).await?;
    info!(tenant = %tenant.name_any(), "Added finalizer");
    Ok(())
}

/// Drop the finalizer, letting the API server remove the tenant
pub async fn remove_finalizer<S: ResourceStore>(store: &S, tenant: &Tenant) -> Result<()> {
    let mut updated = tenant.clone();
    updated.finalizers_mut().retain(|f| f != FINALIZER);
    store.replace(&updated).await?;
    info!(tenant = %tenant.name_any(), "Removed finalizer");
    Ok(())
}

/// Run one step of finalization for a tenant with a deletion timestamp.
///
/// The first step only records the Terminating phase. The next invocation
/// deletes the namespace (cascading every owned object), deregisters from the
/// identity service and releases the finalizer.
#[instrument(skip_all, fields(tenant = %tenant.name_any()))]
pub async fn finalize<S: ResourceStore>(tenant: &Tenant, ctx: &Context<S>) -> Result<Next> {
    if !has_finalizer(tenant) {
        debug!("Finalizer already removed");
        return Ok(Next::Done);
    }

    let current = tenant.phase().unwrap_or_default();
    if current != TenantPhase::Terminating {
        let result = ctx.state_machine.transition(
            current,
            TenantEvent::DeletionRequested,
            &TransitionContext::default(),
        );
        if let TransitionResult::Success {
            from,
            to,
            description,
            ..
        } = result
        {
            StatusManager::new(tenant, ctx.store.as_ref())
                .set_phase(to)
                .await?;
            info!(%from, %to, "{description}");
            return Ok(Next::Requeue);
        }
    }

    let name = tenant.name_any();
    let namespace = tenant
        .recorded_namespace()
        .map(str::to_string)
        .unwrap_or_else(|| namespace_name(&name));

    if ctx.store.delete::<Namespace>(None, &namespace).await? {
        info!(%namespace, "Deleted tenant namespace");
    } else {
        debug!(%namespace, "Namespace already absent");
    }

    // The identity service collects orphaned records on its own
    match ctx.identity.deregister_tenant(&name).await {
        Ok(()) => info!("Deregistered tenant from identity service"),
        Err(e) => warn!(error = %e, "Failed to deregister tenant, continuing deletion"),
    }

    remove_finalizer(ctx.store.as_ref(), tenant).await?;
    Ok(Next::Done)
}
