//! Reconciliation logic for Tenant resources
//!
//! Every invocation re-reads the tenant and performs at most one phase
//! transition before asking to be re-invoked. A crash between steps therefore
//! loses at most one persisted write, and the next pass picks up from the
//! recorded phase.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::components::{
    reconcile_api_server, reconcile_cache, reconcile_namespace, reconcile_network_policies,
    reconcile_quota,
};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::finalizer::{add_finalizer, finalize, has_finalizer};
use crate::controller::state_machine::{TenantEvent, TransitionContext, TransitionResult};
use crate::controller::status::{
    StatusManager, awaiting_spec_change, invalid_spec_status, with_conditions,
};
use crate::crd::{ComponentPhase, Tenant, TenantPhase};
use crate::identity::ensure_registered;
use crate::store::ResourceStore;

/// What the controller should do after a successful invocation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Next {
    /// Re-invoke immediately
    Requeue,
    /// Re-invoke after a delay
    RequeueAfter(Duration),
    /// Wait for the next change event
    Done,
}

impl Next {
    pub fn into_action(self) -> Action {
        match self {
            Next::Requeue => Action::requeue(Duration::ZERO),
            Next::RequeueAfter(delay) => Action::requeue(delay),
            Next::Done => Action::await_change(),
        }
    }
}

/// Reconcile one tenant by name against the store.
///
/// This is the core loop; it knows nothing about the kube runtime and runs
/// unchanged against [`crate::store::InMemoryStore`].
#[instrument(skip(ctx), fields(tenant = %name))]
pub async fn reconcile_tenant<S: ResourceStore>(name: &str, ctx: &Context<S>) -> Result<Next> {
    let Some(tenant) = ctx.store.get::<Tenant>(None, name).await? else {
        debug!("Tenant no longer exists");
        return Ok(Next::Done);
    };

    match drive(&tenant, ctx).await {
        Ok(next) => Ok(next),
        Err(Error::InvalidConfig(message)) => {
            // The phase is kept; only the conditions report the bad spec
            warn!(reason = %message, "Tenant spec is invalid, waiting for a spec change");
            if let Err(e) = StatusManager::new(&tenant, ctx.store.as_ref())
                .persist(invalid_spec_status(&tenant, &message))
                .await
            {
                debug!(error = %e, "Could not record invalid spec on status");
            }
            Err(Error::InvalidConfig(message))
        }
        Err(e) => {
            if let Err(write_err) = StatusManager::new(&tenant, ctx.store.as_ref())
                .record_error(&e.to_string())
                .await
            {
                debug!(error = %write_err, "Could not record error on status");
            }
            Err(e)
        }
    }
}

async fn drive<S: ResourceStore>(tenant: &Tenant, ctx: &Context<S>) -> Result<Next> {
    let store = ctx.store.as_ref();
    let status = StatusManager::new(tenant, store);
    let name = tenant.name_any();

    let Some(phase) = tenant.phase() else {
        status.set_phase(TenantPhase::Pending).await?;
        info!("Tenant observed, phase set to Pending");
        return Ok(Next::Requeue);
    };

    if !tenant.is_deleting() && !has_finalizer(tenant) {
        add_finalizer(store, tenant).await?;
        return Ok(Next::Requeue);
    }

    if tenant.is_deleting() {
        return finalize(tenant, ctx).await;
    }

    if awaiting_spec_change(tenant) {
        debug!("Spec is invalid, waiting for a spec change");
        return Ok(Next::Done);
    }

    let sm = &ctx.state_machine;
    match phase {
        TenantPhase::Failed => {
            debug!("Tenant failed, waiting for deletion");
            return Ok(Next::Done);
        }
        TenantPhase::Pending => {
            let tctx = TransitionContext::default();
            if let TransitionResult::Success { to, description, .. } =
                sm.transition(phase, TenantEvent::ProvisioningStarted, &tctx)
            {
                status.set_phase(to).await?;
                info!(from = %phase, %to, "{description}");
            }
            return Ok(Next::Requeue);
        }
        _ => {}
    }

    let namespace = reconcile_namespace(ctx, tenant).await?.name_any();
    let generation = tenant.metadata.generation;
    if tenant.recorded_namespace() != Some(namespace.as_str()) {
        let mut recorded = tenant.status.clone().unwrap_or_default();
        recorded.namespace = Some(namespace.clone());
        status.persist(with_conditions(recorded, generation)).await?;
        info!(%namespace, "Recorded tenant namespace");
        return Ok(Next::Requeue);
    }

    reconcile_quota(ctx, tenant).await?;
    let cache = reconcile_cache(ctx, tenant).await?;
    let server = reconcile_api_server(ctx, tenant).await?;
    let network = reconcile_network_policies(ctx, tenant).await?;

    // Clients cannot authenticate against the API server without a record
    ensure_registered(ctx.identity.as_ref(), &name).await?;

    let components = [&cache, &server, &network];
    let total = components.len();
    let running = components
        .iter()
        .filter(|c| c.phase == ComponentPhase::Running)
        .count();

    let mut next_status = tenant.status.clone().unwrap_or_default();
    next_status.cache_status = Some(cache);
    next_status.server_status = Some(server);
    next_status.network_policy_status = Some(network);

    if phase == TenantPhase::Provisioning {
        let tctx = TransitionContext::new(running, total);
        match sm.transition(phase, TenantEvent::ComponentsReady, &tctx) {
            TransitionResult::Success { to, description, .. } => {
                info!(from = %phase, %to, "{description}");
                next_status.phase = Some(to);
            }
            TransitionResult::GuardFailed { reason, .. } => {
                debug!(%reason, "Tenant still provisioning");
            }
            TransitionResult::InvalidTransition { .. } => {}
        }
    }

    if status.persist(with_conditions(next_status, generation)).await? {
        debug!("Tenant status updated");
    }

    Ok(Next::RequeueAfter(ctx.config.resync_interval))
}

/// Controller entry point: runs [`reconcile_tenant`] under the configured deadline
pub async fn reconcile<S: ResourceStore>(
    tenant: Arc<Tenant>,
    ctx: Arc<Context<S>>,
) -> Result<Action> {
    let name = tenant.name_any();
    let deadline = ctx.config.reconcile_timeout;
    let start = Instant::now();

    // Dropping the future on expiry cancels any in-flight request
    let result = tokio::time::timeout(deadline, reconcile_tenant(&name, &ctx))
        .await
        .unwrap_or(Err(Error::Timeout(deadline)));

    if let Some(health) = &ctx.health_state {
        match &result {
            Ok(_) => {
                health
                    .metrics
                    .record_reconcile(&name, start.elapsed().as_secs_f64());
                health.mark_reconciled();
            }
            Err(_) => health.metrics.record_error(&name),
        }
    }

    let next = result?;
    ctx.reset_failures(&name);
    Ok(next.into_action())
}

/// Error policy for the controller with exponential backoff per tenant
pub fn error_policy<S: ResourceStore>(
    tenant: Arc<Tenant>,
    error: &Error,
    ctx: Arc<Context<S>>,
) -> Action {
    let name = tenant.name_any();
    let attempt = ctx.record_failure(&name);
    let delay = ctx.backoff.delay_for_error(error, attempt);

    if error.is_retryable() {
        warn!(tenant = %name, %error, attempt, ?delay, "Retryable reconcile error");
    } else {
        error!(
            tenant = %name,
            %error,
            ?delay,
            "Permanent reconcile error, waiting for a spec change"
        );
    }

    Action::requeue(delay)
}
