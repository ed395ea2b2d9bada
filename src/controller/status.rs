//! Status aggregation and conditions for Tenant resources
//!
//! [`aggregate`] turns replica counts into a component phase and is pure.
//! [`StatusManager`] writes the status subresource, skipping the write when
//! nothing changed so a steady-state reconcile performs no writes at all.

use chrono::Utc;
use kube::ResourceExt;
use tracing::debug;

use crate::crd::{ComponentPhase, ComponentStatus, Condition, Tenant, TenantPhase, TenantStatus};
use crate::controller::error::Result;
use crate::store::ResourceStore;

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// Every component of the tenant is running
    pub const READY: &str = "Ready";
    /// The operator is working towards the desired state
    pub const PROGRESSING: &str = "Progressing";
    /// At least one component has some but not all replicas ready
    pub const DEGRADED: &str = "Degraded";
}

pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
}

/// Derive a component phase from observed replica counts.
///
/// `total` is the desired replica count of the workload.
pub fn aggregate(component: &str, ready: i32, total: i32) -> ComponentStatus {
    let (phase, message) = if ready <= 0 {
        (
            ComponentPhase::Provisioning,
            format!("{component} is being provisioned"),
        )
    } else if ready < total {
        (
            ComponentPhase::Degraded,
            format!("{component} is degraded: {ready}/{total} replicas ready"),
        )
    } else {
        (ComponentPhase::Running, format!("{component} is running"))
    };

    ComponentStatus {
        phase,
        message,
        ready_replicas: ready.max(0),
        total_replicas: total,
    }
}

/// Whether the spec has a generation the operator has not yet acted on
pub fn spec_changed(tenant: &Tenant) -> bool {
    let observed = tenant.status.as_ref().and_then(|s| s.observed_generation);
    match (tenant.metadata.generation, observed) {
        (Some(current), Some(observed)) => current != observed,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition. `lastTransitionTime` moves only when the status flips.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    fn flag(value: bool) -> &'static str {
        if value {
            condition_status::TRUE
        } else {
            condition_status::FALSE
        }
    }

    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::READY, Self::flag(is_ready), reason, message)
    }

    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::PROGRESSING,
            Self::flag(is_progressing),
            reason,
            message,
        )
    }

    pub fn degraded(self, is_degraded: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::DEGRADED,
            Self::flag(is_degraded),
            reason,
            message,
        )
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

fn component_statuses(status: &TenantStatus) -> impl Iterator<Item = &ComponentStatus> {
    [
        status.cache_status.as_ref(),
        status.server_status.as_ref(),
        status.network_policy_status.as_ref(),
    ]
    .into_iter()
    .flatten()
}

/// Recompute conditions from the phase and component statuses in `status`
pub fn with_conditions(mut status: TenantStatus, generation: Option<i64>) -> TenantStatus {
    let existing = std::mem::take(&mut status.conditions);
    let builder = ConditionBuilder::from_existing(existing, generation);

    let degraded: Vec<&str> = component_statuses(&status)
        .filter(|c| c.phase == ComponentPhase::Degraded)
        .map(|c| c.message.as_str())
        .collect();
    let builder = if degraded.is_empty() {
        builder.degraded(false, "Healthy", "No component is degraded")
    } else {
        builder.degraded(true, "ComponentsDegraded", &degraded.join("; "))
    };

    let builder = match status.phase {
        Some(TenantPhase::Running) => builder
            .ready(true, "TenantReady", "All components are running")
            .progressing(false, "Stable", "Tenant is stable"),
        Some(TenantPhase::Provisioning) => builder
            .ready(false, "Provisioning", "Waiting for components to become ready")
            .progressing(true, "Provisioning", "Provisioning tenant components"),
        Some(TenantPhase::Terminating) => builder
            .ready(false, "Terminating", "Tenant is being deleted")
            .progressing(true, "Terminating", "Removing tenant resources"),
        Some(TenantPhase::Failed) | Some(TenantPhase::Pending) | None => builder,
    };

    status.conditions = builder.build();
    status.observed_generation = generation;
    status
}

/// Condition reason recorded when the spec holds a value the operator cannot act on
pub const INVALID_SPEC_REASON: &str = "InvalidSpec";

/// Report an unusable spec on the conditions. The phase is left as it is, so
/// a Running tenant keeps running on its last good configuration.
pub fn invalid_spec_status(tenant: &Tenant, message: &str) -> TenantStatus {
    let generation = tenant.metadata.generation;
    let mut status = tenant.status.clone().unwrap_or_default();
    status.conditions = ConditionBuilder::from_existing(status.conditions, generation)
        .ready(false, INVALID_SPEC_REASON, message)
        .progressing(false, INVALID_SPEC_REASON, "Waiting for a spec change")
        .build();
    status.observed_generation = generation;
    status
}

/// The current generation was already rejected as invalid
pub fn awaiting_spec_change(tenant: &Tenant) -> bool {
    let rejected = tenant.status.as_ref().is_some_and(|s| {
        s.conditions
            .iter()
            .any(|c| c.type_ == condition_types::READY && c.reason == INVALID_SPEC_REASON)
    });
    rejected && !spec_changed(tenant)
}

/// Writes the status subresource of one tenant
pub struct StatusManager<'a, S: ResourceStore> {
    tenant: &'a Tenant,
    store: &'a S,
}

impl<'a, S: ResourceStore> StatusManager<'a, S> {
    pub fn new(tenant: &'a Tenant, store: &'a S) -> Self {
        Self { tenant, store }
    }

    /// Persist `status` unless it equals what is already stored.
    ///
    /// Returns true when a write happened.
    pub async fn persist(&self, status: TenantStatus) -> Result<bool> {
        if self.tenant.status.as_ref() == Some(&status) {
            debug!(tenant = %self.tenant.name_any(), "Status unchanged, skipping write");
            return Ok(false);
        }

        let mut updated = self.tenant.clone();
        updated.status = Some(status);
        self.store.replace_tenant_status(&updated).await?;
        Ok(true)
    }

    /// Set the phase and persist
    pub async fn set_phase(&self, phase: TenantPhase) -> Result<bool> {
        let mut status = self.tenant.status.clone().unwrap_or_default();
        status.phase = Some(phase);
        self.persist(with_conditions(status, self.tenant.metadata.generation))
            .await
    }

    /// Record a failed invocation on the Ready condition. Best effort.
    pub async fn record_error(&self, error: &str) -> Result<bool> {
        let generation = self.tenant.metadata.generation;
        let mut status = self.tenant.status.clone().unwrap_or_default();
        status.conditions = ConditionBuilder::from_existing(status.conditions, generation)
            .ready(false, "ReconcileError", error)
            .build();
        self.persist(status).await
    }
}
