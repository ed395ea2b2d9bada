use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::OperatorConfig;
use crate::controller::error::BackoffConfig;
use crate::controller::state_machine::TenantStateMachine;
use crate::health::HealthState;
use crate::identity::IdentityService;
use crate::store::ResourceStore;

/// Shared context for the Tenant controller.
///
/// Holds the store and identity-service handles passed to every reconciler.
/// Nothing here is tenant-specific except the failure counters, which the
/// error policy uses to grow backoff per tenant.
pub struct Context<S: ResourceStore> {
    pub store: Arc<S>,
    pub identity: Arc<dyn IdentityService>,
    pub config: OperatorConfig,
    /// Health state for metrics (optional)
    pub health_state: Option<Arc<HealthState>>,
    pub backoff: BackoffConfig,
    pub state_machine: TenantStateMachine,
    failures: Mutex<HashMap<String, u32>>,
}

impl<S: ResourceStore> Context<S> {
    pub fn new(
        store: Arc<S>,
        identity: Arc<dyn IdentityService>,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            store,
            identity,
            config,
            health_state,
            backoff: BackoffConfig::default(),
            state_machine: TenantStateMachine::new(),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Count a failed invocation, returning the number of failures before it
    pub fn record_failure(&self, tenant: &str) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(tenant.to_string()).or_insert(0);
        let previous = *count;
        *count = count.saturating_add(1);
        previous
    }

    pub fn reset_failures(&self, tenant: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(tenant);
    }

    pub fn failure_count(&self, tenant: &str) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(tenant)
            .copied()
            .unwrap_or(0)
    }
}
