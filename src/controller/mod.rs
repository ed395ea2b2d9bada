pub mod components;
pub mod context;
pub mod error;
pub mod finalizer;
pub mod reconciler;
pub mod state_machine;
pub mod status;

pub use context::Context;
pub use error::{BackoffConfig, Error, Result};
pub use finalizer::FINALIZER;
pub use reconciler::{Next, error_policy, reconcile, reconcile_tenant};
pub use state_machine::{TenantEvent, TenantStateMachine};
pub use status::{ConditionBuilder, StatusManager, aggregate, spec_changed};
