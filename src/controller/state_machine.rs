//! Finite state machine for the Tenant lifecycle
//!
//! The normal path is `Pending -> Provisioning -> Running`. `Terminating` is
//! reachable from every other phase and has no way out; the object disappears
//! once finalization completes. No other edge leads backwards.
//!
//! Degraded workloads and unusable specs are reported on conditions, never as
//! a phase, so a Running tenant stays Running while replicas recover or while
//! it waits for a corrected spec. `Failed` is accepted on stored objects but
//! no event leads into it; such a tenant can only be deleted.

use std::fmt;

use crate::crd::TenantPhase;

/// Events that move a tenant between phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TenantEvent {
    /// Finalizer is attached and provisioning may begin
    ProvisioningStarted,
    /// Every component reports Running
    ComponentsReady,
    /// Deletion timestamp has been set on the tenant
    DeletionRequested,
}

impl fmt::Display for TenantEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantEvent::ProvisioningStarted => write!(f, "ProvisioningStarted"),
            TenantEvent::ComponentsReady => write!(f, "ComponentsReady"),
            TenantEvent::DeletionRequested => write!(f, "DeletionRequested"),
        }
    }
}

/// Facts about the tenant available to guards
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// Components currently reporting Running
    pub components_running: usize,
    /// Components reconciled in this pass
    pub components_total: usize,
}

impl TransitionContext {
    pub fn new(components_running: usize, components_total: usize) -> Self {
        Self {
            components_running,
            components_total,
        }
    }

    pub fn all_components_running(&self) -> bool {
        self.components_total > 0 && self.components_running >= self.components_total
    }
}

#[derive(Debug)]
pub struct Transition {
    pub from: TenantPhase,
    pub to: TenantPhase,
    pub event: TenantEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: TenantPhase,
        to: TenantPhase,
        event: TenantEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: TenantPhase,
        to: TenantPhase,
        event: TenantEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: TenantPhase,
        event: TenantEvent,
    },
    GuardFailed {
        from: TenantPhase,
        to: TenantPhase,
        event: TenantEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Target phase when the transition succeeded
    pub fn target(&self) -> Option<TenantPhase> {
        match self {
            TransitionResult::Success { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// Transition table for the tenant lifecycle
pub struct TenantStateMachine {
    transitions: Vec<Transition>,
}

impl Default for TenantStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TenantStateMachine {
    pub fn new() -> Self {
        use TenantEvent::*;
        use TenantPhase::*;

        Self {
            transitions: vec![
                // === Pending ===
                Transition::new(
                    Pending,
                    Provisioning,
                    ProvisioningStarted,
                    "Starting tenant provisioning",
                ),
                Transition::new(
                    Pending,
                    Terminating,
                    DeletionRequested,
                    "Tenant deleted before provisioning",
                ),
                // === Provisioning ===
                Transition::new(
                    Provisioning,
                    Running,
                    ComponentsReady,
                    "All components are running",
                ),
                Transition::new(
                    Provisioning,
                    Terminating,
                    DeletionRequested,
                    "Tenant deleted during provisioning",
                ),
                // === Running ===
                Transition::new(Running, Terminating, DeletionRequested, "Tenant deleted"),
                // === Failed ===
                Transition::new(
                    Failed,
                    Terminating,
                    DeletionRequested,
                    "Failed tenant deleted",
                ),
                // Terminating is terminal
            ],
        }
    }

    /// Attempt a transition from `current` on `event`
    pub fn transition(
        &self,
        current: TenantPhase,
        event: TenantEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let Some(t) = self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event)
        else {
            return TransitionResult::InvalidTransition { current, event };
        };

        match self.check_guard(t, ctx) {
            Some(reason) => TransitionResult::GuardFailed {
                from: t.from,
                to: t.to,
                event,
                reason,
            },
            None => TransitionResult::Success {
                from: t.from,
                to: t.to,
                event,
                description: t.description,
            },
        }
    }

    /// Whether a transition exists, ignoring guards
    pub fn can_transition(&self, from: TenantPhase, event: TenantEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.event == event)
    }

    pub fn valid_events(&self, state: TenantPhase) -> Vec<TenantEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == state)
            .map(|t| t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match transition.event {
            TenantEvent::ComponentsReady if !ctx.all_components_running() => Some(format!(
                "Not all components running: {}/{}",
                ctx.components_running, ctx.components_total
            )),
            _ => None,
        }
    }
}
