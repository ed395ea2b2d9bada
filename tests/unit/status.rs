//! Unit tests for status management

use tenant_operator::controller::status::{
    ConditionBuilder, INVALID_SPEC_REASON, aggregate, awaiting_spec_change, condition_status,
    condition_types, invalid_spec_status, spec_changed, with_conditions,
};
use tenant_operator::crd::{ComponentPhase, Condition, TenantPhase, TenantStatus};

use crate::common::*;

fn condition<'a>(conditions: &'a [Condition], type_: &str) -> &'a Condition {
    conditions
        .iter()
        .find(|c| c.type_ == type_)
        .unwrap_or_else(|| panic!("missing {type_} condition"))
}

fn status(phase: TenantPhase) -> TenantStatus {
    TenantStatus {
        phase: Some(phase),
        cache_status: Some(aggregate("Cache", 1, 1)),
        server_status: Some(aggregate("Server", 1, 1)),
        ..Default::default()
    }
}

mod aggregate_tests {
    use super::*;

    #[test]
    fn test_no_replicas_ready_is_provisioning() {
        let status = aggregate("Cache", 0, 1);
        assert_eq!(status.phase, ComponentPhase::Provisioning);
        assert_eq!(status.message, "Cache is being provisioned");
        assert_eq!(status.ready_replicas, 0);
        assert_eq!(status.total_replicas, 1);
    }

    #[test]
    fn test_some_replicas_ready_is_degraded() {
        let status = aggregate("Server", 2, 3);
        assert_eq!(status.phase, ComponentPhase::Degraded);
        assert_eq!(status.message, "Server is degraded: 2/3 replicas ready");
    }

    #[test]
    fn test_all_replicas_ready_is_running() {
        let status = aggregate("Server", 3, 3);
        assert_eq!(status.phase, ComponentPhase::Running);
        assert_eq!(status.message, "Server is running");
    }

    #[test]
    fn test_more_ready_than_desired_is_running() {
        // Scale-down in progress
        assert_eq!(aggregate("Cache", 3, 1).phase, ComponentPhase::Running);
    }

    #[test]
    fn test_negative_ready_clamped() {
        let status = aggregate("Cache", -1, 1);
        assert_eq!(status.phase, ComponentPhase::Provisioning);
        assert_eq!(status.ready_replicas, 0);
    }
}

mod spec_changed_tests {
    use super::*;

    #[test]
    fn test_no_status_means_changed() {
        assert!(spec_changed(&create_test_tenant("acme")));
    }

    #[test]
    fn test_generation_observed() {
        let mut tenant = TenantBuilder::new("acme").with_generation(3).build();
        tenant.status = Some(TenantStatus {
            observed_generation: Some(3),
            ..Default::default()
        });
        assert!(!spec_changed(&tenant));

        tenant.metadata.generation = Some(4);
        assert!(spec_changed(&tenant));
    }
}

mod condition_builder_tests {
    use super::*;

    #[test]
    fn test_new_conditions() {
        let conditions = ConditionBuilder::new(Some(2))
            .ready(true, "TenantReady", "All components are running")
            .progressing(false, "Stable", "Tenant is stable")
            .build();

        assert_eq!(conditions.len(), 2);
        let ready = condition(&conditions, condition_types::READY);
        assert_eq!(ready.status, condition_status::TRUE);
        assert_eq!(ready.observed_generation, Some(2));
    }

    #[test]
    fn test_transition_time_kept_when_status_unchanged() {
        let mut existing = ConditionBuilder::new(Some(1))
            .ready(false, "Provisioning", "Waiting")
            .build();
        existing[0].last_transition_time = "2020-01-01T00:00:00+00:00".to_string();

        let updated = ConditionBuilder::from_existing(existing, Some(2))
            .ready(false, "Provisioning", "Still waiting")
            .build();
        assert_eq!(updated[0].last_transition_time, "2020-01-01T00:00:00+00:00");
        assert_eq!(updated[0].message, "Still waiting");
        assert_eq!(updated[0].observed_generation, Some(2));
    }

    #[test]
    fn test_transition_time_moves_on_flip() {
        let mut existing = ConditionBuilder::new(Some(1))
            .ready(false, "Provisioning", "Waiting")
            .build();
        existing[0].last_transition_time = "2020-01-01T00:00:00+00:00".to_string();

        let updated = ConditionBuilder::from_existing(existing, Some(1))
            .ready(true, "TenantReady", "All components are running")
            .build();
        assert_ne!(updated[0].last_transition_time, "2020-01-01T00:00:00+00:00");
        assert_eq!(updated[0].status, condition_status::TRUE);
    }
}

mod with_conditions_tests {
    use super::*;

    #[test]
    fn test_running_is_ready() {
        let status = with_conditions(status(TenantPhase::Running), Some(5));
        assert_eq!(status.observed_generation, Some(5));
        let ready = condition(&status.conditions, condition_types::READY);
        assert_eq!(ready.status, condition_status::TRUE);
        let degraded = condition(&status.conditions, condition_types::DEGRADED);
        assert_eq!(degraded.status, condition_status::FALSE);
    }

    #[test]
    fn test_provisioning_is_progressing() {
        let status = with_conditions(status(TenantPhase::Provisioning), Some(1));
        let ready = condition(&status.conditions, condition_types::READY);
        assert_eq!(ready.status, condition_status::FALSE);
        let progressing = condition(&status.conditions, condition_types::PROGRESSING);
        assert_eq!(progressing.status, condition_status::TRUE);
    }

    #[test]
    fn test_degraded_component_sets_condition_not_phase() {
        let mut input = status(TenantPhase::Running);
        input.server_status = Some(aggregate("Server", 1, 3));

        let status = with_conditions(input, Some(1));
        assert_eq!(status.phase, Some(TenantPhase::Running));
        let degraded = condition(&status.conditions, condition_types::DEGRADED);
        assert_eq!(degraded.status, condition_status::TRUE);
        assert!(degraded.message.contains("1/3"));
    }

    #[test]
    fn test_recomputing_is_stable() {
        let once = with_conditions(status(TenantPhase::Running), Some(1));
        let twice = with_conditions(once.clone(), Some(1));
        assert_eq!(once, twice);
    }
}

mod invalid_spec_tests {
    use super::*;

    #[test]
    fn test_invalid_spec_keeps_phase() {
        let mut tenant = TenantBuilder::new("acme").with_generation(7).build();
        tenant.status = Some(with_conditions(status(TenantPhase::Running), Some(6)));

        let status = invalid_spec_status(&tenant, "cache.cpu.limit: invalid quantity");
        assert_eq!(status.phase, Some(TenantPhase::Running));
        assert_eq!(status.observed_generation, Some(7));
        let ready = condition(&status.conditions, condition_types::READY);
        assert_eq!(ready.status, condition_status::FALSE);
        assert_eq!(ready.reason, INVALID_SPEC_REASON);
        assert!(ready.message.contains("cache.cpu.limit"));
    }

    #[test]
    fn test_awaiting_until_generation_moves() {
        let mut tenant = TenantBuilder::new("acme").with_generation(3).build();
        assert!(!awaiting_spec_change(&tenant));

        tenant.status = Some(invalid_spec_status(&tenant, "bad quantity"));
        assert!(awaiting_spec_change(&tenant));

        tenant.metadata.generation = Some(4);
        assert!(!awaiting_spec_change(&tenant));
    }

    #[test]
    fn test_healthy_status_is_not_awaiting() {
        let mut tenant = TenantBuilder::new("acme").with_generation(1).build();
        tenant.status = Some(with_conditions(status(TenantPhase::Running), Some(1)));
        assert!(!awaiting_spec_change(&tenant));
    }
}
