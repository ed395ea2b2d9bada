// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for tenant resource generation
//!
//! These tests use proptest to generate random configurations and verify that:
//! 1. Quantity parsing never panics and compares equivalent spellings equal
//! 2. Valid specs always generate every resource without errors
//! 3. Generated documents never report drift against themselves
//! 4. Status aggregation and the state machine hold their invariants

use std::collections::BTreeSet;

use proptest::prelude::*;

use tenant_operator::controller::state_machine::{
    TenantEvent, TenantStateMachine, TransitionContext,
};
use tenant_operator::controller::status::aggregate;
use tenant_operator::crd::{
    CacheSpec, ComponentPhase, EnvVarSpec, NetworkPolicySpec, NetworkRule, PortSpec,
    ResourceLimit, ResourceSpec, ServerSpec, Tenant, TenantPhase, TenantSpec,
};
use tenant_operator::resources::converge::changed_fields;
use tenant_operator::resources::{api_server, cache, namespace, network_policy, quantity, quota};

const IDENTITY_URL: &str = "http://auth:3000";

// =============================================================================
// Strategies
// =============================================================================

/// Generate a CPU value string (shrinks toward smaller values)
fn cpu_value() -> impl Strategy<Value = String> {
    prop_oneof![
        (100..=4000u32).prop_map(|m| format!("{m}m")),
        (1..=8u32).prop_map(|c| c.to_string()),
    ]
}

/// Generate a memory value string (shrinks toward smaller values)
fn memory_value() -> impl Strategy<Value = String> {
    prop_oneof![
        (128..=4096u32).prop_map(|m| format!("{m}Mi")),
        (1..=16u32).prop_map(|g| format!("{g}Gi")),
        (100..=900u32).prop_map(|m| format!("{m}M")),
    ]
}

fn limit<S: Strategy<Value = String>>(
    value: fn() -> S,
) -> impl Strategy<Value = Option<ResourceLimit>> {
    prop::option::of((prop::option::of(value()), prop::option::of(value())))
        .prop_map(|pair| pair.map(|(request, limit)| ResourceLimit { request, limit }))
}

fn optional_resources() -> impl Strategy<Value = Option<ResourceSpec>> {
    prop_oneof![
        2 => Just(None),
        1 => (limit(cpu_value), limit(memory_value)).prop_map(|(cpu, memory)| {
            Some(ResourceSpec {
                cpu,
                memory,
                storage: None,
            })
        }),
    ]
}

fn env_name() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("LOG_LEVEL".to_string()),
        Just("PORT".to_string()),
        "[A-Z][A-Z0-9_]{0,12}",
    ]
}

fn env_vars() -> impl Strategy<Value = Vec<EnvVarSpec>> {
    prop::collection::vec(
        (env_name(), "[a-z0-9-]{0,16}").prop_map(|(name, value)| EnvVarSpec {
            name,
            value: Some(value),
            value_from: None,
        }),
        0..6,
    )
}

fn network_rule() -> impl Strategy<Value = NetworkRule> {
    (
        prop::collection::btree_map("[a-z]{1,8}", "[a-z0-9]{1,8}", 0..3),
        prop::collection::vec(
            (prop_oneof![Just("TCP"), Just("UDP")], 0..=65535i32).prop_map(|(protocol, port)| {
                PortSpec {
                    protocol: Some(protocol.to_string()),
                    port,
                }
            }),
            0..3,
        ),
    )
        .prop_map(|(selector, ports)| NetworkRule {
            description: None,
            from: selector.clone(),
            to: selector,
            ports,
        })
}

fn optional_network_policy() -> impl Strategy<Value = Option<NetworkPolicySpec>> {
    prop::option::of(
        (
            prop::option::of(any::<bool>()),
            prop::collection::vec("[a-z][a-z0-9-]{0,10}", 0..3),
            prop::collection::vec(network_rule(), 0..3),
            prop::collection::vec(network_rule(), 0..3),
        )
            .prop_map(|(enabled, allowed_namespaces, ingress_rules, egress_rules)| {
                NetworkPolicySpec {
                    enabled,
                    allowed_namespaces,
                    ingress_rules,
                    egress_rules,
                }
            }),
    )
}

fn valid_spec() -> impl Strategy<Value = TenantSpec> {
    (
        prop::option::of(1..=5i32),
        optional_resources(),
        env_vars(),
        prop::option::of(1..=5i32),
        optional_resources(),
        prop::collection::btree_map("[a-z-]{3,12}", "[a-z0-9]{1,6}", 0..3),
        optional_network_policy(),
    )
        .prop_map(|(replicas, resources, env, cache_replicas, cache_resources, config, np)| {
            TenantSpec {
                server: Some(ServerSpec {
                    replicas,
                    resources,
                    env,
                    ..Default::default()
                }),
                cache: Some(CacheSpec {
                    replicas: cache_replicas,
                    resources: cache_resources,
                    config,
                    ..Default::default()
                }),
                network_policy: np,
                ..Default::default()
            }
        })
}

fn tenant_from_spec(spec: TenantSpec) -> Tenant {
    let mut tenant = Tenant::new("acme", spec);
    tenant.metadata.uid = Some("test-uid-12345".to_string());
    tenant.metadata.generation = Some(1);
    tenant
}

fn tenant_phase() -> impl Strategy<Value = TenantPhase> {
    prop::sample::select(TenantPhase::ALL.to_vec())
}

fn tenant_event() -> impl Strategy<Value = TenantEvent> {
    prop_oneof![
        Just(TenantEvent::ProvisioningStarted),
        Just(TenantEvent::ComponentsReady),
        Just(TenantEvent::DeletionRequested),
    ]
}

// =============================================================================
// Property-based tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: Parsing never panics, whatever the input
    #[test]
    fn prop_quantity_parse_no_panic(input in "\\PC{0,24}") {
        let _ = quantity::parse(&input);
    }

    /// Property: Millicore and whole-core spellings of the same value are equal
    #[test]
    fn prop_millis_equal_whole_units(n in 0..10_000u32) {
        let whole = n.to_string();
        let millis = format!("{}m", u64::from(n) * 1000);
        prop_assert!(quantity::semantically_equal(&whole, &millis));
    }

    /// Property: Binary suffixes scale by 1024
    #[test]
    fn prop_binary_suffixes(n in 1..4096u32) {
        let gi = format!("{n}Gi");
        let mi = format!("{}Mi", u64::from(n) * 1024);
        prop_assert!(quantity::semantically_equal(&gi, &mi));
        prop_assert_eq!(
            quantity::parse(&gi).unwrap().ceil_units(),
            i128::from(n) << 30
        );
    }

    /// Property: Valid specs always generate every resource
    #[test]
    fn prop_valid_spec_generates_resources(spec in valid_spec()) {
        let tenant = tenant_from_spec(spec);
        prop_assert!(namespace::generate_namespace(&tenant).is_ok());
        prop_assert!(quota::generate_resource_quota(&tenant).is_ok());
        prop_assert!(cache::generate_config_map(&tenant).is_ok());
        prop_assert!(cache::generate_statefulset(&tenant).is_ok());
        prop_assert!(api_server::generate_deployment(&tenant, IDENTITY_URL).is_ok());
        prop_assert!(network_policy::generate_network_policies(&tenant).is_ok());
    }

    /// Property: A generated document never reports drift against itself
    #[test]
    fn prop_generated_documents_have_no_self_drift(spec in valid_spec()) {
        let tenant = tenant_from_spec(spec);

        let sts = cache::generate_statefulset(&tenant).unwrap();
        prop_assert!(changed_fields(&sts, &sts).is_empty());
        let deployment = api_server::generate_deployment(&tenant, IDENTITY_URL).unwrap();
        prop_assert!(changed_fields(&deployment, &deployment).is_empty());
        for policy in network_policy::generate_network_policies(&tenant).unwrap() {
            prop_assert!(changed_fields(&policy, &policy).is_empty());
        }
    }

    /// Property: Env overrides never produce duplicate names
    #[test]
    fn prop_env_names_unique(spec in valid_spec()) {
        let tenant = tenant_from_spec(spec);
        let deployment = api_server::generate_deployment(&tenant, IDENTITY_URL).unwrap();
        let env = deployment.spec.unwrap().template.spec.unwrap().containers[0]
            .env
            .clone()
            .unwrap();
        let names: BTreeSet<&str> = env.iter().map(|e| e.name.as_str()).collect();
        prop_assert_eq!(names.len(), env.len());
    }

    /// Property: Policy count is three defaults plus one per custom rule
    #[test]
    fn prop_policy_count(spec in valid_spec()) {
        let tenant = tenant_from_spec(spec);
        let policies = network_policy::generate_network_policies(&tenant).unwrap();
        let expected = match &tenant.spec.network_policy {
            Some(np) if !np.is_enabled() => 0,
            Some(np) => 3 + np.ingress_rules.len() + np.egress_rules.len(),
            None => 3,
        };
        prop_assert_eq!(policies.len(), expected);
    }

    /// Property: Aggregation is Running exactly when every desired replica is ready
    #[test]
    fn prop_aggregate_phase(ready in -2..10i32, total in 0..10i32) {
        let status = aggregate("Cache", ready, total);
        let expected = if ready <= 0 {
            ComponentPhase::Provisioning
        } else if ready < total {
            ComponentPhase::Degraded
        } else {
            ComponentPhase::Running
        };
        prop_assert_eq!(status.phase, expected);
        prop_assert!(status.ready_replicas >= 0);
    }

    /// Property: State machine never panics, never moves backwards and
    /// Terminating is absorbing
    #[test]
    fn prop_state_machine_no_panic(
        phase in tenant_phase(),
        event in tenant_event(),
        running in 0..4usize,
    ) {
        let sm = TenantStateMachine::new();
        let ctx = TransitionContext::new(running, 3);

        let result = sm.transition(phase, event, &ctx);
        if phase == TenantPhase::Terminating {
            prop_assert_eq!(result.target(), None);
        }
        if let Some(to) = result.target() {
            let position = |p: TenantPhase| TenantPhase::ALL.iter().position(|q| *q == p);
            prop_assert!(to == TenantPhase::Terminating || position(to) > position(phase));
            prop_assert_ne!(to, TenantPhase::Failed);
        }
        if event == TenantEvent::DeletionRequested && phase != TenantPhase::Terminating {
            prop_assert_eq!(result.target(), Some(TenantPhase::Terminating));
        }
    }
}
