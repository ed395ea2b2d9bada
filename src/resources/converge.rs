//! Resource convergence
//!
//! [`converge`] is the single create-or-update routine every sub-resource goes
//! through: read the live object, create it when absent, otherwise compare the
//! kind's mutable fields and write only when one of them differs.
//!
//! Which fields are mutable is declared per kind as a static table of
//! [`MutableField`]s. Anything not in the table (volume claim templates,
//! cluster IPs, server-populated metadata) is never compared or rewritten.
//! Comparisons are semantic: quantities by value, env vars by name regardless
//! of order, server-side defaults (protocol TCP, target port = port) applied
//! before comparing.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, EnvVar, EnvVarSource, Namespace, PodSpec, ResourceQuota,
    ResourceRequirements, Service,
};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::{debug, info, warn};

use crate::controller::{Error, Result};
use crate::resources::quantity;
use crate::store::{ResourceStore, StoredKind, object_name};

/// One mutable field of a kind: how to detect drift and how to repair it
pub struct MutableField<K> {
    pub name: &'static str,
    pub differs: fn(live: &K, desired: &K) -> bool,
    pub apply: fn(live: &mut K, desired: &K),
}

/// A kind that can be converged
pub trait Convergent: StoredKind {
    const MUTABLE_FIELDS: &'static [MutableField<Self>];
}

/// What [`converge`] did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Created,
    /// Fields that differed and were rewritten
    Updated(Vec<&'static str>),
    Unchanged,
}

#[derive(Clone, Debug)]
pub struct Converged<K> {
    pub outcome: Outcome,
    /// Live object after convergence
    pub object: K,
}

const OWNER_REFERENCES: &str = "ownerReferences";

/// Owner references present in `desired` but missing from `live`
fn missing_owner_refs<K: StoredKind>(live: &K, desired: &K) -> bool {
    let live_refs = live.meta().owner_references.as_deref().unwrap_or_default();
    desired
        .meta()
        .owner_references
        .iter()
        .flatten()
        .any(|d| !live_refs.iter().any(|l| l.uid == d.uid))
}

/// Controller reference on `live` naming an owner other than the controller
/// `desired` declares. Such an object is never adopted.
pub fn foreign_controller<'a, K: StoredKind>(
    live: &'a K,
    desired: &K,
) -> Option<&'a OwnerReference> {
    let ours = desired
        .meta()
        .owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true))?;
    live.meta()
        .owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true) && r.uid != ours.uid)
}

fn adopt<K: StoredKind>(live: &mut K, desired: &K) {
    let refs = live.meta_mut().owner_references.get_or_insert_with(Vec::new);
    for owner in desired.meta().owner_references.iter().flatten() {
        if !refs.iter().any(|r| r.uid == owner.uid) {
            refs.push(owner.clone());
        }
    }
}

/// Names of the mutable fields that differ between `live` and `desired`
pub fn changed_fields<K: Convergent>(live: &K, desired: &K) -> Vec<&'static str> {
    let mut changed: Vec<&'static str> = K::MUTABLE_FIELDS
        .iter()
        .filter(|field| (field.differs)(live, desired))
        .map(|field| field.name)
        .collect();
    if missing_owner_refs(live, desired) {
        changed.push(OWNER_REFERENCES);
    }
    changed
}

/// Copy differing mutable fields from `desired` onto `live`
pub fn merge<K: Convergent>(live: &mut K, desired: &K) -> Vec<&'static str> {
    let mut changed = Vec::new();
    for field in K::MUTABLE_FIELDS {
        if (field.differs)(live, desired) {
            (field.apply)(live, desired);
            changed.push(field.name);
        }
    }
    if missing_owner_refs(live, desired) {
        adopt(live, desired);
        changed.push(OWNER_REFERENCES);
    }
    changed
}

/// Drive one object to its desired state.
///
/// Always diffs against a fresh read. A concurrent writer surfaces as a
/// conflict error from the store rather than being overwritten.
pub async fn converge<K, S>(store: &S, desired: &K) -> Result<Converged<K>>
where
    K: Convergent,
    S: ResourceStore,
{
    let name = object_name(desired)?;
    let namespace = desired.meta().namespace.as_deref();

    let Some(mut live) = store.get::<K>(namespace, name).await? else {
        let object = store.create(desired).await?;
        info!(kind = K::KIND, name = %name, namespace = ?namespace, "Created resource");
        return Ok(Converged {
            outcome: Outcome::Created,
            object,
        });
    };

    if let Some(owner) = foreign_controller(&live, desired) {
        warn!(
            kind = K::KIND,
            name = %name,
            owner_kind = %owner.kind,
            owner = %owner.name,
            "Resource is controlled by another owner, not adopting"
        );
        return Err(Error::Conflict {
            kind: K::KIND,
            name: name.to_string(),
        });
    }

    let changed = merge(&mut live, desired);
    if changed.is_empty() {
        debug!(kind = K::KIND, name = %name, "Resource up to date");
        return Ok(Converged {
            outcome: Outcome::Unchanged,
            object: live,
        });
    }

    let object = store.replace(&live).await?;
    info!(
        kind = K::KIND,
        name = %name,
        namespace = ?namespace,
        fields = ?changed,
        "Updated drifted resource"
    );
    Ok(Converged {
        outcome: Outcome::Updated(changed),
        object,
    })
}

// =============================================================================
// Semantic comparison helpers
// =============================================================================

/// Resource maps are equal when they have the same keys and equal quantities
pub fn resource_lists_equal(
    a: Option<&BTreeMap<String, K8sQuantity>>,
    b: Option<&BTreeMap<String, K8sQuantity>>,
) -> bool {
    let empty = BTreeMap::new();
    let (a, b) = (a.unwrap_or(&empty), b.unwrap_or(&empty));
    a.len() == b.len()
        && a
            .iter()
            .all(|(key, q)| b.get(key).is_some_and(|other| quantity::k8s_equal(q, other)))
}

pub fn resources_equal(a: Option<&ResourceRequirements>, b: Option<&ResourceRequirements>) -> bool {
    resource_lists_equal(
        a.and_then(|r| r.requests.as_ref()),
        b.and_then(|r| r.requests.as_ref()),
    ) && resource_lists_equal(
        a.and_then(|r| r.limits.as_ref()),
        b.and_then(|r| r.limits.as_ref()),
    )
}

type EnvKey<'a> = BTreeMap<&'a str, (Option<&'a str>, Option<&'a EnvVarSource>)>;

fn env_by_name(env: Option<&Vec<EnvVar>>) -> EnvKey<'_> {
    env.into_iter()
        .flatten()
        .map(|e| {
            (
                e.name.as_str(),
                (
                    e.value.as_deref().filter(|v| !v.is_empty()),
                    e.value_from.as_ref(),
                ),
            )
        })
        .collect()
}

/// Env lists are equal when they define the same names with the same values,
/// in any order
pub fn env_equal(a: Option<&Vec<EnvVar>>, b: Option<&Vec<EnvVar>>) -> bool {
    env_by_name(a) == env_by_name(b)
}

fn string_maps_equal(
    a: Option<&BTreeMap<String, String>>,
    b: Option<&BTreeMap<String, String>>,
) -> bool {
    a.filter(|m| !m.is_empty()) == b.filter(|m| !m.is_empty())
}

// =============================================================================
// Pod workloads
// =============================================================================

/// Accessors shared by StatefulSet and Deployment
pub trait PodWorkload {
    /// Desired replicas, defaulting to 1 like the API server
    fn replicas(&self) -> i32;
    fn set_replicas(&mut self, replicas: Option<i32>);
    fn pod_spec(&self) -> Option<&PodSpec>;
    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec>;
}

macro_rules! pod_workload {
    ($($ty:ty),*) => {
        $(
            impl PodWorkload for $ty {
                fn replicas(&self) -> i32 {
                    self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
                }

                fn set_replicas(&mut self, replicas: Option<i32>) {
                    if let Some(spec) = self.spec.as_mut() {
                        spec.replicas = replicas;
                    }
                }

                fn pod_spec(&self) -> Option<&PodSpec> {
                    self.spec.as_ref()?.template.spec.as_ref()
                }

                fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
                    self.spec.as_mut()?.template.spec.as_mut()
                }
            }
        )*
    };
}

pod_workload!(StatefulSet, Deployment);

fn container<W: PodWorkload>(w: &W) -> Option<&Container> {
    w.pod_spec()?.containers.first()
}

fn container_mut<W: PodWorkload>(w: &mut W) -> Option<&mut Container> {
    w.pod_spec_mut()?.containers.first_mut()
}

fn replicas_differ<W: PodWorkload>(live: &W, desired: &W) -> bool {
    live.replicas() != desired.replicas()
}

fn apply_replicas<W: PodWorkload>(live: &mut W, desired: &W) {
    live.set_replicas(Some(desired.replicas()));
}

fn image_differs<W: PodWorkload>(live: &W, desired: &W) -> bool {
    container(live).and_then(|c| c.image.as_deref())
        != container(desired).and_then(|c| c.image.as_deref())
}

fn apply_image<W: PodWorkload>(live: &mut W, desired: &W) {
    if let (Some(live), Some(desired)) = (container_mut(live), container(desired)) {
        live.image = desired.image.clone();
    }
}

fn resources_differ<W: PodWorkload>(live: &W, desired: &W) -> bool {
    !resources_equal(
        container(live).and_then(|c| c.resources.as_ref()),
        container(desired).and_then(|c| c.resources.as_ref()),
    )
}

fn apply_resources<W: PodWorkload>(live: &mut W, desired: &W) {
    if let (Some(live), Some(desired)) = (container_mut(live), container(desired)) {
        live.resources = desired.resources.clone();
    }
}

fn env_differs<W: PodWorkload>(live: &W, desired: &W) -> bool {
    !env_equal(
        container(live).and_then(|c| c.env.as_ref()),
        container(desired).and_then(|c| c.env.as_ref()),
    )
}

fn apply_env<W: PodWorkload>(live: &mut W, desired: &W) {
    if let (Some(live), Some(desired)) = (container_mut(live), container(desired)) {
        live.env = desired.env.clone();
    }
}

/// volume name -> referenced ConfigMap name
fn config_volumes<W: PodWorkload>(w: &W) -> BTreeMap<&str, &str> {
    w.pod_spec()
        .and_then(|p| p.volumes.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|v| Some((v.name.as_str(), v.config_map.as_ref()?.name.as_str())))
        .collect()
}

fn config_ref_differs<W: PodWorkload>(live: &W, desired: &W) -> bool {
    config_volumes(desired)
        .iter()
        .any(|(volume, cm)| config_volumes(live).get(volume) != Some(cm))
}

fn apply_config_ref<W: PodWorkload>(live: &mut W, desired: &W) {
    let Some(desired_volumes) = desired.pod_spec().and_then(|p| p.volumes.as_ref()) else {
        return;
    };
    let Some(pod) = live.pod_spec_mut() else {
        return;
    };
    let volumes = pod.volumes.get_or_insert_with(Vec::new);
    for wanted in desired_volumes.iter().filter(|v| v.config_map.is_some()) {
        match volumes.iter_mut().find(|v| v.name == wanted.name) {
            Some(existing) => existing.config_map = wanted.config_map.clone(),
            None => volumes.push(wanted.clone()),
        }
    }
}

// =============================================================================
// Services
// =============================================================================

type PortKey = (Option<String>, i32, IntOrString, String);

fn service_ports(svc: &Service) -> Vec<PortKey> {
    let mut ports: Vec<PortKey> = svc
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .into_iter()
        .flatten()
        .map(|p| {
            (
                p.name.clone(),
                p.port,
                p.target_port.clone().unwrap_or(IntOrString::Int(p.port)),
                p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
            )
        })
        .collect();
    ports.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
    ports
}

fn service_selector(svc: &Service) -> Option<&BTreeMap<String, String>> {
    svc.spec.as_ref()?.selector.as_ref()
}

// =============================================================================
// Network policies
// =============================================================================

fn normalize_selector(selector: &LabelSelector) -> LabelSelector {
    LabelSelector {
        match_labels: selector.match_labels.clone().filter(|m| !m.is_empty()),
        match_expressions: selector.match_expressions.clone().filter(|e| !e.is_empty()),
    }
}

fn normalize_peers(peers: Option<&Vec<NetworkPolicyPeer>>) -> Option<Vec<NetworkPolicyPeer>> {
    let peers = peers.filter(|p| !p.is_empty())?;
    Some(
        peers
            .iter()
            .map(|peer| NetworkPolicyPeer {
                ip_block: peer.ip_block.clone(),
                namespace_selector: peer.namespace_selector.as_ref().map(normalize_selector),
                pod_selector: peer.pod_selector.as_ref().map(normalize_selector),
            })
            .collect(),
    )
}

fn normalize_policy_ports(
    ports: Option<&Vec<NetworkPolicyPort>>,
) -> Option<Vec<NetworkPolicyPort>> {
    let ports = ports.filter(|p| !p.is_empty())?;
    Some(
        ports
            .iter()
            .map(|port| NetworkPolicyPort {
                protocol: Some(port.protocol.clone().unwrap_or_else(|| "TCP".to_string())),
                ..port.clone()
            })
            .collect(),
    )
}

fn policy_spec(np: &NetworkPolicy) -> NetworkPolicySpec {
    np.spec.clone().unwrap_or_default()
}

fn pod_selector_of(np: &NetworkPolicy) -> LabelSelector {
    normalize_selector(&policy_spec(np).pod_selector.unwrap_or_default())
}

fn policy_types_of(np: &NetworkPolicy) -> Vec<String> {
    let mut types = policy_spec(np).policy_types.unwrap_or_default();
    types.sort();
    types
}

fn ingress_of(np: &NetworkPolicy) -> Vec<NetworkPolicyIngressRule> {
    policy_spec(np)
        .ingress
        .unwrap_or_default()
        .iter()
        .map(|rule| NetworkPolicyIngressRule {
            from: normalize_peers(rule.from.as_ref()),
            ports: normalize_policy_ports(rule.ports.as_ref()),
        })
        .collect()
}

fn egress_of(np: &NetworkPolicy) -> Vec<NetworkPolicyEgressRule> {
    policy_spec(np)
        .egress
        .unwrap_or_default()
        .iter()
        .map(|rule| NetworkPolicyEgressRule {
            to: normalize_peers(rule.to.as_ref()),
            ports: normalize_policy_ports(rule.ports.as_ref()),
        })
        .collect()
}

fn live_policy_spec(np: &mut NetworkPolicy) -> &mut NetworkPolicySpec {
    np.spec.get_or_insert_with(NetworkPolicySpec::default)
}

// =============================================================================
// Per-kind allow-lists
// =============================================================================

impl Convergent for Namespace {
    const MUTABLE_FIELDS: &'static [MutableField<Self>] = &[MutableField {
        // Only labels we set are enforced; foreign labels are kept
        name: "labels",
        differs: |live, desired| {
            let live_labels = live.metadata.labels.as_ref();
            desired
                .metadata
                .labels
                .iter()
                .flatten()
                .any(|(k, v)| live_labels.and_then(|l| l.get(k)) != Some(v))
        },
        apply: |live, desired| {
            let labels = live.metadata.labels.get_or_insert_with(BTreeMap::new);
            for (k, v) in desired.metadata.labels.iter().flatten() {
                labels.insert(k.clone(), v.clone());
            }
        },
    }];
}

impl Convergent for ResourceQuota {
    const MUTABLE_FIELDS: &'static [MutableField<Self>] = &[MutableField {
        name: "hard",
        differs: |live, desired| {
            !resource_lists_equal(
                live.spec.as_ref().and_then(|s| s.hard.as_ref()),
                desired.spec.as_ref().and_then(|s| s.hard.as_ref()),
            )
        },
        apply: |live, desired| {
            live.spec.get_or_insert_with(Default::default).hard =
                desired.spec.as_ref().and_then(|s| s.hard.clone());
        },
    }];
}

impl Convergent for ConfigMap {
    const MUTABLE_FIELDS: &'static [MutableField<Self>] = &[MutableField {
        name: "data",
        differs: |live, desired| !string_maps_equal(live.data.as_ref(), desired.data.as_ref()),
        apply: |live, desired| live.data = desired.data.clone(),
    }];
}

impl Convergent for Service {
    const MUTABLE_FIELDS: &'static [MutableField<Self>] = &[
        MutableField {
            name: "selector",
            differs: |live, desired| {
                !string_maps_equal(service_selector(live), service_selector(desired))
            },
            apply: |live, desired| {
                live.spec.get_or_insert_with(Default::default).selector =
                    service_selector(desired).cloned();
            },
        },
        MutableField {
            name: "ports",
            differs: |live, desired| service_ports(live) != service_ports(desired),
            apply: |live, desired| {
                live.spec.get_or_insert_with(Default::default).ports =
                    desired.spec.as_ref().and_then(|s| s.ports.clone());
            },
        },
    ];
}

impl Convergent for StatefulSet {
    const MUTABLE_FIELDS: &'static [MutableField<Self>] = &[
        MutableField {
            name: "replicas",
            differs: replicas_differ::<StatefulSet>,
            apply: apply_replicas::<StatefulSet>,
        },
        MutableField {
            name: "image",
            differs: image_differs::<StatefulSet>,
            apply: apply_image::<StatefulSet>,
        },
        MutableField {
            name: "resources",
            differs: resources_differ::<StatefulSet>,
            apply: apply_resources::<StatefulSet>,
        },
        MutableField {
            name: "config",
            differs: config_ref_differs::<StatefulSet>,
            apply: apply_config_ref::<StatefulSet>,
        },
    ];
}

impl Convergent for Deployment {
    const MUTABLE_FIELDS: &'static [MutableField<Self>] = &[
        MutableField {
            name: "replicas",
            differs: replicas_differ::<Deployment>,
            apply: apply_replicas::<Deployment>,
        },
        MutableField {
            name: "image",
            differs: image_differs::<Deployment>,
            apply: apply_image::<Deployment>,
        },
        MutableField {
            name: "resources",
            differs: resources_differ::<Deployment>,
            apply: apply_resources::<Deployment>,
        },
        MutableField {
            name: "env",
            differs: env_differs::<Deployment>,
            apply: apply_env::<Deployment>,
        },
    ];
}

impl Convergent for NetworkPolicy {
    const MUTABLE_FIELDS: &'static [MutableField<Self>] = &[
        MutableField {
            name: "podSelector",
            differs: |live, desired| pod_selector_of(live) != pod_selector_of(desired),
            apply: |live, desired| {
                live_policy_spec(live).pod_selector = policy_spec(desired).pod_selector;
            },
        },
        MutableField {
            name: "policyTypes",
            differs: |live, desired| policy_types_of(live) != policy_types_of(desired),
            apply: |live, desired| {
                live_policy_spec(live).policy_types = policy_spec(desired).policy_types;
            },
        },
        MutableField {
            name: "ingress",
            differs: |live, desired| ingress_of(live) != ingress_of(desired),
            apply: |live, desired| {
                live_policy_spec(live).ingress = policy_spec(desired).ingress;
            },
        },
        MutableField {
            name: "egress",
            differs: |live, desired| egress_of(live) != egress_of(desired),
            apply: |live, desired| {
                live_policy_spec(live).egress = policy_spec(desired).egress;
            },
        },
    ];
}
