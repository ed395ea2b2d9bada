use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tenant is the Schema for the tenants API.
///
/// A Tenant is cluster-scoped: it owns a dedicated namespace and everything
/// provisioned inside it.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "tenants.example.com",
    version = "v1",
    kind = "Tenant",
    plural = "tenants",
    shortname = "tn",
    status = "TenantStatus",
    printcolumn = r#"{"name":"Display Name", "type":"string", "jsonPath":".spec.displayName"}"#,
    printcolumn = r#"{"name":"Namespace", "type":"string", "jsonPath":".status.namespace"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TenantSpec {
    /// Human-readable name shown in dashboards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Tenant-wide quota applied to the tenant namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,

    /// API server configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerSpec>,

    /// Cache service (Redis) configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheSpec>,

    /// Image registry configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistrySpec>,

    /// Network isolation rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_policy: Option<NetworkPolicySpec>,
}

/// Limit/request pair for a single resource (e.g., "500m", "2Gi")
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
}

impl ResourceLimit {
    pub fn is_empty(&self) -> bool {
        self.limit.is_none() && self.request.is_none()
    }
}

/// CPU, memory and storage quantities
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<ResourceLimit>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<ResourceLimit>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<ResourceLimit>,
}

impl ResourceSpec {
    /// True when no quantity is set at all
    pub fn is_empty(&self) -> bool {
        [&self.cpu, &self.memory, &self.storage]
            .into_iter()
            .all(|r| r.as_ref().is_none_or(ResourceLimit::is_empty))
    }
}

/// API server deployment configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    /// Number of replicas (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Container image (defaults to the built-in server image)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,

    /// Extra environment variables, applied on top of the built-in baseline
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVarSpec>,
}

/// Cache service configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheSpec {
    /// Number of replicas (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,

    /// Size of the data volume claim (defaults to 1Gi)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<ResourceLimit>,

    /// Extra redis.conf directives, rendered one `key value` line each
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

/// Image registry configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,

    /// Base domain under which tenant images are published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_domain: Option<String>,
}

/// Environment variable override for the API server
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSpec {
    pub name: String,

    /// Literal value; ignored when `valueFrom` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<EnvVarSource>,
}

/// Reference to a ConfigMap or Secret key
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<KeySelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<KeySelector>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeySelector {
    /// Name of the ConfigMap or Secret
    pub name: String,

    pub key: String,

    /// When true, a missing object or key is not an error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

/// Network isolation configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicySpec {
    /// Whether isolation rules are created (defaults to true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Namespaces allowed to reach the API server
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_namespaces: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress_rules: Vec<NetworkRule>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress_rules: Vec<NetworkRule>,
}

impl NetworkPolicySpec {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// A custom ingress or egress rule
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Pod labels of allowed sources (ingress); empty means any source
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub from: BTreeMap<String, String>,

    /// Pod labels of allowed destinations (egress); empty means any destination
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub to: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    /// TCP, UDP or SCTP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Port number; 0 means all ports
    #[serde(default)]
    pub port: i32,
}

/// Observed state of a Tenant
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TenantStatus {
    /// Lifecycle phase; unset until the first reconciliation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<TenantPhase>,

    /// Name of the namespace provisioned for this tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_status: Option<ComponentStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_status: Option<ComponentStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_policy_status: Option<ComponentStatus>,

    /// Observed generation of the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Kubernetes-style conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Tenant lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum TenantPhase {
    /// Tenant has been observed but nothing is provisioned yet
    #[default]
    Pending,
    /// Namespace and components are being created
    Provisioning,
    /// All components report running
    Running,
    /// The spec cannot be realised; waits for a spec change
    Failed,
    /// Deletion requested, cleanup in progress
    Terminating,
}

impl TenantPhase {
    pub const ALL: [TenantPhase; 5] = [
        TenantPhase::Pending,
        TenantPhase::Provisioning,
        TenantPhase::Running,
        TenantPhase::Failed,
        TenantPhase::Terminating,
    ];
}

impl std::fmt::Display for TenantPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TenantPhase::Pending => write!(f, "Pending"),
            TenantPhase::Provisioning => write!(f, "Provisioning"),
            TenantPhase::Running => write!(f, "Running"),
            TenantPhase::Failed => write!(f, "Failed"),
            TenantPhase::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Phase of a single tenant component
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum ComponentPhase {
    #[default]
    Pending,
    Provisioning,
    Running,
    /// Some but not all replicas are ready
    Degraded,
    Failed,
}

impl std::fmt::Display for ComponentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentPhase::Pending => write!(f, "Pending"),
            ComponentPhase::Provisioning => write!(f, "Provisioning"),
            ComponentPhase::Running => write!(f, "Running"),
            ComponentPhase::Degraded => write!(f, "Degraded"),
            ComponentPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Derived status of one component, recomputed on every reconciliation
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    pub phase: ComponentPhase,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub ready_replicas: i32,

    #[serde(default)]
    pub total_replicas: i32,
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Tenant {
    /// Current phase, `None` until the first status write
    pub fn phase(&self) -> Option<TenantPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// Namespace recorded in status, if any
    pub fn recorded_namespace(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.namespace.as_deref())
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
