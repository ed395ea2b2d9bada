//! API server resource generation
//!
//! - Deployment `{tenant}-server`
//! - Service `{tenant}-server` (ClusterIP, load-balanced across replicas)

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapKeySelector, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    HTTPGetAction, PodSpec, PodTemplateSpec, Probe, SecretKeySelector, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::controller::Result;
use crate::crd::{EnvVarSpec, ServerSpec, Tenant};
use crate::resources::cache;
use crate::resources::common::{
    ResourceDefaults, TENANT_LABEL, component_labels, container_resources, object_meta,
};

pub const COMPONENT: &str = "server";
pub const DEFAULT_IMAGE: &str = "neurallog/server:latest";
pub const PORT: i32 = 3030;
pub const PORT_NAME: &str = "http";
pub const HEALTH_PATH: &str = "/health";

pub const RESOURCE_DEFAULTS: ResourceDefaults = ResourceDefaults {
    cpu_request: "100m",
    cpu_limit: "500m",
    memory_request: "128Mi",
    memory_limit: "512Mi",
};

pub fn server_name(tenant: &str) -> String {
    format!("{tenant}-server")
}

/// Pod selector shared by the service, the deployment and network policies
pub fn selector_labels(tenant: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), COMPONENT.to_string()),
        (TENANT_LABEL.to_string(), tenant.to_string()),
    ])
}

fn literal(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Environment every API server gets regardless of spec
pub fn baseline_env(tenant: &Tenant, identity_url: &str) -> Vec<EnvVar> {
    let name = tenant.name_any();
    let mut env = vec![
        literal("APP_ENV", "production"),
        literal("PORT", PORT.to_string()),
        literal("REDIS_URL", cache::cache_url(&name)),
        literal("LOG_LEVEL", "info"),
        literal("TENANT_ID", name.clone()),
        literal("AUTH_URL", identity_url),
    ];
    if let Some(domain) = tenant
        .spec
        .registry
        .as_ref()
        .and_then(|r| r.base_domain.as_ref())
    {
        env.push(literal("REGISTRY_BASE_DOMAIN", domain.clone()));
    }
    env
}

/// Translate a spec override into a container env entry
pub fn to_env_var(spec: &EnvVarSpec) -> EnvVar {
    let value_from = spec.value_from.as_ref().map(|source| EnvVarSource {
        config_map_key_ref: source
            .config_map_key_ref
            .as_ref()
            .map(|r| ConfigMapKeySelector {
                name: r.name.clone(),
                key: r.key.clone(),
                optional: r.optional,
            }),
        secret_key_ref: source.secret_key_ref.as_ref().map(|r| SecretKeySelector {
            name: r.name.clone(),
            key: r.key.clone(),
            optional: r.optional,
        }),
        ..Default::default()
    });

    EnvVar {
        name: spec.name.clone(),
        // A reference takes precedence over a literal
        value: if value_from.is_some() {
            None
        } else {
            spec.value.clone()
        },
        value_from,
    }
}

/// Baseline env with overrides applied by name.
///
/// An override of a baseline variable replaces it in place; new names are
/// appended in spec order.
pub fn merge_env(baseline: Vec<EnvVar>, overrides: &[EnvVarSpec]) -> Vec<EnvVar> {
    let mut env = baseline;
    for spec in overrides {
        let var = to_env_var(spec);
        match env.iter_mut().find(|existing| existing.name == var.name) {
            Some(existing) => *existing = var,
            None => env.push(var),
        }
    }
    env
}

fn http_probe(initial_delay: i32, period: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(HEALTH_PATH.to_string()),
            port: IntOrString::String(PORT_NAME.to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        timeout_seconds: Some(5),
        success_threshold: Some(1),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

/// Generate the API server Deployment
pub fn generate_deployment(tenant: &Tenant, identity_url: &str) -> Result<Deployment> {
    let name = tenant.name_any();
    let spec: ServerSpec = tenant.spec.server.clone().unwrap_or_default();

    let resources = container_resources(spec.resources.as_ref(), RESOURCE_DEFAULTS, "server")?;
    let env = merge_env(baseline_env(tenant, identity_url), &spec.env);

    let container = Container {
        name: "server".to_string(),
        image: Some(spec.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string())),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            name: Some(PORT_NAME.to_string()),
            container_port: PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(env),
        resources: Some(resources),
        readiness_probe: Some(http_probe(5, 10)),
        liveness_probe: Some(http_probe(15, 20)),
        volume_mounts: Some(vec![VolumeMount {
            name: "tmp".to_string(),
            mount_path: "/tmp".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let mut pod_labels = component_labels(&name, COMPONENT);
    pod_labels.extend(selector_labels(&name));

    Ok(Deployment {
        metadata: object_meta(tenant, server_name(&name), component_labels(&name, COMPONENT))?,
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replicas.unwrap_or(1)),
            selector: LabelSelector {
                match_labels: Some(selector_labels(&name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: "tmp".to_string(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Generate the API server Service
pub fn generate_service(tenant: &Tenant) -> Result<Service> {
    let name = tenant.name_any();
    Ok(Service {
        metadata: object_meta(tenant, server_name(&name), component_labels(&name, COMPONENT))?,
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(&name)),
            ports: Some(vec![ServicePort {
                name: Some(PORT_NAME.to_string()),
                port: PORT,
                target_port: Some(IntOrString::String(PORT_NAME.to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}
