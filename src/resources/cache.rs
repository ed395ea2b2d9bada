//! Cache service (Redis) resource generation
//!
//! Each tenant gets a single-tenant Redis behind a headless service:
//! - ConfigMap `{tenant}-cache-config` with the rendered `redis.conf`
//! - Service `{tenant}-cache` (headless, stable pod DNS for the StatefulSet)
//! - StatefulSet `{tenant}-cache` with one data volume claim per replica

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, ExecAction, KeyToPath,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe,
    Service, ServicePort, ServiceSpec, TCPSocketAction, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::controller::{Error, Result};
use crate::crd::{CacheSpec, Tenant};
use crate::resources::common::{
    ResourceDefaults, TENANT_LABEL, component_labels, container_resources, object_meta,
    spec_quantity,
};
use crate::resources::quantity;

pub const COMPONENT: &str = "cache";
pub const DEFAULT_IMAGE: &str = "redis:7-alpine";
pub const PORT: i32 = 6379;
pub const PORT_NAME: &str = "redis";
pub const CONFIG_KEY: &str = "redis.conf";
pub const DATA_VOLUME: &str = "cache-data";
pub const CONFIG_VOLUME: &str = "cache-config";
pub const DEFAULT_STORAGE: &str = "1Gi";

pub const RESOURCE_DEFAULTS: ResourceDefaults = ResourceDefaults {
    cpu_request: "100m",
    cpu_limit: "300m",
    memory_request: "128Mi",
    memory_limit: "256Mi",
};

pub fn cache_name(tenant: &str) -> String {
    format!("{tenant}-cache")
}

pub fn config_map_name(tenant: &str) -> String {
    format!("{tenant}-cache-config")
}

/// In-cluster URL of the tenant cache
pub fn cache_url(tenant: &str) -> String {
    format!("redis://{}:{}", cache_name(tenant), PORT)
}

/// Pod selector shared by the service and the StatefulSet
pub fn selector_labels(tenant: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), COMPONENT.to_string()),
        (TENANT_LABEL.to_string(), tenant.to_string()),
    ])
}

fn pod_labels(tenant: &str) -> BTreeMap<String, String> {
    let mut labels = component_labels(tenant, COMPONENT);
    labels.extend(selector_labels(tenant));
    labels
}

fn cache_spec(tenant: &Tenant) -> CacheSpec {
    tenant.spec.cache.clone().unwrap_or_default()
}

/// Render `redis.conf`: fixed base directives then overrides in key order.
pub fn render_config(spec: &CacheSpec, maxmemory_bytes: i128) -> String {
    let mut lines = vec![
        format!("port {PORT}"),
        "bind 0.0.0.0".to_string(),
        "protected-mode yes".to_string(),
        "daemonize no".to_string(),
        format!("maxmemory {maxmemory_bytes}"),
        "maxmemory-policy allkeys-lru".to_string(),
        "appendonly yes".to_string(),
        "appendfsync everysec".to_string(),
        "loglevel notice".to_string(),
        "logfile \"\"".to_string(),
    ];
    lines.extend(spec.config.iter().map(|(k, v)| format!("{k} {v}")));
    lines.push(String::new());
    lines.join("\n")
}

/// Generate the cache ConfigMap
pub fn generate_config_map(tenant: &Tenant) -> Result<ConfigMap> {
    let name = tenant.name_any();
    let spec = cache_spec(tenant);

    let memory_limit = spec
        .resources
        .as_ref()
        .and_then(|r| r.memory.as_ref())
        .and_then(|m| m.limit.as_deref())
        .unwrap_or(RESOURCE_DEFAULTS.memory_limit);
    let maxmemory = quantity::parse(memory_limit)
        .map_err(|e| Error::InvalidConfig(format!("cache.memory.limit: {e}")))?
        .ceil_units();

    Ok(ConfigMap {
        metadata: object_meta(
            tenant,
            config_map_name(&name),
            component_labels(&name, COMPONENT),
        )?,
        data: Some(BTreeMap::from([(
            CONFIG_KEY.to_string(),
            render_config(&spec, maxmemory),
        )])),
        ..Default::default()
    })
}

/// Generate the headless cache Service
pub fn generate_service(tenant: &Tenant) -> Result<Service> {
    let name = tenant.name_any();
    Ok(Service {
        metadata: object_meta(tenant, cache_name(&name), component_labels(&name, COMPONENT))?,
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
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

/// Generate the cache StatefulSet
pub fn generate_statefulset(tenant: &Tenant) -> Result<StatefulSet> {
    let name = tenant.name_any();
    let spec = cache_spec(tenant);

    let resources = container_resources(spec.resources.as_ref(), RESOURCE_DEFAULTS, "cache")?;
    let storage = spec
        .storage
        .as_ref()
        .and_then(|s| s.request.as_deref().or(s.limit.as_deref()))
        .unwrap_or(DEFAULT_STORAGE);
    let storage = spec_quantity("cache.storage", storage)?;

    let container = Container {
        name: "redis".to_string(),
        image: Some(spec.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string())),
        command: Some(vec![
            "redis-server".to_string(),
            format!("/etc/redis/{CONFIG_KEY}"),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some(PORT_NAME.to_string()),
            container_port: PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        resources: Some(resources),
        volume_mounts: Some(vec![
            VolumeMount {
                name: DATA_VOLUME.to_string(),
                mount_path: "/data".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: CONFIG_VOLUME.to_string(),
                mount_path: "/etc/redis".to_string(),
                ..Default::default()
            },
        ]),
        liveness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::String(PORT_NAME.to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(15),
            period_seconds: Some(20),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec!["redis-cli".to_string(), "ping".to_string()]),
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            ..Default::default()
        }),
        ..Default::default()
    };

    let config_volume = Volume {
        name: CONFIG_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map_name(&name),
            items: Some(vec![KeyToPath {
                key: CONFIG_KEY.to_string(),
                path: CONFIG_KEY.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let claim = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            labels: Some(component_labels(&name, COMPONENT)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), storage)])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(StatefulSet {
        metadata: object_meta(tenant, cache_name(&name), component_labels(&name, COMPONENT))?,
        spec: Some(StatefulSetSpec {
            service_name: Some(cache_name(&name)),
            replicas: Some(spec.replicas.unwrap_or(1)),
            selector: LabelSelector {
                match_labels: Some(selector_labels(&name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels(&name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![config_volume]),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![claim]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

