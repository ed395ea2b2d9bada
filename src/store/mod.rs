//! Resource store abstraction
//!
//! Reconcilers talk to the cluster only through [`ResourceStore`]. The
//! production implementation is [`KubeStore`]; [`InMemoryStore`] emulates the
//! parts of API-server behaviour the controller relies on (optimistic
//! concurrency, finalizers, owner-reference and namespace cascades) so the
//! whole reconcile loop can run in tests.

mod cluster;
mod memory;

pub use cluster::KubeStore;
pub use memory::{InMemoryStore, WriteOp, WriteRecord};

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, ResourceQuota, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::controller::{Error, Result};
use crate::crd::Tenant;

/// A resource kind the store knows how to address
pub trait StoredKind:
    Resource<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Kind name used in logs, errors and the in-memory index
    const KIND: &'static str;

    /// Whether objects of this kind live inside a namespace
    const NAMESPACED: bool;

    /// Build the API handle for this kind
    fn api(client: Client, namespace: Option<&str>) -> Result<Api<Self>>;
}

macro_rules! namespaced_kind {
    ($($ty:ty => $kind:literal),* $(,)?) => {
        $(
            impl StoredKind for $ty {
                const KIND: &'static str = $kind;
                const NAMESPACED: bool = true;

                fn api(client: Client, namespace: Option<&str>) -> Result<Api<Self>> {
                    let namespace = namespace.ok_or(Error::MissingObjectKey("metadata.namespace"))?;
                    Ok(Api::namespaced(client, namespace))
                }
            }
        )*
    };
}

macro_rules! cluster_kind {
    ($($ty:ty => $kind:literal),* $(,)?) => {
        $(
            impl StoredKind for $ty {
                const KIND: &'static str = $kind;
                const NAMESPACED: bool = false;

                fn api(client: Client, _namespace: Option<&str>) -> Result<Api<Self>> {
                    Ok(Api::all(client))
                }
            }
        )*
    };
}

namespaced_kind! {
    ConfigMap => "ConfigMap",
    Service => "Service",
    StatefulSet => "StatefulSet",
    Deployment => "Deployment",
    NetworkPolicy => "NetworkPolicy",
    ResourceQuota => "ResourceQuota",
}

cluster_kind! {
    Namespace => "Namespace",
    Tenant => "Tenant",
}

/// Read and write access to cluster objects.
///
/// Writes are single-object and atomic. `replace` carries the object's
/// `resourceVersion`; a stale version fails with [`Error::Conflict`].
#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    /// Fetch an object, `None` when it does not exist
    async fn get<K: StoredKind>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>;

    /// Create an object; an existing object with the same name is a conflict
    async fn create<K: StoredKind>(&self, obj: &K) -> Result<K>;

    /// Replace an object using its resourceVersion as a precondition
    async fn replace<K: StoredKind>(&self, obj: &K) -> Result<K>;

    /// Objects of one kind whose labels match an equality selector such as
    /// `a=b,c=d`. Namespaced kinds are listed within `namespace` only.
    async fn list<K: StoredKind>(
        &self,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<K>>;

    /// Delete an object. Returns false when it was already absent.
    async fn delete<K: StoredKind>(&self, namespace: Option<&str>, name: &str) -> Result<bool>;

    /// Write the status subresource of a tenant
    async fn replace_tenant_status(&self, tenant: &Tenant) -> Result<Tenant>;
}

/// Name of an object, or an error when the document has none
pub(crate) fn object_name<K: Resource>(obj: &K) -> Result<&str> {
    obj.meta()
        .name
        .as_deref()
        .ok_or(Error::MissingObjectKey("metadata.name"))
}
