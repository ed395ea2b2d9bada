use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use super::{ResourceStore, StoredKind, object_name};
use crate::controller::{Error, Result};
use crate::crd::Tenant;
use crate::resources::common::FIELD_MANAGER;

/// [`ResourceStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// Translate a write failure, turning 409 into a retryable conflict
fn write_error<K: StoredKind>(err: kube::Error, name: &str) -> Error {
    match err {
        kube::Error::Api(ref e) if e.code == 409 => Error::Conflict {
            kind: K::KIND,
            name: name.to_string(),
        },
        other => Error::KubeError(other),
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get<K: StoredKind>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        let api = K::api(self.client.clone(), namespace)?;
        Ok(api.get_opt(name).await?)
    }

    async fn create<K: StoredKind>(&self, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let api = K::api(self.client.clone(), obj.meta().namespace.as_deref())?;
        debug!(kind = K::KIND, name = %name, "Creating resource");
        api.create(&post_params(), obj)
            .await
            .map_err(|e| write_error::<K>(e, name))
    }

    async fn replace<K: StoredKind>(&self, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let api = K::api(self.client.clone(), obj.meta().namespace.as_deref())?;
        debug!(
            kind = K::KIND,
            name = %name,
            resource_version = ?obj.resource_version(),
            "Replacing resource"
        );
        api.replace(name, &post_params(), obj)
            .await
            .map_err(|e| write_error::<K>(e, name))
    }

    async fn list<K: StoredKind>(
        &self,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<K>> {
        let api = K::api(self.client.clone(), namespace)?;
        let params = ListParams::default().labels(label_selector);
        Ok(api.list(&params).await?.items)
    }

    async fn delete<K: StoredKind>(&self, namespace: Option<&str>, name: &str) -> Result<bool> {
        let api = K::api(self.client.clone(), namespace)?;
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_tenant_status(&self, tenant: &Tenant) -> Result<Tenant> {
        let name = object_name(tenant)?;
        let api: Api<Tenant> = Api::all(self.client.clone());

        // resourceVersion in a merge patch acts as a precondition
        let patch = json!({
            "metadata": { "resourceVersion": tenant.resource_version() },
            "status": tenant.status,
        });

        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| write_error::<Tenant>(e, name))
    }
}
