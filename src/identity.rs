//! Identity-service client
//!
//! The identity service keeps one record per tenant. It lives outside the
//! cluster, so tenant records are not removed by owner-reference cascades and
//! must be registered and deregistered explicitly.
//!
//! Protocol:
//! - `GET /api/tenants` returns `{"status":"success","tenants":["id", ...]}`
//! - `POST /api/tenants` with `{"tenantId":"<id>","adminUserId":"system"}` returns 201
//! - `DELETE /api/tenants/{id}` returns 200

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

/// Administrative principal attached to every new tenant record
pub const DEFAULT_ADMIN_USER: &str = "system";

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("request to identity service failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("identity service returned {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
}

/// Operations the controller needs from the identity service
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// List all tenant identities known to the service
    async fn list_tenants(&self) -> Result<Vec<String>, IdentityError>;

    /// Create a tenant record
    async fn register_tenant(&self, tenant_id: &str) -> Result<(), IdentityError>;

    /// Remove a tenant record
    async fn deregister_tenant(&self, tenant_id: &str) -> Result<(), IdentityError>;
}

/// Register `tenant_id` unless the service already knows it.
///
/// Membership is re-queried on every call; the service is the source of truth
/// and may be edited out of band. Returns true when a record was created.
pub async fn ensure_registered(
    identity: &dyn IdentityService,
    tenant_id: &str,
) -> Result<bool, IdentityError> {
    let tenants = identity.list_tenants().await?;
    if tenants.iter().any(|t| t == tenant_id) {
        debug!(tenant = %tenant_id, "Tenant already registered with identity service");
        return Ok(false);
    }

    identity.register_tenant(tenant_id).await?;
    info!(tenant = %tenant_id, "Registered tenant with identity service");
    Ok(true)
}

#[derive(Deserialize, Debug)]
struct ListTenantsResponse {
    #[serde(default)]
    tenants: Vec<String>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CreateTenantRequest<'a> {
    tenant_id: &'a str,
    admin_user_id: &'a str,
}

/// HTTP implementation of [`IdentityService`]
#[derive(Clone, Debug)]
pub struct HttpIdentityClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIdentityClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, IdentityError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check_status(
        response: reqwest::Response,
        expected: reqwest::StatusCode,
        operation: &str,
    ) -> Result<reqwest::Response, IdentityError> {
        if response.status() == expected {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, "Identity service {} failed", operation);
        Err(IdentityError::UnexpectedStatus {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl IdentityService for HttpIdentityClient {
    async fn list_tenants(&self) -> Result<Vec<String>, IdentityError> {
        let url = format!("{}/api/tenants", self.base_url);
        debug!(url = %url, "Listing identity-service tenants");

        let response = self.client.get(&url).send().await?;
        let response = Self::check_status(response, reqwest::StatusCode::OK, "list").await?;

        let payload: ListTenantsResponse = response.json().await?;
        Ok(payload.tenants)
    }

    async fn register_tenant(&self, tenant_id: &str) -> Result<(), IdentityError> {
        let url = format!("{}/api/tenants", self.base_url);
        let request = CreateTenantRequest {
            tenant_id,
            admin_user_id: DEFAULT_ADMIN_USER,
        };

        let response = self.client.post(&url).json(&request).send().await?;
        Self::check_status(response, reqwest::StatusCode::CREATED, "register").await?;
        Ok(())
    }

    async fn deregister_tenant(&self, tenant_id: &str) -> Result<(), IdentityError> {
        let url = format!("{}/api/tenants/{}", self.base_url, tenant_id);

        let response = self.client.delete(&url).send().await?;
        Self::check_status(response, reqwest::StatusCode::OK, "deregister").await?;
        Ok(())
    }
}
