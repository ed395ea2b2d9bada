//! In-process identity service that records every call

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tenant_operator::identity::{IdentityError, IdentityService};

#[derive(Default)]
pub struct RecordingIdentityService {
    tenants: Mutex<BTreeSet<String>>,
    pub list_calls: AtomicUsize,
    pub register_calls: AtomicUsize,
    pub deregister_calls: AtomicUsize,
    fail_register: AtomicBool,
    fail_deregister: AtomicBool,
}

impl RecordingIdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(self, tenant: &str) -> Self {
        self.tenants.lock().unwrap().insert(tenant.to_string());
        self
    }

    pub fn is_registered(&self, tenant: &str) -> bool {
        self.tenants.lock().unwrap().contains(tenant)
    }

    pub fn registrations(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    pub fn deregistrations(&self) -> usize {
        self.deregister_calls.load(Ordering::SeqCst)
    }

    pub fn fail_registration(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deregistration(&self, fail: bool) {
        self.fail_deregister.store(fail, Ordering::SeqCst);
    }

    fn unavailable() -> IdentityError {
        IdentityError::UnexpectedStatus {
            status: 503,
            body: "identity service unavailable".to_string(),
        }
    }
}

#[async_trait]
impl IdentityService for RecordingIdentityService {
    async fn list_tenants(&self) -> Result<Vec<String>, IdentityError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.tenants.lock().unwrap().iter().cloned().collect())
    }

    async fn register_tenant(&self, tenant_id: &str) -> Result<(), IdentityError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.tenants.lock().unwrap().insert(tenant_id.to_string());
        Ok(())
    }

    async fn deregister_tenant(&self, tenant_id: &str) -> Result<(), IdentityError> {
        self.deregister_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_deregister.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.tenants.lock().unwrap().remove(tenant_id);
        Ok(())
    }
}
