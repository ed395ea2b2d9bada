//! Unit tests for the Tenant Operator
//!
//! This module contains unit tests for:
//! - Resource generators (Namespace, ResourceQuota, cache, API server)
//! - Network isolation policies
//! - Drift detection and convergence
//! - Status aggregation and conditions
//! - State machine transitions
//! - The reconcile loop against the in-memory store
//! - The identity-service HTTP client

#[path = "../common/mod.rs"]
mod common;

mod converge;
mod network_policy;
mod status;
