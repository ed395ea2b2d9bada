//! Probe and metrics endpoints
//!
//! - `/healthz` answers while the process runs
//! - `/readyz` answers 200 once the controller has started and until shutdown
//! - `/metrics` serves the Prometheus text exposition

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::{Metric, Registry};
use tokio::net::TcpListener;

use crate::crd::{Tenant, TenantPhase};

const METRIC_PREFIX: &str = "tenant_operator";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub tenant: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ComponentLabels {
    pub tenant: String,
    pub component: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub phase: String,
}

type DurationFamily = Family<ReconcileLabels, Histogram, fn() -> Histogram>;

fn duration_histogram() -> Histogram {
    // 1ms up to roughly 16s
    Histogram::new(exponential_buckets(0.001, 2.0, 15))
}

/// Operator metrics, all registered under the `tenant_operator_` prefix
pub struct Metrics {
    pub reconciliations_total: Family<ReconcileLabels, Counter>,
    pub reconciliation_errors_total: Family<ReconcileLabels, Counter>,
    pub reconcile_duration_seconds: DurationFamily,
    /// Tenants per lifecycle phase, recounted from the watch cache
    pub tenants_total: Family<PhaseLabels, Gauge>,
    pub component_replicas_desired: Family<ComponentLabels, Gauge>,
    pub component_replicas_ready: Family<ComponentLabels, Gauge>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn register<M: Metric + Clone>(registry: &mut Registry, name: &str, help: &str, metric: M) -> M {
    registry.register(format!("{METRIC_PREFIX}_{name}"), help, metric.clone());
    metric
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let r = &mut registry;

        let reconciliations_total =
            register(r, "reconciliations", "Successful tenant reconciliations", Family::default());
        let reconciliation_errors_total = register(
            r,
            "reconciliation_errors",
            "Tenant reconciliations that returned an error",
            Family::default(),
        );
        let reconcile_duration_seconds = register(
            r,
            "reconcile_duration_seconds",
            "Wall time of successful tenant reconciliations",
            DurationFamily::new_with_constructor(duration_histogram),
        );
        let tenants_total =
            register(r, "tenants_total", "Tenants by lifecycle phase", Family::default());
        let component_replicas_desired = register(
            r,
            "component_replicas_desired",
            "Desired replicas per tenant component",
            Family::default(),
        );
        let component_replicas_ready = register(
            r,
            "component_replicas_ready",
            "Ready replicas per tenant component",
            Family::default(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            tenants_total,
            component_replicas_desired,
            component_replicas_ready,
            registry,
        }
    }

    pub fn record_reconcile(&self, tenant: &str, duration_secs: f64) {
        let labels = ReconcileLabels {
            tenant: tenant.to_string(),
        };
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_error(&self, tenant: &str) {
        self.reconciliation_errors_total
            .get_or_create(&ReconcileLabels {
                tenant: tenant.to_string(),
            })
            .inc();
    }

    /// Recount tenants per phase. A tenant without status counts as Pending,
    /// and every phase is emitted so absent phases read 0 rather than vanish.
    pub fn observe_tenants(&self, tenants: &[Arc<Tenant>]) {
        let mut counts = [0i64; TenantPhase::ALL.len()];
        for tenant in tenants {
            let phase = tenant.phase().unwrap_or_default();
            if let Some(i) = TenantPhase::ALL.iter().position(|p| *p == phase) {
                counts[i] += 1;
            }
        }
        for (phase, count) in TenantPhase::ALL.iter().zip(counts) {
            self.tenants_total
                .get_or_create(&PhaseLabels {
                    phase: phase.to_string(),
                })
                .set(count);
        }
    }

    pub fn set_component_replicas(&self, tenant: &str, component: &str, desired: i64, ready: i64) {
        let labels = ComponentLabels {
            tenant: tenant.to_string(),
            component: component.to_string(),
        };
        self.component_replicas_desired
            .get_or_create(&labels)
            .set(desired);
        self.component_replicas_ready.get_or_create(&labels).set(ready);
    }

    fn render(&self) -> Result<String, std::fmt::Error> {
        let mut body = String::new();
        encode(&mut body, &self.registry)?;
        Ok(body)
    }
}

/// State shared between the controller and the probe server
#[derive(Default)]
pub struct HealthState {
    ready: AtomicBool,
    /// Unix seconds of the last successful reconcile, 0 before the first
    last_reconcile: AtomicI64,
    pub metrics: Metrics,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn mark_reconciled(&self) {
        self.last_reconcile
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_reconcile(&self) -> Option<i64> {
        match self.last_reconcile.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    if !state.is_ready() {
        return (StatusCode::SERVICE_UNAVAILABLE, "not ready".to_string());
    }
    let body = match state.last_reconcile() {
        Some(ts) => format!("ready, last reconcile at {ts}"),
        None => "ready, no reconcile yet".to_string(),
    };
    (StatusCode::OK, body)
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                String::new(),
            )
        }
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the probe endpoints on `addr` until the listener fails
pub async fn run_health_server(
    state: Arc<HealthState>,
    addr: SocketAddr,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Health server listening");
    axum::serve(listener, router(state)).await
}
