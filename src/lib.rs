pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod identity;
pub mod resources;
pub mod store;

pub use config::{ConfigError, LogFormat, OperatorConfig};
pub use controller::{
    BackoffConfig, Context, Error, FINALIZER, Next, Result, error_policy, reconcile,
    reconcile_tenant,
};
pub use crd::Tenant;
pub use health::{HealthState, Metrics};
pub use identity::{HttpIdentityClient, IdentityError, IdentityService};
pub use store::{InMemoryStore, KubeStore, ResourceStore};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, ResourceQuota, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::runtime::Controller;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client};
use tokio::task::JoinHandle;

/// Run the Tenant controller until `shutdown` resolves or its event stream ends.
///
/// Watches Tenants plus every kind a tenant owns, so an out-of-band edit to a
/// sub-resource triggers a reconcile of its owning tenant. Once `shutdown`
/// resolves no new reconciles start and the call returns when the ones in
/// flight have finished.
pub async fn run_controller<G>(
    client: Client,
    identity: Arc<dyn IdentityService>,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
    shutdown: G,
) where
    G: Future<Output = ()> + Send + Sync + 'static,
{
    tracing::info!(
        identity_service = %config.identity_service_url,
        concurrency = config.max_concurrent_reconciles,
        "Starting controller for Tenant resources"
    );

    if let Some(ref state) = health_state {
        state.set_ready(true);
    }

    let store = Arc::new(KubeStore::new(client.clone()));
    let concurrency = config.max_concurrent_reconciles;
    let ctx = Arc::new(Context::new(store, identity, config, health_state.clone()));

    let watcher_config = WatcherConfig::default().any_semantic();

    let controller = Controller::new(Api::<Tenant>::all(client.clone()), watcher_config.clone());
    let tenants = controller.store();

    controller
        .owns(Api::<Namespace>::all(client.clone()), watcher_config.clone())
        .owns(Api::<ResourceQuota>::all(client.clone()), watcher_config.clone())
        .owns(Api::<ConfigMap>::all(client.clone()), watcher_config.clone())
        .owns(Api::<Service>::all(client.clone()), watcher_config.clone())
        .owns(Api::<StatefulSet>::all(client.clone()), watcher_config.clone())
        .owns(Api::<Deployment>::all(client.clone()), watcher_config.clone())
        .owns(Api::<NetworkPolicy>::all(client), watcher_config)
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .graceful_shutdown_on(shutdown)
        .run(reconcile::<KubeStore>, error_policy::<KubeStore>, ctx)
        .for_each(|result| {
            let tenants = tenants.clone();
            let health_state = health_state.clone();
            async move {
                match result {
                    Ok((obj, _action)) => {
                        tracing::debug!(tenant = %obj.name, "Reconciled");
                    }
                    Err(e) => {
                        // Watch events for a tenant that was just deleted are expected
                        let is_not_found = matches!(
                            &e,
                            kube::runtime::controller::Error::ReconcilerFailed(err, _)
                                if err.is_not_found()
                        );
                        if is_not_found {
                            tracing::debug!("Object no longer exists (likely deleted): {:?}", e);
                        } else {
                            tracing::error!("Reconciliation error: {:?}", e);
                        }
                    }
                }
                if let Some(state) = health_state {
                    state.metrics.observe_tenants(&tenants.state());
                }
            }
        })
        .await;

    tracing::info!("Controller stopped");
}

/// Give a stopping controller task up to `grace` to finish its in-flight
/// reconciles. Returns false when the task had to be aborted.
pub async fn drain(mut task: JoinHandle<()>, grace: Duration) -> bool {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Controller task failed while draining");
            true
        }
        Err(_) => {
            tracing::warn!(?grace, "Grace period elapsed, aborting in-flight reconciles");
            task.abort();
            false
        }
    }
}
