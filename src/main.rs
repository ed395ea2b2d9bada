use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tenant_operator::health::{HealthState, run_health_server};
use tenant_operator::{HttpIdentityClient, LogFormat, OperatorConfig, drain, run_controller};

const LEASE_NAME: &str = "tenant-operator-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Time given to in-flight reconciliations after a shutdown signal
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn init_tracing(format: LogFormat) -> Result<(), BoxError> {
    let mut filter = EnvFilter::from_default_env();
    for directive in ["tenant_operator=info", "kube=info", "kube_leader_election=info"] {
        filter = filter.add_directive(directive.parse()?);
    }

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(())
}

fn install_crypto_provider() -> Result<(), BoxError> {
    let installed = rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_ok();
    // Another component may have installed one first
    if installed || rustls::crypto::CryptoProvider::get_default().is_some() {
        Ok(())
    } else {
        Err("no rustls crypto provider available".into())
    }
}

/// Holder id and namespace for the leader lease
fn pod_identity() -> (String, String) {
    let holder = std::env::var("POD_NAME").unwrap_or_else(|_| {
        let fallback = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| format!("tenant-operator-{}", uuid::Uuid::new_v4()));
        warn!(holder = %fallback, "POD_NAME not set, falling back to hostname");
        fallback
    });
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, using 'default'");
        "default".to_string()
    });
    (holder, namespace)
}

/// Block until this replica holds the lease
async fn acquire_leadership(lock: &LeaseLock) {
    info!(lease = LEASE_NAME, "Waiting for leadership");
    loop {
        match lock.try_acquire_or_renew().await {
            Ok(lease) if lease.acquired_lease => {
                info!("Acquired leadership");
                return;
            }
            Ok(_) => info!("Lease held by another replica"),
            Err(e) => warn!(error = %e, "Lease acquisition failed, retrying"),
        }
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
    }
}

/// Keep renewing the lease. Losing it ends the process so the pod restarts
/// into a fresh election instead of running a second controller.
fn spawn_lease_renewal(lock: LeaseLock) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
            match lock.try_acquire_or_renew().await {
                Ok(lease) if lease.acquired_lease => {}
                Ok(_) => {
                    error!("Leadership lost, exiting");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "Lease renewal failed, exiting");
                    std::process::exit(1);
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    install_crypto_provider()?;

    let config = OperatorConfig::from_env()?;
    init_tracing(config.log_format)?;
    info!(
        identity_service = %config.identity_service_url,
        resync = ?config.resync_interval,
        timeout = ?config.reconcile_timeout,
        "Starting tenant-operator"
    );

    let client = Client::try_default().await?;
    let identity = Arc::new(HttpIdentityClient::new(
        config.identity_service_url.clone(),
        config.identity_timeout,
    )?);

    // Probes must answer while this replica waits for the lease
    let health_state = Arc::new(HealthState::new());
    let health_server = {
        let state = health_state.clone();
        let addr = config.health_addr;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(state, addr).await {
                error!(error = %e, "Health server stopped");
            }
        })
    };

    let (holder, namespace) = pod_identity();
    info!(%holder, %namespace, "Joining leader election");
    let lock = LeaseLock::new(
        client.clone(),
        &namespace,
        LeaseLockParams {
            holder_id: holder,
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: LEASE_TTL,
        },
    );
    acquire_leadership(&lock).await;
    let lease_renewal = spawn_lease_renewal(lock);

    // One signal, observed by both the controller and this task
    let shutdown = shutdown_signal().boxed().shared();
    let mut controller = tokio::spawn(run_controller(
        client,
        identity,
        config,
        Some(health_state.clone()),
        shutdown.clone(),
    ));

    tokio::select! {
        res = &mut controller => {
            match res {
                Ok(()) => warn!("Controller stopped without a shutdown signal"),
                Err(e) => error!(error = %e, "Controller task failed"),
            }
        }
        res = health_server => {
            if let Err(e) = res {
                error!(error = %e, "Health server task failed");
            }
        }
        Err(e) = lease_renewal => {
            error!(error = %e, "Lease renewal task failed");
        }
        () = shutdown => {
            info!("Shutdown signal received");
            health_state.set_ready(false);
            info!(grace = ?SHUTDOWN_GRACE_PERIOD, "Draining in-flight reconciliations");
            if drain(controller, SHUTDOWN_GRACE_PERIOD).await {
                info!("In-flight reconciliations finished");
            }
        }
    }

    info!("tenant-operator stopped");
    Ok(())
}

/// Resolve on SIGTERM or ctrl-c. A handler that cannot be installed never resolves.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
