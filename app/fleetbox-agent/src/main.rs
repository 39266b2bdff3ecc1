//! The fleetbox host agent.
//!
//! Runs on every GPU instance: takes over the instance row the scaling
//! controller pre-created, keeps a liveness heartbeat, pre-warms waiting
//! mandelboxes up to the granted capacity, binds host resources to each
//! mandelbox, serves the client's JSON transport endpoint, and drains
//! itself when the datastore says so. Besides the machine being shut down
//! underneath it, the only way out of `main` is the shutdown path at the
//! bottom of `run`.

mod auth;
mod config;
mod events;
mod heartbeat;
mod http;
mod metrics;
mod runtime;
mod spinup;
mod state;
mod sweeper;
mod tls;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fleetbox_core::environment;
use fleetbox_core::Dirs;
use fleetbox_db::hasura::{HasuraConfig, HasuraRepository};
use fleetbox_db::subscriptions::{host_subscriptions, SubscriptionClient};
use fleetbox_db::{MemoryRepository, RegisterOutcome};
use fleetbox_mandelbox::{MandelboxRegistry, Protocol, ResourceBroker};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{AgentConfig, HTTPS_PORT};
use crate::metrics::Metrics;
use crate::runtime::{ContainerRuntime, DockerRuntime, NullRuntime};
use crate::state::{Agent, HostDatastore, TransportMap};

/// How long shutdown waits for tracked workers.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetbox_agent=info,fleetbox=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = AgentConfig::load().context("loading agent configuration")?;
    info!(
        commit = %environment::client_commit_hash(),
        environment = %environment::app_environment(),
        "starting fleetbox host agent"
    );

    run(config).await
}

async fn run(config: AgentConfig) -> Result<()> {
    let env = environment::app_environment();

    initialize_filesystem(&config)?;
    let dirs = Dirs::new(&config.fleet_dir, &config.temp_dir);

    let gpu_count = if environment::is_running_in_ci() {
        0
    } else {
        config.gpu_count
    };
    let broker = Arc::new(ResourceBroker::new(gpu_count));
    broker.ports.reserve(HTTPS_PORT, Protocol::Tcp);

    let datastore = if env.is_local_without_db() {
        info!("running without a database, datastore calls are disabled");
        HostDatastore::disabled(Arc::new(MemoryRepository::new()))
    } else {
        let repository = HasuraRepository::new(HasuraConfig {
            url: config.database_url.clone(),
            admin_secret: config.database_secret.clone(),
        })
        .context("building datastore client")?;
        HostDatastore::new(Arc::new(repository))
    };

    let runtime: Arc<dyn ContainerRuntime> = if config.engine_socket.exists() {
        Arc::new(DockerRuntime::new(&config.engine_socket))
    } else {
        warn!(
            socket = %config.engine_socket.display(),
            "container engine socket not found, using the null engine"
        );
        Arc::new(NullRuntime::new())
    };

    let (death_tx, death_rx) = mpsc::channel(32);
    let agent = Arc::new(Agent {
        dirs,
        broker,
        registry: Arc::new(MandelboxRegistry::new()),
        datastore,
        runtime,
        // Signature verification comes from the identity-provider
        // integration; the default verifier only passes the claims checks.
        verifier: Arc::new(auth::InsecureVerifier),
        metrics: Arc::new(Metrics::new(gpu_count)),
        transport: TransportMap::default(),
        cancel: CancellationToken::new(),
        tracker: TaskTracker::new(),
        death_tx,
        config,
    });

    // Take over our pre-created row. A mismatch is a permanent startup
    // failure; an already-draining row means the backend no longer wants
    // this host, which is a clean shutdown, not an error.
    match heartbeat::register_instance(&agent).await {
        Ok(RegisterOutcome::Registered) => {}
        Ok(RegisterOutcome::AlreadyDraining) => {
            info!("row already marked draining, shutting down");
            agent.cancel.cancel();
        }
        Err(e) => {
            uninitialize_filesystem(&agent.config);
            bail!("failed to register instance: {e}");
        }
    }

    let heartbeat = heartbeat::start(Arc::clone(&agent));

    agent.tracker.spawn(sweeper::run(Arc::clone(&agent)));

    let tls_config =
        tls::server_config(&agent.config.private_dir).context("preparing TLS material")?;
    let (server_tx, server_rx) = mpsc::channel(100);
    let router = http::router(Arc::clone(&agent), server_tx);
    agent.tracker.spawn(http::serve(
        tls_config,
        router,
        HTTPS_PORT,
        agent.cancel.clone(),
    ));

    let (subscription_tx, subscription_rx) = mpsc::channel(100);
    if agent.datastore.is_enabled() {
        let mut client = SubscriptionClient::new(
            agent.config.database_ws_url.clone(),
            agent.config.database_secret.clone(),
        );
        client.set_subscriptions(host_subscriptions(&agent.config.instance_id));
        let cancel = agent.cancel.clone();
        agent.tracker.spawn(async move {
            if let Err(e) = client.run(cancel, subscription_tx).await {
                error!(error = %e, "subscription client failed");
            }
        });
    }

    // Warm up as many zygotes as the scaling controller granted us. The
    // controller assigns users to them by flipping their rows to
    // ALLOCATED.
    match agent
        .datastore
        .instance_capacity(&agent.config.instance_id)
        .await
    {
        Ok(capacity) => agent.spin_up_waiting_mandelboxes(capacity).await,
        Err(e) => error!(error = %e, "couldn't read granted capacity"),
    }

    // The event loop runs on its own keepalive so container deaths during
    // shutdown still get processed.
    let keepalive = CancellationToken::new();
    let event_loop = tokio::spawn(events::event_loop(
        Arc::clone(&agent),
        keepalive.clone(),
        server_rx,
        subscription_rx,
        death_rx,
    ));

    tokio::select! {
        () = shutdown_signal() => info!("got an interrupt or SIGTERM"),
        () = agent.cancel.cancelled() => info!("root context cancelled"),
    }

    info!("beginning host agent shutdown procedure");
    agent.cancel.cancel();

    // Clear the zygotes first so they don't block the workers below, and
    // without triggering further datastore events.
    agent.stop_waiting_mandelboxes().await;

    agent.tracker.close();
    if tokio::time::timeout(SHUTDOWN_WAIT, agent.tracker.wait())
        .await
        .is_err()
    {
        warn!("workers still running after shutdown grace period");
    }

    // Stop processing events only after the workers are done.
    keepalive.cancel();
    let _ = event_loop.await;

    uninitialize_filesystem(&agent.config);

    // Mark ourselves draining, emit the final heartbeat, then remove our
    // row (cascading our mandelbox rows).
    if let Err(e) = agent
        .datastore
        .mark_draining(&agent.config.instance_id)
        .await
    {
        error!(error = %e, "failed to mark instance draining");
    }
    heartbeat.stop().await;
    if let Err(e) = agent
        .datastore
        .unregister_instance(&agent.config.instance_id)
        .await
    {
        error!(error = %e, "failed to remove instance row");
    }

    info!("finished host agent shutdown procedure");
    Ok(())
}

/// Creates the on-disk roots. A pre-existing fleet directory means a
/// previous run did not clean up; its contents are untrusted, so startup
/// fails rather than adopting them.
fn initialize_filesystem(config: &AgentConfig) -> Result<()> {
    if config.fleet_dir.exists() {
        bail!(
            "directory {} already exists; refusing to start over stale state",
            config.fleet_dir.display()
        );
    }
    std::fs::create_dir_all(&config.fleet_dir).context("creating fleet dir")?;
    std::fs::create_dir_all(&config.temp_dir).context("creating temp dir")?;
    std::fs::create_dir_all(&config.private_dir).context("creating private dir")?;
    Ok(())
}

fn uninitialize_filesystem(config: &AgentConfig) {
    for dir in [&config.fleet_dir, &config.temp_dir, &config.private_dir] {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(dir = %dir.display(), error = %e, "failed to remove directory");
            }
        } else {
            info!(dir = %dir.display(), "removed directory");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
