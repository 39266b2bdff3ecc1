//! The fleetbox scaling controller.
//!
//! One process serves a set of regions. Per region it runs the default
//! scaling algorithm's event loop; around them it runs the datastore
//! subscription reader, the scheduled ticker, and the HTTP surface for
//! assignment and image-rollout requests. The datastore is the
//! serialization point between controllers; no coordination happens here
//! beyond it.

mod dispatch;
mod hosts;
mod scheduler;
mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use figment::providers::{Env, Serialized};
use figment::Figment;
use fleetbox_core::environment;
use fleetbox_db::hasura::{HasuraConfig, HasuraRepository};
use fleetbox_db::subscriptions::{scaler_subscriptions, SubscriptionClient};
use fleetbox_db::{ConfigRepository, MemoryRepository, ScalerRepository};
use fleetbox_scaling::{DefaultScalingAlgorithm, HostHandler, RetryingHost, ScalingConfig};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::dispatch::Regions;
use crate::hosts::DevHost;

/// Controller configuration, environment-only like the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ScalerSettings {
    /// Regions this controller serves.
    regions: Vec<String>,
    /// Bind address of the HTTP surface.
    bind_address: String,
    /// Datastore GraphQL endpoint (HTTP).
    database_url: String,
    /// Datastore GraphQL endpoint (websocket).
    database_ws_url: String,
    /// Datastore admin secret.
    database_secret: Option<String>,
}

impl Default for ScalerSettings {
    fn default() -> Self {
        Self {
            regions: fleetbox_scaling::config::DEFAULT_ENABLED_REGIONS
                .iter()
                .map(|r| (*r).to_owned())
                .collect(),
            bind_address: "0.0.0.0:7730".to_owned(),
            database_url: "http://localhost:8080/v1/graphql".to_owned(),
            database_ws_url: "ws://localhost:8080/v1/graphql".to_owned(),
            database_secret: None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetbox_scaler=info,fleetbox=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let settings: ScalerSettings = Figment::new()
        .merge(Serialized::defaults(ScalerSettings::default()))
        .merge(Env::prefixed("FLEETBOX_"))
        .extract()
        .context("loading scaler configuration")?;

    info!(
        environment = %environment::app_environment(),
        regions = ?settings.regions,
        "starting fleetbox scaling controller"
    );
    run(settings).await
}

async fn run(settings: ScalerSettings) -> Result<()> {
    let env = environment::app_environment();
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    // One repository serves every region; the datastore serializes their
    // actions.
    let (repository, config_repository): (Arc<dyn ScalerRepository>, Arc<dyn ConfigRepository>) =
        if env.is_local_without_db() {
            info!("running without a database, using the in-memory repository");
            let memory = Arc::new(MemoryRepository::new());
            (Arc::clone(&memory) as _, memory as _)
        } else {
            let hasura = Arc::new(
                HasuraRepository::new(HasuraConfig {
                    url: settings.database_url.clone(),
                    admin_secret: settings.database_secret.clone(),
                })
                .context("building datastore client")?,
            );
            (Arc::clone(&hasura) as _, hasura as _)
        };

    // The frontend-version gate and the per-region buffers have to be in
    // place before the first event is processed.
    let scaling_config = Arc::new(ScalingConfig::new(env));
    scaling_config.populate(config_repository.as_ref()).await;

    // One algorithm task per region; the map is written once here and
    // only read afterwards.
    let mut channels = Vec::new();
    for region in &settings.regions {
        let mut provider = RetryingHost::new(DevHost::default());
        provider
            .initialize(region)
            .await
            .context("initializing host provider")?;

        let algorithm = DefaultScalingAlgorithm::new(
            region.clone(),
            Arc::clone(&repository),
            Arc::new(provider),
            Arc::clone(&scaling_config),
        );

        let (events_tx, events_rx) = mpsc::channel(100);
        channels.push((region.clone(), events_tx.clone()));
        tracker.spawn(algorithm.process_events(events_rx, cancel.clone(), tracker.clone()));
        tracker.spawn(scheduler::run(region.clone(), events_tx, cancel.clone()));
    }
    let regions = Arc::new(Regions::new(channels));

    // Datastore subscriptions: draining instances and version rollouts.
    if !env.is_local_without_db() {
        let (subscription_tx, subscription_rx) = mpsc::channel(100);
        let mut client = SubscriptionClient::new(
            settings.database_ws_url.clone(),
            settings.database_secret.clone(),
        );
        client.set_subscriptions(scaler_subscriptions());
        let client_cancel = cancel.clone();
        tracker.spawn(async move {
            if let Err(e) = client.run(client_cancel, subscription_tx).await {
                error!(error = %e, "subscription client failed");
            }
        });
        tracker.spawn(dispatch::subscription_dispatcher(
            Arc::clone(&regions),
            subscription_rx,
        ));
    }

    // HTTP surface for assignment and image rollouts.
    let router = server::router(Arc::clone(&regions));
    let listener = tokio::net::TcpListener::bind(&settings.bind_address)
        .await
        .with_context(|| format!("binding {}", settings.bind_address))?;
    info!(address = %settings.bind_address, "controller HTTP server listening");
    let server_cancel = cancel.clone();
    tracker.spawn(async move {
        let shutdown = async move { server_cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "controller HTTP server failed");
        }
    });

    tokio::select! {
        () = shutdown_signal() => info!("got an interrupt or SIGTERM"),
        () = cancel.cancelled() => info!("root context cancelled"),
    }

    info!("draining in-flight scaling actions");
    cancel.cancel();
    tracker.close();
    tracker.wait().await;
    info!("scaling controller exited");
    Ok(())
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
