//! Instance registration and the heartbeat worker.
//!
//! Registration takes over the row the scaling controller pre-created for
//! this host; any field mismatch is a permanent startup failure. The
//! heartbeat worker then bumps `updated_at` with a metrics snapshot on a
//! jittered interval. The worker is intentionally NOT tied to the root
//! cancellation: it keeps beating through shutdown so the fleet sees the
//! host as alive until its row is removed, and stops only through the
//! explicit [`Heartbeat::stop`], which emits one final beat first.

use std::sync::Arc;
use std::time::Duration;

use fleetbox_db::{InstanceTakeover, RegisterOutcome};
use fleetbox_error::Result;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::state::Agent;

/// Jitter bounds for the heartbeat interval, in milliseconds. Spacing
/// hosts out keeps them from crowding the datastore in waves.
const HEARTBEAT_MIN_MS: u64 = 55_000;
const HEARTBEAT_MAX_MS: u64 = 65_000;

/// Registers this host by taking over its pre-created instance row.
pub async fn register_instance(agent: &Agent) -> Result<RegisterOutcome> {
    let takeover = InstanceTakeover {
        instance_id: agent.config.instance_id.clone(),
        image_id: agent.config.image_id.clone(),
        region: agent.config.region.clone(),
        instance_type: agent.config.instance_type.clone(),
        client_commit_hash: fleetbox_core::environment::client_commit_hash(),
        ip_addr: agent.config.public_ip.clone(),
        remaining_capacity: agent.config.reported_capacity(),
    };
    let outcome = agent.datastore.register_instance(takeover).await?;
    if outcome == RegisterOutcome::Registered {
        info!(instance_id = %agent.config.instance_id, "registered instance");
    }
    Ok(outcome)
}

/// Handle to the running heartbeat worker.
pub struct Heartbeat {
    stop: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl Heartbeat {
    /// Stops the worker after one final beat and waits for it to finish.
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.handle.await;
    }
}

/// Starts the heartbeat worker. Call after successful registration.
pub fn start(agent: Arc<Agent>) -> Heartbeat {
    // A standalone token: the worker must survive the root cancellation.
    let stop = CancellationToken::new();
    let worker_stop = stop.clone();
    let handle = tokio::spawn(async move {
        worker(agent, worker_stop).await;
    });
    Heartbeat { stop, handle }
}

async fn worker(agent: Arc<Agent>, stop: CancellationToken) {
    write_heartbeat(&agent).await;

    loop {
        tokio::select! {
            () = stop.cancelled() => {
                // One last beat so the row's clock reflects shutdown.
                write_heartbeat(&agent).await;
                info!("finished heartbeat worker");
                return;
            }
            () = tokio::time::sleep(jittered_interval()) => {
                write_heartbeat(&agent).await;
            }
        }
    }
}

async fn write_heartbeat(agent: &Agent) {
    let snapshot = agent.metrics.snapshot(agent.registry.count());
    if let Err(e) = agent
        .datastore
        .write_heartbeat(&agent.config.instance_id, snapshot)
        .await
    {
        error!(error = %e, "failed to write heartbeat");
    }
}

/// A uniformly random interval in `[55s, 65s]`.
fn jittered_interval() -> Duration {
    Duration::from_millis(rand::rng().random_range(HEARTBEAT_MIN_MS..=HEARTBEAT_MAX_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::InsecureVerifier;
    use crate::config::AgentConfig;
    use crate::metrics::Metrics;
    use crate::runtime::NullRuntime;
    use crate::state::{HostDatastore, TransportMap};
    use chrono::Utc;
    use fleetbox_core::Dirs;
    use fleetbox_db::{Instance, InstanceStatus, MemoryRepository};
    use fleetbox_mandelbox::{MandelboxRegistry, ResourceBroker};
    use tokio::sync::mpsc;
    use tokio_util::task::TaskTracker;

    #[test]
    fn interval_stays_within_bounds() {
        for _ in 0..100 {
            let interval = jittered_interval();
            assert!(interval >= Duration::from_millis(HEARTBEAT_MIN_MS));
            assert!(interval <= Duration::from_millis(HEARTBEAT_MAX_MS));
        }
    }

    fn agent_with_repository(repository: Arc<MemoryRepository>) -> Arc<Agent> {
        let (death_tx, _death_rx) = mpsc::channel(8);
        Arc::new(Agent {
            config: AgentConfig {
                instance_id: "i-heartbeat".to_owned(),
                ..AgentConfig::default()
            },
            dirs: Dirs::default(),
            broker: Arc::new(ResourceBroker::with_seed(1, 1)),
            registry: Arc::new(MandelboxRegistry::new()),
            datastore: HostDatastore::new(repository),
            runtime: Arc::new(NullRuntime::new()),
            verifier: Arc::new(InsecureVerifier),
            metrics: Arc::new(Metrics::new(1)),
            transport: TransportMap::default(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            death_tx,
        })
    }

    fn seeded_row() -> Instance {
        Instance {
            id: "i-heartbeat".to_owned(),
            provider: "AWS".to_owned(),
            region: "us-east-1".to_owned(),
            image_id: "img".to_owned(),
            client_sha: "sha".to_owned(),
            ip_addr: "1.1.1.1".to_owned(),
            instance_type: "g4dn.2xlarge".to_owned(),
            remaining_capacity: 2,
            status: InstanceStatus::Active,
            created_at: Utc::now() - chrono::Duration::hours(1),
            updated_at: Utc::now() - chrono::Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn heartbeat_survives_root_cancel_until_explicit_stop() {
        let repository = Arc::new(MemoryRepository::new());
        repository.seed_instances(vec![seeded_row()]);
        let agent = agent_with_repository(Arc::clone(&repository));

        let heartbeat = start(Arc::clone(&agent));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Cancelling the root context must not stop the worker.
        agent.cancel.cancel();
        let after_initial = repository.instances()[0].updated_at;

        // The explicit stop emits a final beat and ends the worker.
        heartbeat.stop().await;
        let after_stop = repository.instances()[0].updated_at;
        assert!(after_stop >= after_initial);

        // No further beats after stop.
        let settled = repository.instances()[0].updated_at;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(repository.instances()[0].updated_at, settled);
    }

    #[tokio::test]
    async fn registration_round_trips_against_a_matching_row() {
        let repository = Arc::new(MemoryRepository::new());
        let mut row = seeded_row();
        row.status = InstanceStatus::PreConnection;
        row.image_id = "localdev-image".to_owned();
        row.client_sha = "local_dev".to_owned();
        repository.seed_instances(vec![row]);

        let agent = agent_with_repository(Arc::clone(&repository));
        let outcome = register_instance(&agent).await.unwrap();
        assert_eq!(outcome, RegisterOutcome::Registered);
        assert_eq!(repository.instances()[0].status, InstanceStatus::Active);

        // Registration is not idempotent on an already-taken row: the
        // status check now fails permanently.
        let err = register_instance(&agent).await.unwrap_err();
        assert!(err.is_mismatch());
    }
}
