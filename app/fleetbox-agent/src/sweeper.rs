//! Stale mandelbox sweeper.
//!
//! An allocation the user never follows up on would otherwise pin
//! capacity forever: rows stuck in ALLOCATED for more than 90 seconds or
//! CONNECTING for more than 10 seconds are deleted from the datastore.
//! Ticks are jittered in `[9.5s, 10.5s]` so hosts don't sweep in
//! lockstep, and one final sweep runs on shutdown.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info};

use crate::state::Agent;

/// ALLOCATED rows older than this are deleted.
pub const STALE_ALLOCATED_AGE: Duration = Duration::from_secs(90);

/// CONNECTING rows older than this are deleted.
pub const STALE_CONNECTING_AGE: Duration = Duration::from_secs(10);

const SWEEP_MIN_MS: u64 = 9_500;
const SWEEP_MAX_MS: u64 = 10_500;

/// Runs the sweeper until the root token is cancelled.
pub async fn run(agent: Arc<Agent>) {
    loop {
        let interval =
            Duration::from_millis(rand::rng().random_range(SWEEP_MIN_MS..=SWEEP_MAX_MS));
        tokio::select! {
            () = agent.cancel.cancelled() => {
                sweep(&agent).await;
                info!("finished stale mandelbox sweeper");
                return;
            }
            () = tokio::time::sleep(interval) => {
                sweep(&agent).await;
            }
        }
    }
}

async fn sweep(agent: &Agent) {
    match agent
        .datastore
        .remove_stale_mandelboxes(STALE_ALLOCATED_AGE, STALE_CONNECTING_AGE)
        .await
    {
        Ok(0) => {}
        Ok(removed) => info!(removed, "deleted stale mandelbox rows"),
        Err(e) => error!(error = %e, "stale mandelbox sweep failed"),
    }
}
