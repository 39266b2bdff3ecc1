//! Scheduled scaling events.
//!
//! One ticker per region emits a scale-down event every ten minutes, with
//! up to a minute of jitter so regions don't hit the datastore together.

use std::time::Duration;

use fleetbox_scaling::{EventKind, ScalingEvent};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Base interval between scheduled scale-down passes.
const SCALE_DOWN_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Maximum added jitter.
const MAX_JITTER: Duration = Duration::from_secs(60);

/// Emits scheduled scale-down events for one region until cancelled.
pub async fn run(region: String, events: mpsc::Sender<ScalingEvent>, cancel: CancellationToken) {
    info!(region, "scheduler started");
    loop {
        let jitter = Duration::from_millis(
            rand::rng().random_range(0..=u64::try_from(MAX_JITTER.as_millis()).unwrap_or(60_000)),
        );
        tokio::select! {
            () = cancel.cancelled() => {
                info!(region, "scheduler stopped");
                return;
            }
            () = tokio::time::sleep(SCALE_DOWN_INTERVAL + jitter) => {
                let event = ScalingEvent::new(region.clone(), EventKind::ScheduledScaleDown);
                if events.send(event).await.is_err() {
                    warn!(region, "scaling event channel closed, stopping scheduler");
                    return;
                }
            }
        }
    }
}
