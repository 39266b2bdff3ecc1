//! Event routing.
//!
//! The region map is written once at startup and read by every producer:
//! the subscription reader, the scheduler, and the HTTP endpoints. Events
//! for an unknown region fall back to the first configured region.

use std::collections::HashMap;

use fleetbox_db::subscriptions::SubscriptionEvent;
use fleetbox_db::InstanceStatus;
use fleetbox_scaling::{EventKind, ScalingEvent};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Write-once map from region to its algorithm's event channel.
pub struct Regions {
    channels: HashMap<String, mpsc::Sender<ScalingEvent>>,
    fallback: String,
}

impl Regions {
    /// Builds the map. The first entry becomes the fallback route.
    ///
    /// # Panics
    ///
    /// Panics when no regions are configured; the controller cannot run
    /// without at least one.
    #[must_use]
    pub fn new(channels: Vec<(String, mpsc::Sender<ScalingEvent>)>) -> Self {
        assert!(!channels.is_empty(), "at least one region is required");
        let fallback = channels[0].0.clone();
        Self {
            channels: channels.into_iter().collect(),
            fallback,
        }
    }

    /// Routes an event to its region's algorithm, falling back when the
    /// region is not configured.
    ///
    /// # Errors
    ///
    /// Fails when the target channel is closed (shutdown).
    pub async fn route(
        &self,
        region: &str,
        event: ScalingEvent,
    ) -> Result<(), mpsc::error::SendError<ScalingEvent>> {
        let sender = self.channels.get(region).unwrap_or_else(|| {
            warn!(region, fallback = %self.fallback, "region not configured, using fallback");
            &self.channels[&self.fallback]
        });
        sender.send(event).await
    }

    /// The configured regions.
    pub fn regions(&self) -> impl Iterator<Item = &String> {
        self.channels.keys()
    }
}

/// Translates datastore subscription events into scaling events and
/// routes them by region.
pub async fn subscription_dispatcher(
    regions: std::sync::Arc<Regions>,
    mut subscription_events: mpsc::Receiver<SubscriptionEvent>,
) {
    while let Some(event) = subscription_events.recv().await {
        match event {
            SubscriptionEvent::Instance(rows) => {
                let Some(instance) = rows.into_iter().next() else {
                    continue;
                };
                if instance.status != InstanceStatus::Draining {
                    debug!(instance_id = %instance.id, "ignoring non-draining instance event");
                    continue;
                }
                let region = instance.region.clone();
                let event = ScalingEvent::new(region.clone(), EventKind::InstanceDraining(instance));
                if regions.route(&region, event).await.is_err() {
                    return;
                }
            }
            SubscriptionEvent::FrontendVersion(version) => {
                // Every region gates assignment on the same version.
                for region in regions.regions().cloned().collect::<Vec<_>>() {
                    let event =
                        ScalingEvent::new(region.clone(), EventKind::FrontendVersion(version));
                    if regions.route(&region, event).await.is_err() {
                        return;
                    }
                }
            }
            SubscriptionEvent::Mandelbox(_) => {
                // The controller does not subscribe to mandelbox changes.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_by_region_with_fallback() {
        let (east_tx, mut east_rx) = mpsc::channel(4);
        let (west_tx, mut west_rx) = mpsc::channel(4);
        let regions = Regions::new(vec![
            ("us-east-1".to_owned(), east_tx),
            ("us-west-1".to_owned(), west_tx),
        ]);

        regions
            .route(
                "us-west-1",
                ScalingEvent::new("us-west-1", EventKind::ScheduledScaleDown),
            )
            .await
            .unwrap();
        assert_eq!(west_rx.recv().await.unwrap().region, "us-west-1");

        // Unknown regions land on the fallback channel.
        regions
            .route(
                "mars-north-1",
                ScalingEvent::new("mars-north-1", EventKind::ScheduledScaleDown),
            )
            .await
            .unwrap();
        assert_eq!(east_rx.recv().await.unwrap().region, "mars-north-1");
    }
}
