//! The per-region event loop.

use std::sync::Arc;

use fleetbox_db::ScalerRepository;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::config::ScalingConfig;
use crate::event::{EventKind, ScalingEvent};
use crate::hosts::HostHandler;

/// The scaling algorithm applied to every region.
///
/// Alternative strategies (high-demand regions, smarter demand detection)
/// would be new types driving the same actions; the event loop only needs
/// `process_events`.
#[derive(Clone)]
pub struct DefaultScalingAlgorithm {
    region: String,
    pub(crate) repository: Arc<dyn ScalerRepository>,
    pub(crate) host: Arc<dyn HostHandler>,
    pub(crate) config: Arc<ScalingConfig>,
}

impl DefaultScalingAlgorithm {
    /// Creates the algorithm for one region.
    #[must_use]
    pub fn new(
        region: impl Into<String>,
        repository: Arc<dyn ScalerRepository>,
        host: Arc<dyn HostHandler>,
        config: Arc<ScalingConfig>,
    ) -> Self {
        Self {
            region: region.into(),
            repository,
            host,
            config,
        }
    }

    /// The region this algorithm serves.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Consumes scaling events until the channel closes or the root token
    /// is cancelled. Each action runs in its own tracked task under a
    /// fresh child token that is cancelled when the action finishes.
    pub async fn process_events(
        self,
        mut events: mpsc::Receiver<ScalingEvent>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        info!(region = %self.region, "scaling algorithm entering event loop");
        loop {
            let event = tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => event,
                    None => break,
                },
                () = cancel.cancelled() => break,
            };

            let action_cancel = cancel.child_token();
            let algorithm = self.clone();
            tracker.spawn(async move {
                let event_id = event.id;
                let name = event.kind.name();
                let result = algorithm.dispatch(event, &action_cancel).await;
                action_cancel.cancel();
                if let Err(e) = result {
                    error!(%event_id, action = name, error = %e, "scaling action failed");
                }
            });
        }
        info!(region = %self.region, "scaling algorithm leaving event loop");
    }

    async fn dispatch(
        &self,
        event: ScalingEvent,
        cancel: &CancellationToken,
    ) -> fleetbox_error::Result<()> {
        info!(event_id = %event.id, region = %event.region, kind = event.kind.name(),
              "processing scaling event");
        match event.kind {
            EventKind::InstanceDraining(instance) => {
                self.verify_instance_scale_down(cancel, instance).await
            }
            EventKind::FrontendVersion(version) => {
                self.swap_over_images(version);
                Ok(())
            }
            EventKind::ScheduledScaleDown => self.scale_down_if_necessary(cancel).await,
            EventKind::ScheduledImageUpgrade { image_id } => {
                self.upgrade_image(cancel, &image_id).await
            }
            EventKind::MandelboxAssign(request) => self.mandelbox_assign(cancel, request).await,
        }
    }
}
