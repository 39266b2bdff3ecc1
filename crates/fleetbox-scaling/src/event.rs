//! Scaling events.
//!
//! Every source the controller listens to (database subscriptions, the
//! scheduler, the assign endpoint) is folded into one tagged event type so
//! the per-region loop can match exhaustively.

use fleetbox_db::{FrontendVersion, Instance};
use uuid::Uuid;

use crate::assign::AssignRequest;

/// One event routed to a region's scaling algorithm.
#[derive(Debug)]
pub struct ScalingEvent {
    /// Unique id, for correlating an action's log lines.
    pub id: Uuid,
    /// Region the event belongs to.
    pub region: String,
    /// What happened.
    pub kind: EventKind,
}

impl ScalingEvent {
    /// Creates an event bound to a region.
    #[must_use]
    pub fn new(region: impl Into<String>, kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            region: region.into(),
            kind,
        }
    }
}

/// The known event kinds.
#[derive(Debug)]
pub enum EventKind {
    /// An instance row entered DRAINING.
    InstanceDraining(Instance),
    /// The frontend version row changed.
    FrontendVersion(FrontendVersion),
    /// Scheduled tick: drain free and stale instances.
    ScheduledScaleDown,
    /// Scheduled rollout: swap the region onto a new machine image.
    ScheduledImageUpgrade {
        /// The new image id for this region.
        image_id: String,
    },
    /// A user requested a mandelbox.
    MandelboxAssign(AssignRequest),
}

impl EventKind {
    /// Short name for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::InstanceDraining(_) => "instance_draining",
            Self::FrontendVersion(_) => "frontend_version",
            Self::ScheduledScaleDown => "scheduled_scale_down",
            Self::ScheduledImageUpgrade { .. } => "scheduled_image_upgrade",
            Self::MandelboxAssign(_) => "mandelbox_assign",
        }
    }
}
