//! Datastore entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mandelbox identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MandelboxId(pub Uuid);

impl MandelboxId {
    /// Creates a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MandelboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MandelboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MandelboxId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Status of an instance row.
///
/// Transitions only `PreConnection → Active → Draining → (deleted)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Row created by the scaling controller; host agent not yet up.
    PreConnection,
    /// Host agent registered and accepting mandelboxes.
    Active,
    /// Marked for shutdown; no new mandelboxes are assigned.
    Draining,
    /// Heartbeats stopped arriving.
    HostServiceUnresponsive,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PreConnection => "PRE_CONNECTION",
            Self::Active => "ACTIVE",
            Self::Draining => "DRAINING",
            Self::HostServiceUnresponsive => "HOST_SERVICE_UNRESPONSIVE",
        };
        f.write_str(s)
    }
}

/// Status of a mandelbox row.
///
/// Transitions `Waiting → Allocated → Connecting → Running → (deleted)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MandelboxStatus {
    /// Warm zygote waiting for a user.
    Waiting,
    /// Assigned to a user by the scaling controller.
    Allocated,
    /// User's transport request received; configs decrypting.
    Connecting,
    /// Application running and reachable.
    Running,
    /// Being torn down.
    Dying,
}

impl std::fmt::Display for MandelboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Waiting => "WAITING",
            Self::Allocated => "ALLOCATED",
            Self::Connecting => "CONNECTING",
            Self::Running => "RUNNING",
            Self::Dying => "DYING",
        };
        f.write_str(s)
    }
}

impl MandelboxStatus {
    /// Returns true for statuses that count against the per-user limit.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Allocated | Self::Connecting | Self::Running)
    }
}

/// One GPU host, keyed by its cloud instance id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub provider: String,
    pub region: String,
    pub image_id: String,
    pub client_sha: String,
    pub ip_addr: String,
    pub instance_type: String,
    pub remaining_capacity: i32,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The machine image rolled out in one region. Unique per
/// `(provider, region)` and mutated only by the image-upgrade action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub provider: String,
    pub region: String,
    pub image_id: String,
    pub client_sha: String,
    pub updated_at: DateTime<Utc>,
}

/// One mandelbox row, owned by its instance row (cascade delete).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mandelbox {
    pub id: MandelboxId,
    pub app: String,
    pub instance_id: String,
    pub user_id: String,
    pub session_id: String,
    pub status: MandelboxStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An instance together with its mandelbox rows, as the scaling queries
/// return it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceWithMandelboxes {
    #[serde(flatten)]
    pub instance: Instance,
    #[serde(default)]
    pub mandelboxes: Vec<Mandelbox>,
}

impl InstanceWithMandelboxes {
    /// Returns true when no mandelbox rows reference this instance.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.mandelboxes.is_empty()
    }
}

/// The minimum frontend version accepted by assignment, as stored in the
/// config datastore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrontendVersion {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

impl std::fmt::Display for FrontendVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

impl std::str::FromStr for FrontendVersion {
    type Err = fleetbox_error::CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        let mut next = |name: &str| {
            parts
                .next()
                .ok_or_else(|| {
                    fleetbox_error::CommonError::config(format!("version missing {name} component"))
                })?
                .parse::<u32>()
                .map_err(|e| {
                    fleetbox_error::CommonError::config(format!("bad {name} component: {e}"))
                })
        };
        Ok(Self {
            major: next("major")?,
            minor: next("minor")?,
            micro: next("micro")?,
        })
    }
}

/// The metrics snapshot written with every heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetrics {
    pub memory_remaining_kb: u64,
    pub nanocpus_remaining: u64,
    pub gpu_vram_remaining_kb: u64,
    pub number_of_gpus: u32,
    pub mandelbox_count: u32,
}

/// What the host agent expects to find in its pre-created row, and what it
/// writes when taking the row over.
#[derive(Debug, Clone)]
pub struct InstanceTakeover {
    pub instance_id: String,
    pub image_id: String,
    pub region: String,
    pub instance_type: String,
    /// Full commit hash of this binary; the row may hold a prefix.
    pub client_commit_hash: String,
    pub ip_addr: String,
    pub remaining_capacity: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_serde() {
        let s = serde_json::to_string(&InstanceStatus::PreConnection).unwrap();
        assert_eq!(s, "\"PRE_CONNECTION\"");
        let back: InstanceStatus = serde_json::from_str(&s).unwrap();
        assert_eq!(back, InstanceStatus::PreConnection);

        let s = serde_json::to_string(&MandelboxStatus::Allocated).unwrap();
        assert_eq!(s, "\"ALLOCATED\"");
    }

    #[test]
    fn frontend_version_parses_and_orders() {
        let v: FrontendVersion = "3.0.0".parse().unwrap();
        assert_eq!(v, FrontendVersion { major: 3, minor: 0, micro: 0 });

        let older: FrontendVersion = "2.13.2".parse().unwrap();
        assert!(older < v);
        assert!("3.0".parse::<FrontendVersion>().is_err());
        assert!("a.b.c".parse::<FrontendVersion>().is_err());
    }

    #[test]
    fn live_statuses() {
        assert!(MandelboxStatus::Allocated.is_live());
        assert!(MandelboxStatus::Connecting.is_live());
        assert!(MandelboxStatus::Running.is_live());
        assert!(!MandelboxStatus::Waiting.is_live());
        assert!(!MandelboxStatus::Dying.is_live());
    }
}
