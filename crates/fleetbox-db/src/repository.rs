//! Repository interfaces.
//!
//! The services never issue queries directly; they program against these
//! traits. [`crate::memory::MemoryRepository`] backs local development and
//! tests, [`crate::hasura::HasuraRepository`] backs deployments. All
//! mutations are single-row and idempotent except registration, which the
//! implementation must run as one select-then-update transaction at
//! READ COMMITTED.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use fleetbox_error::Result;

use crate::types::{
    FrontendVersion, Image, Instance, InstanceMetrics, InstanceStatus, InstanceTakeover,
    InstanceWithMandelboxes, Mandelbox, MandelboxId, MandelboxStatus,
};

/// Outcome of the registration take-over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// Row matched and is now ACTIVE.
    Registered,
    /// Row exists but is already DRAINING: the backend no longer wants this
    /// host, shut down cleanly instead of failing startup.
    AlreadyDraining,
}

/// Datastore operations the host agent performs.
#[async_trait]
pub trait HostRepository: Send + Sync {
    /// Looks up an instance row by id.
    async fn find_instance(&self, instance_id: &str) -> Result<Option<Instance>>;

    /// Takes over the pre-created instance row.
    ///
    /// Verifies image id, region, commit-sha prefix, instance type, and
    /// status `PRE_CONNECTION` against `takeover`, then writes status
    /// `ACTIVE`, the ip address, capacity, and timestamps.
    ///
    /// # Errors
    ///
    /// `NotFound` when no row exists; `Mismatch` when any verified field
    /// differs. Mismatches are permanent and must not be retried.
    async fn register_instance(&self, takeover: InstanceTakeover) -> Result<RegisterOutcome>;

    /// Updates `updated_at` and the metrics snapshot for this instance.
    async fn write_heartbeat(&self, instance_id: &str, metrics: InstanceMetrics) -> Result<()>;

    /// Marks this instance DRAINING so no new mandelboxes are assigned.
    async fn mark_draining(&self, instance_id: &str) -> Result<()>;

    /// Deletes this instance's row, cascading its mandelbox rows.
    async fn unregister_instance(&self, instance_id: &str) -> Result<()>;

    /// Returns the remaining capacity the scaling controller granted.
    async fn instance_capacity(&self, instance_id: &str) -> Result<i32>;

    /// Inserts a mandelbox row (status `WAITING` zygotes).
    async fn create_mandelbox(&self, row: Mandelbox) -> Result<()>;

    /// Writes a mandelbox row's status.
    async fn write_mandelbox_status(&self, id: MandelboxId, status: MandelboxStatus) -> Result<()>;

    /// Deletes a mandelbox row.
    async fn remove_mandelbox(&self, id: MandelboxId) -> Result<()>;

    /// Verifies the given user was allocated the given mandelbox and has no
    /// other live mandelbox.
    ///
    /// # Errors
    ///
    /// `NotFound` when no matching ALLOCATED row exists; `InvalidState` when
    /// the user already owns another live mandelbox.
    async fn verify_allocated_mandelbox(&self, user_id: &str, id: MandelboxId) -> Result<()>;

    /// Deletes rows stuck in ALLOCATED longer than `allocated_age` or in
    /// CONNECTING longer than `connecting_age`. Returns the number removed.
    async fn remove_stale_mandelboxes(
        &self,
        allocated_age: Duration,
        connecting_age: Duration,
    ) -> Result<u64>;
}

/// Datastore operations the scaling controller performs.
#[async_trait]
pub trait ScalerRepository: Send + Sync {
    /// Looks up one instance with its mandelbox rows.
    async fn instance_with_mandelboxes(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceWithMandelboxes>>;

    /// All instances with the given status in the given region, with their
    /// mandelbox rows.
    async fn instances_by_status_in_region(
        &self,
        status: InstanceStatus,
        region: &str,
    ) -> Result<Vec<InstanceWithMandelboxes>>;

    /// All ACTIVE instances across every region, for the cross-region
    /// assignment fallback.
    async fn active_instances(&self) -> Result<Vec<InstanceWithMandelboxes>>;

    /// The image currently rolled out in a region.
    async fn latest_image(&self, provider: &str, region: &str) -> Result<Option<Image>>;

    /// Inserts freshly launched instance rows. Returns rows affected.
    async fn insert_instances(&self, rows: Vec<Instance>) -> Result<u64>;

    /// Sets one instance's status. Returns rows affected.
    async fn update_instance_status(&self, instance_id: &str, status: InstanceStatus)
        -> Result<u64>;

    /// Deletes one instance row (reconciliation path). Returns rows affected.
    async fn delete_instance(&self, instance_id: &str) -> Result<u64>;

    /// Inserts the regional image row.
    async fn insert_image(&self, image: Image) -> Result<u64>;

    /// Updates the regional image row to a new image.
    async fn update_image(&self, image: Image) -> Result<u64>;

    /// All mandelbox rows belonging to a user.
    async fn user_mandelboxes(&self, user_id: &str) -> Result<Vec<Mandelbox>>;

    /// Inserts an ALLOCATED mandelbox row and decrements the chosen
    /// instance's remaining capacity in one step.
    ///
    /// # Errors
    ///
    /// `InvalidState` when the instance has no remaining capacity.
    async fn allocate_mandelbox(&self, row: Mandelbox) -> Result<()>;
}

/// Read access to the config datastore.
#[async_trait]
pub trait ConfigRepository: Send + Sync {
    /// The minimum accepted frontend version.
    async fn frontend_version(&self) -> Result<Option<FrontendVersion>>;

    /// Free-form configuration for the named environment
    /// (e.g. `DESIRED_FREE_MANDELBOXES_US_EAST_1`).
    async fn configs(&self, environment: &str) -> Result<HashMap<String, String>>;
}
