//! Scaling actions.
//!
//! Every action is idempotent against repeated events and finishes by
//! re-verifying the region's free-mandelbox buffer where the flow affects
//! capacity. The datastore holds the authoritative state; the cloud
//! provider is reconciled against it.

use chrono::Utc;
use fleetbox_core::environment;
use fleetbox_db::{FrontendVersion, Image, Instance, InstanceStatus, InstanceWithMandelboxes};
use fleetbox_error::{CommonError, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::algorithm::DefaultScalingAlgorithm;
use crate::capacity;
use crate::config::{MAX_WAIT_TIME_READY, MAX_WAIT_TIME_TERMINATED};

/// Provider tag written to instance and image rows.
const PROVIDER: &str = "AWS";

impl DefaultScalingAlgorithm {
    /// Checks the region's expected capacity against the desired buffer
    /// and launches instances to cover any shortfall.
    pub async fn verify_capacity(&self, cancel: &CancellationToken) -> Result<()> {
        let region = self.region().to_owned();
        let Some(image) = self.repository.latest_image(PROVIDER, &region).await? else {
            warn!(region, "no image rolled out, skipping capacity check");
            return Ok(());
        };

        let active = self
            .repository
            .instances_by_status_in_region(InstanceStatus::Active, &region)
            .await?;
        let starting = self
            .repository
            .instances_by_status_in_region(InstanceStatus::PreConnection, &region)
            .await?;

        let expected = capacity::expected_capacity(&image.image_id, &active, &starting);
        let desired = self.config.desired_free_mandelboxes(&region);
        if expected >= desired {
            info!(region, expected, desired, "capacity matches desired buffer");
            return Ok(());
        }

        let shortfall = desired - capacity::real_capacity(&image.image_id, &active);
        let count = capacity::instances_for_capacity(shortfall, &self.config.default_instance_type);
        info!(region, expected, desired, count, image_id = %image.image_id,
              "capacity below desired buffer, scaling up");
        self.scale_up_if_necessary(cancel, count, &image).await
    }

    /// Launches `count` instances from `image`, waits for them to become
    /// ready, and inserts their rows with the type's mandelbox capacity.
    pub async fn scale_up_if_necessary(
        &self,
        cancel: &CancellationToken,
        count: i32,
        image: &Image,
    ) -> Result<()> {
        if count <= 0 {
            return Ok(());
        }

        let created = self.host.spin_up_instances(cancel, count, image).await?;
        if created.len() != count as usize {
            return Err(CommonError::cloud(format!(
                "asked for {count} instances, provider launched {}",
                created.len()
            )));
        }

        let instance_ids: Vec<String> = created.iter().map(|i| i.id.clone()).collect();
        let rows: Vec<Instance> = created
            .into_iter()
            .map(|mut instance| {
                instance.status = InstanceStatus::PreConnection;
                instance.remaining_capacity =
                    capacity::instance_capacity(&instance.instance_type).unwrap_or(0);
                instance
            })
            .collect();

        self.host
            .wait_for_instance_ready(&instance_ids, MAX_WAIT_TIME_READY)
            .await?;

        let affected = self.repository.insert_instances(rows).await?;
        info!(affected, "inserted launched instances into the datastore");
        Ok(())
    }

    /// Drains free instances while respecting the rollout buffer, reports
    /// lingering draining instances, and re-verifies capacity.
    pub async fn scale_down_if_necessary(&self, cancel: &CancellationToken) -> Result<()> {
        let result = self.scale_down_inner().await;
        if let Err(e) = self.verify_capacity(cancel).await {
            error!(region = %self.region(), error = %e, "capacity check after scale down failed");
        }
        result
    }

    async fn scale_down_inner(&self) -> Result<()> {
        let region = self.region().to_owned();
        let Some(image) = self.repository.latest_image(PROVIDER, &region).await? else {
            warn!(region, "no image rolled out, skipping scale down");
            return Ok(());
        };

        let active = self
            .repository
            .instances_by_status_in_region(InstanceStatus::Active, &region)
            .await?;
        let starting = self
            .repository
            .instances_by_status_in_region(InstanceStatus::PreConnection, &region)
            .await?;
        let draining = self
            .repository
            .instances_by_status_in_region(InstanceStatus::Draining, &region)
            .await?;

        // Draining instances are the host agents' job to finish; here they
        // are only reported, never force-killed.
        let stuck: Vec<&InstanceWithMandelboxes> =
            draining.iter().filter(|row| !row.is_free()).collect();
        for row in &stuck {
            warn!(instance_id = %row.instance.id, mandelboxes = row.mandelboxes.len(),
                  "draining instance still has mandelboxes");
        }
        let lingering: Vec<&str> = draining
            .iter()
            .filter(|row| row.is_free())
            .map(|row| row.instance.id.as_str())
            .collect();
        if lingering.is_empty() {
            info!(region, "no lingering draining instances");
        } else {
            error!(region, ?lingering, "lingering draining instances, investigate");
        }

        let free: Vec<&InstanceWithMandelboxes> =
            active.iter().filter(|row| row.is_free()).collect();
        if free.is_empty() {
            info!(region, "no free instances to scale down");
            return Ok(());
        }

        let current_starting = starting
            .iter()
            .filter(|row| row.instance.image_id == image.image_id)
            .count();

        let to_drain: Vec<&InstanceWithMandelboxes> = if current_starting == 0 {
            // No rollout in flight: every free instance can drain, the
            // closing capacity check refills the buffer on the current
            // image.
            free
        } else {
            // Rollout in flight: draining current-image instances now
            // would dip capacity below the buffer, so only stale-image
            // free instances go, and only once the new-image buffer is
            // fully covered by starting instances.
            let new_capacity = capacity::expected_capacity(&image.image_id, &[], &starting);
            if new_capacity < self.config.desired_free_mandelboxes(&region) {
                info!(region, current_starting, "rollout buffer not ready, deferring scale down");
                return Ok(());
            }
            free.into_iter()
                .filter(|row| row.instance.image_id != image.image_id)
                .collect()
        };

        if to_drain.is_empty() {
            info!(region, "nothing eligible to scale down");
            return Ok(());
        }

        info!(region, count = to_drain.len(), "draining free instances");
        for row in to_drain {
            let instance_id = &row.instance.id;
            match self
                .repository
                .update_instance_status(instance_id, InstanceStatus::Draining)
                .await
            {
                Ok(0) => warn!(instance_id, "instance row vanished before drain"),
                Ok(_) => info!(instance_id, "marked instance draining"),
                Err(e) => error!(instance_id, error = %e, "failed to mark instance draining"),
            }
        }
        Ok(())
    }

    /// Reconciles a draining instance: waits for the cloud to confirm
    /// termination, then removes any leftover row. Skips instances that
    /// still carry mandelboxes. Always ends with a capacity check.
    pub async fn verify_instance_scale_down(
        &self,
        cancel: &CancellationToken,
        instance: Instance,
    ) -> Result<()> {
        let result = self.verify_scale_down_inner(&instance).await;
        if let Err(e) = self.verify_capacity(cancel).await {
            error!(region = %self.region(), error = %e, "capacity check after scale down failed");
        }
        result
    }

    async fn verify_scale_down_inner(&self, instance: &Instance) -> Result<()> {
        if let Some(row) = self
            .repository
            .instance_with_mandelboxes(&instance.id)
            .await?
        {
            if !row.is_free() {
                info!(instance_id = %instance.id,
                      "draining instance still has mandelboxes, not reconciling yet");
                return Ok(());
            }
        }

        self.host
            .wait_for_instance_termination(
                std::slice::from_ref(&instance.id),
                MAX_WAIT_TIME_TERMINATED,
            )
            .await
            .map_err(|e| {
                CommonError::cloud(format!(
                    "instance {} failed to terminate, something is blocking shutdown: {e}",
                    instance.id
                ))
            })?;

        // The host agent deletes its own row on clean exit; anything left
        // here no longer exists at the provider and gets removed.
        if self
            .repository
            .instance_with_mandelboxes(&instance.id)
            .await?
            .is_some()
        {
            let affected = self.repository.delete_instance(&instance.id).await?;
            info!(instance_id = %instance.id, affected, "removed row for terminated instance");
        } else {
            info!(instance_id = %instance.id, "instance removed itself from the datastore");
        }
        Ok(())
    }

    /// Rolls the region onto a new machine image: launches a full buffer
    /// on the new image, then swings the regional image row over. Old
    /// instances drain on the next scheduled scale-down pass.
    pub async fn upgrade_image(&self, cancel: &CancellationToken, new_image_id: &str) -> Result<()> {
        let region = self.region().to_owned();
        if new_image_id.is_empty() {
            warn!(region, "received an empty image id, not upgrading");
            return Ok(());
        }

        let old = self.repository.latest_image(PROVIDER, &region).await?;
        if let Some(old) = &old {
            if old.image_id == new_image_id {
                info!(region, image_id = new_image_id, "image already rolled out");
                return Ok(());
            }
        }

        let new_image = Image {
            provider: PROVIDER.to_owned(),
            region: region.clone(),
            image_id: new_image_id.to_owned(),
            client_sha: environment::client_commit_hash(),
            updated_at: Utc::now(),
        };

        let desired = self.config.desired_free_mandelboxes(&region);
        let count = capacity::instances_for_capacity(desired, &self.config.default_instance_type);
        info!(region, image_id = new_image_id, count, "launching buffer on new image");
        self.scale_up_if_necessary(cancel, count, &new_image).await?;

        let affected = match old {
            None => self.repository.insert_image(new_image).await?,
            Some(old) => {
                info!(region, old = %old.image_id, new = new_image_id, "swapping regional image");
                self.repository.update_image(new_image).await?
            }
        };
        info!(region, affected, "image row updated");
        Ok(())
    }

    /// Handles a frontend version rollout: newer requests gate against the
    /// new minimum from now on. The matching image swap arrives as a
    /// scheduled upgrade event.
    pub fn swap_over_images(&self, version: FrontendVersion) {
        info!(region = %self.region(), %version, "frontend version updated");
        self.config.set_frontend_version(version);
    }
}
