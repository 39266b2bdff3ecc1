//! Remote repository speaking GraphQL over HTTP.
//!
//! Queries and mutations go through a plain HTTP POST to the datastore's
//! `/v1/graphql` endpoint; live subscriptions go through the websocket
//! client in [`crate::subscriptions`]. The documents live in
//! [`crate::queries`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleetbox_error::{CommonError, Result};
use serde_json::{json, Value};
use tracing::debug;

use crate::queries;
use crate::repository::{ConfigRepository, HostRepository, RegisterOutcome, ScalerRepository};
use crate::types::{
    FrontendVersion, Image, Instance, InstanceMetrics, InstanceStatus, InstanceTakeover,
    InstanceWithMandelboxes, Mandelbox, MandelboxId, MandelboxStatus,
};

/// Connection settings for the datastore's GraphQL endpoint.
#[derive(Debug, Clone)]
pub struct HasuraConfig {
    /// Endpoint URL, e.g. `https://db.fleetbox.dev/v1/graphql`.
    pub url: String,
    /// Admin secret sent as `x-hasura-admin-secret`.
    pub admin_secret: Option<String>,
}

/// Repository backed by the remote datastore.
pub struct HasuraRepository {
    http: reqwest::Client,
    config: HasuraConfig,
}

impl HasuraRepository {
    /// Creates a repository for the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: HasuraConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CommonError::config(format!("building datastore HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Sends one GraphQL document and returns the `data` object.
    async fn execute(&self, document: &str, variables: Value) -> Result<Value> {
        let mut request = self
            .http
            .post(&self.config.url)
            .json(&json!({ "query": document, "variables": variables }));
        if let Some(secret) = &self.config.admin_secret {
            request = request.header("x-hasura-admin-secret", secret);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CommonError::database(format!("datastore request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CommonError::database(format!(
                "datastore returned HTTP {status}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CommonError::database(format!("decoding datastore response: {e}")))?;
        if let Some(errors) = body.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                return Err(CommonError::database(format!(
                    "datastore rejected request: {}",
                    errors[0]
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                )));
            }
        }
        body.get("data")
            .cloned()
            .ok_or_else(|| CommonError::database("datastore response had no data"))
    }

    fn rows<T: serde::de::DeserializeOwned>(data: &Value, root: &str) -> Result<Vec<T>> {
        let rows = data
            .get(root)
            .cloned()
            .ok_or_else(|| CommonError::database(format!("missing {root} in response")))?;
        serde_json::from_value(rows)
            .map_err(|e| CommonError::database(format!("decoding {root} rows: {e}")))
    }

    fn affected_rows(data: &Value, root: &str) -> u64 {
        data.get(root)
            .and_then(|v| v.get("affected_rows"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl HostRepository for HasuraRepository {
    async fn find_instance(&self, instance_id: &str) -> Result<Option<Instance>> {
        let data = self
            .execute(queries::FIND_INSTANCE_BY_ID, json!({ "id": instance_id }))
            .await?;
        let mut rows: Vec<Instance> = Self::rows(&data, "fleet_instances")?;
        Ok(rows.pop())
    }

    async fn register_instance(&self, takeover: InstanceTakeover) -> Result<RegisterOutcome> {
        // Verify the pre-created row first; the guarded update below only
        // succeeds while the row is still PRE_CONNECTION, so a concurrent
        // drain cannot be overwritten.
        let row = self
            .find_instance(&takeover.instance_id)
            .await?
            .ok_or_else(|| {
                CommonError::not_found(format!(
                    "no pre-created row for instance {}",
                    takeover.instance_id
                ))
            })?;

        if row.status == InstanceStatus::Draining {
            return Ok(RegisterOutcome::AlreadyDraining);
        }
        if row.image_id != takeover.image_id {
            return Err(CommonError::mismatch(format!(
                "image id: row has {}, host has {}",
                row.image_id, takeover.image_id
            )));
        }
        if row.region != takeover.region {
            return Err(CommonError::mismatch(format!(
                "region: row has {}, host has {}",
                row.region, takeover.region
            )));
        }
        if row.client_sha.is_empty() || !takeover.client_commit_hash.starts_with(&row.client_sha) {
            return Err(CommonError::mismatch(format!(
                "commit sha: row has {:?}, host has {:?}",
                row.client_sha, takeover.client_commit_hash
            )));
        }
        if row.instance_type != takeover.instance_type {
            return Err(CommonError::mismatch(format!(
                "instance type: row has {}, host has {}",
                row.instance_type, takeover.instance_type
            )));
        }
        if row.status != InstanceStatus::PreConnection {
            return Err(CommonError::mismatch(format!(
                "status: row has {}, expected PRE_CONNECTION",
                row.status
            )));
        }

        let data = self
            .execute(
                queries::REGISTER_INSTANCE,
                json!({
                    "id": takeover.instance_id,
                    "ip_addr": takeover.ip_addr,
                    "client_sha": takeover.client_commit_hash,
                    "remaining_capacity": takeover.remaining_capacity,
                    "updated_at": Utc::now(),
                }),
            )
            .await?;
        if Self::affected_rows(&data, "update_fleet_instances") == 0 {
            return Err(CommonError::mismatch(
                "row changed status before take-over completed",
            ));
        }
        debug!(instance_id = %takeover.instance_id, "registered instance");
        Ok(RegisterOutcome::Registered)
    }

    async fn write_heartbeat(&self, instance_id: &str, metrics: InstanceMetrics) -> Result<()> {
        let data = self
            .execute(
                queries::WRITE_HEARTBEAT,
                json!({
                    "id": instance_id,
                    "updated_at": Utc::now(),
                    "metrics": serde_json::to_value(metrics)
                        .map_err(|e| CommonError::internal(format!("encoding metrics: {e}")))?,
                }),
            )
            .await?;
        if Self::affected_rows(&data, "update_fleet_instances") == 0 {
            return Err(CommonError::not_found(format!(
                "heartbeat updated zero rows, instance {instance_id} row is missing"
            )));
        }
        Ok(())
    }

    async fn mark_draining(&self, instance_id: &str) -> Result<()> {
        let data = self
            .execute(
                queries::WRITE_INSTANCE_STATUS,
                json!({
                    "id": instance_id,
                    "status": InstanceStatus::Draining.to_string(),
                    "updated_at": Utc::now(),
                }),
            )
            .await?;
        if Self::affected_rows(&data, "update_fleet_instances") == 0 {
            return Err(CommonError::not_found(format!(
                "instance {instance_id} row went missing"
            )));
        }
        Ok(())
    }

    async fn unregister_instance(&self, instance_id: &str) -> Result<()> {
        let data = self
            .execute(queries::DELETE_INSTANCE, json!({ "id": instance_id }))
            .await?;
        if Self::affected_rows(&data, "delete_fleet_instances") == 0 {
            return Err(CommonError::not_found(format!(
                "instance {instance_id} went missing before delete"
            )));
        }
        Ok(())
    }

    async fn instance_capacity(&self, instance_id: &str) -> Result<i32> {
        self.find_instance(instance_id)
            .await?
            .map(|i| i.remaining_capacity)
            .ok_or_else(|| CommonError::not_found(format!("instance {instance_id}")))
    }

    async fn create_mandelbox(&self, row: Mandelbox) -> Result<()> {
        self.execute(
            queries::INSERT_MANDELBOX,
            json!({ "object": serde_json::to_value(&row)
                .map_err(|e| CommonError::internal(format!("encoding mandelbox row: {e}")))? }),
        )
        .await?;
        Ok(())
    }

    async fn write_mandelbox_status(&self, id: MandelboxId, status: MandelboxStatus) -> Result<()> {
        let data = self
            .execute(
                queries::WRITE_MANDELBOX_STATUS,
                json!({
                    "id": id,
                    "status": status.to_string(),
                    "updated_at": Utc::now(),
                }),
            )
            .await?;
        if Self::affected_rows(&data, "update_fleet_mandelboxes") == 0 {
            return Err(CommonError::not_found(format!("mandelbox {id}")));
        }
        Ok(())
    }

    async fn remove_mandelbox(&self, id: MandelboxId) -> Result<()> {
        self.execute(queries::DELETE_MANDELBOX, json!({ "id": id }))
            .await?;
        Ok(())
    }

    async fn verify_allocated_mandelbox(&self, user_id: &str, id: MandelboxId) -> Result<()> {
        let data = self
            .execute(queries::USER_MANDELBOXES, json!({ "user_id": user_id }))
            .await?;
        let rows: Vec<Mandelbox> = Self::rows(&data, "fleet_mandelboxes")?;

        let allocated = rows
            .iter()
            .any(|m| m.id == id && m.status == MandelboxStatus::Allocated);
        if !allocated {
            return Err(CommonError::not_found(format!(
                "no ALLOCATED mandelbox {id} for user {user_id}"
            )));
        }
        if rows.iter().any(|m| m.id != id && m.status.is_live()) {
            return Err(CommonError::invalid_state(format!(
                "user {user_id} already has another live mandelbox"
            )));
        }
        Ok(())
    }

    async fn remove_stale_mandelboxes(
        &self,
        allocated_age: Duration,
        connecting_age: Duration,
    ) -> Result<u64> {
        let now = Utc::now();
        let data = self
            .execute(
                queries::REMOVE_STALE_MANDELBOXES,
                json!({
                    "allocated_before": now - chrono::Duration::from_std(allocated_age)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
                    "connecting_before": now - chrono::Duration::from_std(connecting_age)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
                }),
            )
            .await?;
        Ok(Self::affected_rows(&data, "delete_fleet_mandelboxes"))
    }
}

#[async_trait]
impl ScalerRepository for HasuraRepository {
    async fn instance_with_mandelboxes(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceWithMandelboxes>> {
        let data = self
            .execute(
                queries::FIND_INSTANCE_WITH_MANDELBOXES,
                json!({ "id": instance_id }),
            )
            .await?;
        let mut rows: Vec<InstanceWithMandelboxes> = Self::rows(&data, "fleet_instances")?;
        Ok(rows.pop())
    }

    async fn instances_by_status_in_region(
        &self,
        status: InstanceStatus,
        region: &str,
    ) -> Result<Vec<InstanceWithMandelboxes>> {
        let data = self
            .execute(
                queries::INSTANCES_BY_STATUS_IN_REGION,
                json!({ "status": status.to_string(), "region": region }),
            )
            .await?;
        Self::rows(&data, "fleet_instances")
    }

    async fn active_instances(&self) -> Result<Vec<InstanceWithMandelboxes>> {
        let data = self.execute(queries::ACTIVE_INSTANCES, json!({})).await?;
        Self::rows(&data, "fleet_instances")
    }

    async fn latest_image(&self, provider: &str, region: &str) -> Result<Option<Image>> {
        let data = self
            .execute(
                queries::FIND_IMAGE,
                json!({ "provider": provider, "region": region }),
            )
            .await?;
        let mut rows: Vec<Image> = Self::rows(&data, "fleet_images")?;
        Ok(rows.pop())
    }

    async fn insert_instances(&self, rows: Vec<Instance>) -> Result<u64> {
        let objects = serde_json::to_value(&rows)
            .map_err(|e| CommonError::internal(format!("encoding instance rows: {e}")))?;
        let data = self
            .execute(queries::INSERT_INSTANCES, json!({ "objects": objects }))
            .await?;
        Ok(Self::affected_rows(&data, "insert_fleet_instances"))
    }

    async fn update_instance_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<u64> {
        let data = self
            .execute(
                queries::WRITE_INSTANCE_STATUS,
                json!({
                    "id": instance_id,
                    "status": status.to_string(),
                    "updated_at": Utc::now(),
                }),
            )
            .await?;
        Ok(Self::affected_rows(&data, "update_fleet_instances"))
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<u64> {
        let data = self
            .execute(queries::DELETE_INSTANCE, json!({ "id": instance_id }))
            .await?;
        Ok(Self::affected_rows(&data, "delete_fleet_instances"))
    }

    async fn insert_image(&self, image: Image) -> Result<u64> {
        let object = serde_json::to_value(&image)
            .map_err(|e| CommonError::internal(format!("encoding image row: {e}")))?;
        let data = self
            .execute(queries::INSERT_IMAGE, json!({ "object": object }))
            .await?;
        Ok(Self::affected_rows(&data, "insert_fleet_images"))
    }

    async fn update_image(&self, image: Image) -> Result<u64> {
        let data = self
            .execute(
                queries::UPDATE_IMAGE,
                json!({
                    "provider": image.provider,
                    "region": image.region,
                    "image_id": image.image_id,
                    "client_sha": image.client_sha,
                    "updated_at": image.updated_at,
                }),
            )
            .await?;
        Ok(Self::affected_rows(&data, "update_fleet_images"))
    }

    async fn user_mandelboxes(&self, user_id: &str) -> Result<Vec<Mandelbox>> {
        let data = self
            .execute(queries::USER_MANDELBOXES, json!({ "user_id": user_id }))
            .await?;
        Self::rows(&data, "fleet_mandelboxes")
    }

    async fn allocate_mandelbox(&self, row: Mandelbox) -> Result<()> {
        let instance_id = row.instance_id.clone();
        let object = serde_json::to_value(&row)
            .map_err(|e| CommonError::internal(format!("encoding mandelbox row: {e}")))?;
        let data = self
            .execute(
                queries::ALLOCATE_MANDELBOX,
                json!({ "object": object, "instance_id": instance_id }),
            )
            .await?;
        if Self::affected_rows(&data, "update_fleet_instances") == 0 {
            return Err(CommonError::invalid_state(format!(
                "instance {instance_id} has no remaining capacity"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigRepository for HasuraRepository {
    async fn frontend_version(&self) -> Result<Option<FrontendVersion>> {
        let data = self.execute(queries::FRONTEND_VERSION, json!({})).await?;
        let mut rows: Vec<FrontendVersion> = Self::rows(&data, "config_frontend_version")?;
        Ok(rows.pop())
    }

    async fn configs(&self, environment: &str) -> Result<HashMap<String, String>> {
        #[derive(serde::Deserialize)]
        struct Entry {
            key: String,
            value: String,
        }
        let data = self
            .execute(queries::CONFIG_VALUES, json!({ "environment": environment }))
            .await?;
        let rows: Vec<Entry> = Self::rows(&data, "config_values")?;
        Ok(rows.into_iter().map(|e| (e.key, e.value)).collect())
    }
}
