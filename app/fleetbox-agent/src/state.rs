//! Shared agent state.
//!
//! One [`Agent`] exists per process and is shared (via `Arc`) between the
//! HTTP handlers, the event loop, the spinup paths, and the periodic
//! workers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleetbox_core::{Dirs, OnceSlot};
use fleetbox_db::{
    HostRepository, InstanceMetrics, InstanceTakeover, Mandelbox as MandelboxRow, MandelboxId,
    MandelboxStatus, RegisterOutcome,
};
use fleetbox_error::Result;
use fleetbox_mandelbox::{MandelboxRegistry, ResourceBroker};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::auth::TokenVerifier;
use crate::config::AgentConfig;
use crate::metrics::Metrics;
use crate::runtime::ContainerRuntime;

/// The parsed body of a `PUT /json_transport` request.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonTransportBody {
    pub mandelbox_id: MandelboxId,
    #[serde(default)]
    pub jwt_access_token: String,
    #[serde(default)]
    pub config_encryption_token: String,
    #[serde(default)]
    pub json_data: String,
    #[serde(default)]
    pub browser_data: String,
    #[serde(default)]
    pub is_new_config_token: bool,
    #[serde(default)]
    pub app_name: Option<String>,
}

/// What a successful transport returns to the client.
#[derive(Debug, Clone, Serialize)]
pub struct JsonTransportResult {
    pub host_port_32262: u16,
    pub host_port_32263: u16,
    pub host_port_32273: u16,
    pub aes_key: String,
}

/// A transport request in flight: the parsed body plus the slot its
/// outcome is delivered on.
pub struct JsonTransportRequest {
    pub body: JsonTransportBody,
    pub result: Arc<OnceSlot<std::result::Result<JsonTransportResult, String>>>,
}

impl std::fmt::Debug for JsonTransportRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonTransportRequest")
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

impl JsonTransportRequest {
    /// Wraps a parsed body with a fresh result slot.
    #[must_use]
    pub fn new(body: JsonTransportBody) -> Self {
        Self {
            body,
            result: Arc::new(OnceSlot::new()),
        }
    }
}

/// Routes each mandelbox's single transport request to its waiting
/// spinup. One slot per mandelbox id; the slot's once-only semantics
/// reject duplicate submissions.
#[derive(Default)]
pub struct TransportMap {
    slots: Mutex<HashMap<MandelboxId, Arc<OnceSlot<JsonTransportRequest>>>>,
}

impl TransportMap {
    /// The slot for a mandelbox, created on first use from either side.
    #[must_use]
    pub fn slot(&self, mandelbox_id: MandelboxId) -> Arc<OnceSlot<JsonTransportRequest>> {
        Arc::clone(
            self.slots
                .lock()
                .entry(mandelbox_id)
                .or_insert_with(|| Arc::new(OnceSlot::new())),
        )
    }

    /// Submits a request.
    ///
    /// # Errors
    ///
    /// Returns the request back when this mandelbox already received one,
    /// so the caller can answer it with an error.
    pub fn submit(&self, request: JsonTransportRequest) -> std::result::Result<(), JsonTransportRequest> {
        let slot = self.slot(request.body.mandelbox_id);
        slot.set(request).map_err(|rejected| rejected.value)
    }

    /// Forgets a mandelbox's slot (teardown).
    pub fn remove(&self, mandelbox_id: MandelboxId) {
        self.slots.lock().remove(&mandelbox_id);
    }
}

/// Datastore access with the local-development guard: every write becomes
/// a no-op when the agent runs without a database.
pub struct HostDatastore {
    repository: Arc<dyn HostRepository>,
    enabled: bool,
}

impl HostDatastore {
    /// Datastore-backed operation.
    #[must_use]
    pub fn new(repository: Arc<dyn HostRepository>) -> Self {
        Self {
            repository,
            enabled: true,
        }
    }

    /// Local development without a database: all calls no-op.
    #[must_use]
    pub fn disabled(repository: Arc<dyn HostRepository>) -> Self {
        Self {
            repository,
            enabled: false,
        }
    }

    /// Whether the datastore is live.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn register_instance(&self, takeover: InstanceTakeover) -> Result<RegisterOutcome> {
        if !self.enabled {
            return Ok(RegisterOutcome::Registered);
        }
        self.repository.register_instance(takeover).await
    }

    pub async fn write_heartbeat(&self, instance_id: &str, metrics: InstanceMetrics) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.repository.write_heartbeat(instance_id, metrics).await
    }

    pub async fn mark_draining(&self, instance_id: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.repository.mark_draining(instance_id).await
    }

    pub async fn unregister_instance(&self, instance_id: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.repository.unregister_instance(instance_id).await
    }

    pub async fn instance_capacity(&self, instance_id: &str) -> Result<i32> {
        if !self.enabled {
            return Ok(0);
        }
        self.repository.instance_capacity(instance_id).await
    }

    pub async fn create_mandelbox(&self, row: MandelboxRow) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.repository.create_mandelbox(row).await
    }

    pub async fn write_mandelbox_status(
        &self,
        id: MandelboxId,
        status: MandelboxStatus,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.repository.write_mandelbox_status(id, status).await
    }

    pub async fn verify_allocated_mandelbox(&self, user_id: &str, id: MandelboxId) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.repository.verify_allocated_mandelbox(user_id, id).await
    }

    pub async fn remove_stale_mandelboxes(
        &self,
        allocated_age: Duration,
        connecting_age: Duration,
    ) -> Result<u64> {
        if !self.enabled {
            return Ok(0);
        }
        self.repository
            .remove_stale_mandelboxes(allocated_age, connecting_age)
            .await
    }
}

/// Everything the agent's tasks share.
pub struct Agent {
    pub config: AgentConfig,
    pub dirs: Dirs,
    pub broker: Arc<ResourceBroker>,
    pub registry: Arc<MandelboxRegistry>,
    pub datastore: HostDatastore,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub metrics: Arc<Metrics>,
    pub transport: TransportMap,
    /// Root cancellation: cancelling it begins the shutdown path.
    pub cancel: CancellationToken,
    /// Tracks every worker except the event loop (which outlives the root
    /// cancellation to drain container-die events).
    pub tracker: TaskTracker,
    /// Signalled once per mandelbox teardown; drives capacity refill.
    pub death_tx: mpsc::Sender<MandelboxId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn body(id: MandelboxId) -> JsonTransportBody {
        JsonTransportBody {
            mandelbox_id: id,
            jwt_access_token: String::new(),
            config_encryption_token: "token".to_owned(),
            json_data: "{}".to_owned(),
            browser_data: String::new(),
            is_new_config_token: false,
            app_name: None,
        }
    }

    #[tokio::test]
    async fn transport_map_delivers_to_a_waiting_spinup() {
        let map = TransportMap::default();
        let id = MandelboxId(Uuid::new_v4());

        let slot = map.slot(id);
        map.submit(JsonTransportRequest::new(body(id))).unwrap();

        let request = slot.wait().await.unwrap();
        assert_eq!(request.body.mandelbox_id, id);
    }

    #[tokio::test]
    async fn duplicate_submission_is_handed_back() {
        let map = TransportMap::default();
        let id = MandelboxId(Uuid::new_v4());

        map.submit(JsonTransportRequest::new(body(id))).unwrap();
        let rejected = map.submit(JsonTransportRequest::new(body(id))).unwrap_err();
        assert_eq!(rejected.body.mandelbox_id, id);
    }
}
