//! Mandelbox spinup.
//!
//! Spinup happens in two halves. `start_mandelbox_spin_up` runs without
//! any user: it binds host resources, creates and starts the container,
//! and leaves a warm zygote waiting indefinitely. `finish_mandelbox_spin_up`
//! runs when the scaling controller allocates the zygote to a user: it
//! waits for the client's transport request, hands over session data and
//! configs, and reports RUNNING. Any failure on either half releases every
//! resource the mandelbox acquired.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetbox_core::environment;
use fleetbox_db::{
    Mandelbox as MandelboxRow, MandelboxId, MandelboxStatus,
};
use fleetbox_error::{CommonError, Result};
use fleetbox_mandelbox::mandelbox::generate_aes_key;
use fleetbox_mandelbox::{LocalStatus, Mandelbox, PortBinding, Protocol};
use tracing::{error, info, warn};

use crate::runtime::ContainerSpec;
use crate::state::{Agent, JsonTransportRequest, JsonTransportResult};

/// How long an allocated user has to deliver the transport request.
pub const JSON_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(60);

/// How long the application has to signal readiness.
pub const READY_SIGNAL_TIMEOUT: Duration = Duration::from_secs(20);

/// Grace given to a dying container before forced teardown.
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Protocol timeout written for deployed mandelboxes, in seconds. Local
/// zygotes get `-1` (wait forever).
const DEPLOYED_PROTOCOL_TIMEOUT_SECS: i32 = 30;

/// The port bindings every mandelbox requests.
fn standard_port_bindings() -> Vec<PortBinding> {
    vec![
        PortBinding::any(32261, Protocol::Tcp),
        PortBinding::any(32262, Protocol::Tcp),
        PortBinding::any(32263, Protocol::Udp),
        PortBinding::any(32273, Protocol::Tcp),
    ]
}

impl Agent {
    /// Creates and starts one waiting mandelbox (zygote).
    ///
    /// On success the mandelbox is `Waiting` in the registry with a
    /// running container. On failure everything acquired is released and
    /// the error is returned.
    pub async fn start_mandelbox_spin_up(
        &self,
        mandelbox_id: MandelboxId,
        app_name: &str,
    ) -> Result<Arc<Mandelbox>> {
        let mandelbox = Mandelbox::new(
            mandelbox_id,
            app_name,
            Arc::clone(&self.broker),
            self.dirs.clone(),
            self.death_tx.clone(),
        );
        self.registry.register(Arc::clone(&mandelbox));
        info!(%mandelbox_id, app_name, "starting mandelbox spinup");

        match self.spin_up_inner(&mandelbox).await {
            Ok(()) => {
                mandelbox.set_status(LocalStatus::Waiting);
                info!(%mandelbox_id, "mandelbox waiting for a user");
                Ok(mandelbox)
            }
            Err(e) => {
                self.metrics.increment_error_rate();
                self.registry.remove(mandelbox_id);
                mandelbox.close();
                Err(e)
            }
        }
    }

    async fn spin_up_inner(&self, mandelbox: &Arc<Mandelbox>) -> Result<()> {
        mandelbox
            .assign_port_bindings(&standard_port_bindings())
            .map_err(|e| CommonError::internal(e.to_string()))?;
        if self.config.enable_uinput {
            mandelbox
                .initialize_uinput_devices()
                .map_err(|e| CommonError::internal(e.to_string()))?;
        }
        mandelbox
            .initialize_tty()
            .map_err(|e| CommonError::internal(e.to_string()))?;
        if !environment::is_running_in_ci() {
            mandelbox
                .assign_gpu()
                .map_err(|e| CommonError::internal(e.to_string()))?;
        }

        let aes_key = generate_aes_key();
        mandelbox.set_private_key(&aes_key);

        let runtime_id = self
            .runtime
            .create_container(&self.container_spec(mandelbox, &aes_key))
            .await
            .map_err(|e| CommonError::internal(format!("creating container: {e}")))?;
        mandelbox.register_creation(&runtime_id);
        self.registry
            .register_runtime_id(runtime_id.clone(), mandelbox.id());
        mandelbox.set_status(LocalStatus::ParamsReady);

        mandelbox
            .write_params()
            .map_err(|e| CommonError::internal(e.to_string()))?;
        let protocol_timeout = if environment::app_environment().is_local() {
            -1
        } else {
            DEPLOYED_PROTOCOL_TIMEOUT_SECS
        };
        mandelbox
            .write_protocol_timeout(protocol_timeout)
            .map_err(|e| CommonError::internal(e.to_string()))?;
        mandelbox
            .mark_params_ready()
            .map_err(|e| CommonError::internal(e.to_string()))?;

        self.runtime
            .start_container(&runtime_id)
            .await
            .map_err(|e| CommonError::internal(format!("starting container: {e}")))?;
        Ok(())
    }

    fn container_spec(&self, mandelbox: &Arc<Mandelbox>, aes_key: &str) -> ContainerSpec {
        let id_string = mandelbox.id().to_string();
        let image = if environment::app_environment().is_local() {
            mandelbox.app_name().to_owned()
        } else {
            format!(
                "ghcr.io/fleetbox/{}/{}:current-build",
                environment::app_environment(),
                mandelbox.app_name()
            )
        };

        let binds = vec![
            format!(
                "{}:/fleetbox/resourceMappings",
                self.dirs.resource_mapping_dir(&id_string).display()
            ),
            format!(
                "{}:/tmp/sockets",
                self.dirs.sockets_dir(&id_string).display()
            ),
            format!(
                "{}:/var/log/fleetbox",
                self.dirs
                    .session_log_dir(&id_string, mandelbox.server_session_id())
                    .display()
            ),
            format!(
                "{}:/fleetbox/userConfigs:rshared",
                self.dirs.user_configs_dir(&id_string).display()
            ),
            "/sys/fs/cgroup:/sys/fs/cgroup:ro".to_owned(),
            "/run/udev/data:/run/udev/data:ro".to_owned(),
        ];

        ContainerSpec {
            name: sanitize_container_name(&format!("{}-{}", mandelbox.app_name(), id_string)),
            image,
            env: vec![
                format!("FLEETBOX_AES_KEY={aes_key}"),
                "NVIDIA_VISIBLE_DEVICES=all".to_owned(),
                "NVIDIA_DRIVER_CAPABILITIES=all".to_owned(),
                format!("FLEETBOX_ENV={}", environment::app_environment()),
            ],
            port_bindings: mandelbox.port_bindings(),
            binds,
            devices: mandelbox.device_mappings(),
        }
    }

    /// Starts `count` waiting mandelboxes and registers their rows.
    ///
    /// A zygote failing to start means the host or its images are broken:
    /// the root context is cancelled so the instance drains instead of
    /// accepting users.
    pub async fn spin_up_waiting_mandelboxes(&self, count: i32) {
        if environment::app_environment().is_local_without_db()
            && !environment::is_running_in_ci()
        {
            return;
        }

        for _ in 0..count.max(0) {
            let mandelbox_id = MandelboxId::new();
            match self
                .start_mandelbox_spin_up(mandelbox_id, &self.config.app_name)
                .await
            {
                Ok(zygote) => {
                    let row = MandelboxRow {
                        id: mandelbox_id,
                        app: zygote.app_name_for_db(),
                        instance_id: self.config.instance_id.clone(),
                        user_id: String::new(),
                        session_id: zygote.server_session_id().to_owned(),
                        status: MandelboxStatus::Waiting,
                        created_at: Utc::now(),
                        updated_at: Utc::now(),
                    };
                    if let Err(e) = self.datastore.create_mandelbox(row).await {
                        error!(%mandelbox_id, error = %e, "failed to register waiting mandelbox");
                    }
                }
                Err(e) => {
                    error!(%mandelbox_id, error = %e,
                           "failed to start waiting mandelbox, draining this host");
                    self.cancel.cancel();
                    return;
                }
            }
        }
    }

    /// Finishes spinup once a user is allocated to a waiting mandelbox.
    ///
    /// `request` is only supplied on the local-development path where the
    /// transport request itself stands in for the allocation event.
    pub async fn finish_mandelbox_spin_up(
        &self,
        allocation: MandelboxRow,
        request: Option<JsonTransportRequest>,
    ) {
        let mandelbox_id = allocation.id;
        info!(%mandelbox_id, user_id = %allocation.user_id, "finishing mandelbox spinup");

        if let Err(e) = self.finish_inner(allocation, request).await {
            error!(%mandelbox_id, error = %e, "failed to finish mandelbox spinup");
            self.metrics.increment_error_rate();
            self.transport.remove(mandelbox_id);
            if let Some(mandelbox) = self.registry.remove(mandelbox_id) {
                mandelbox.close();
            }
        }
    }

    async fn finish_inner(
        &self,
        allocation: MandelboxRow,
        request: Option<JsonTransportRequest>,
    ) -> Result<()> {
        self.datastore
            .verify_allocated_mandelbox(&allocation.user_id, allocation.id)
            .await?;

        let mandelbox = self.registry.lookup(allocation.id).ok_or_else(|| {
            CommonError::not_found(format!("no waiting mandelbox {}", allocation.id))
        })?;
        mandelbox.set_status(LocalStatus::Allocated);
        mandelbox.assign_to_user(&allocation.user_id);
        mandelbox.set_session_id(&allocation.session_id);
        mandelbox
            .write_session_id()
            .map_err(|e| CommonError::internal(e.to_string()))?;

        // The client gets exactly one minute after allocation to deliver
        // its transport request.
        let request = match request {
            Some(request) => request,
            None => {
                let slot = self.transport.slot(allocation.id);
                tokio::time::timeout(JSON_TRANSPORT_TIMEOUT, slot.wait())
                    .await
                    .map_err(|_| {
                        CommonError::timeout(format!(
                            "user {} never sent the transport request for {}",
                            allocation.user_id, allocation.id
                        ))
                    })??
            }
        };

        mandelbox.set_status(LocalStatus::Connecting);
        self.datastore
            .write_mandelbox_status(allocation.id, MandelboxStatus::Connecting)
            .await?;

        match self.connect_user(&mandelbox, &request).await {
            Ok(result) => {
                if request.result.set(Ok(result)).is_err() {
                    warn!(mandelbox_id = %allocation.id, "transport result already delivered");
                }
                mandelbox.set_status(LocalStatus::Running);
                info!(mandelbox_id = %allocation.id, "mandelbox running");
                Ok(())
            }
            Err(e) => {
                let _ = request.result.set(Err(e.to_string()));
                Err(e)
            }
        }
    }

    async fn connect_user(
        &self,
        mandelbox: &Arc<Mandelbox>,
        request: &JsonTransportRequest,
    ) -> Result<JsonTransportResult> {
        // The config collaborator decrypts user configs keyed by the
        // token; the blob and browser data land on disk either way.
        mandelbox
            .write_config_json(&request.body.json_data)
            .map_err(|e| CommonError::internal(e.to_string()))?;
        mandelbox
            .write_browser_data(&request.body.browser_data)
            .map_err(|e| CommonError::internal(e.to_string()))?;
        mandelbox
            .mark_config_ready()
            .map_err(|e| CommonError::internal(e.to_string()))?;

        if !environment::app_environment().is_local() {
            mandelbox
                .wait_for_ready_signal(READY_SIGNAL_TIMEOUT)
                .await
                .map_err(|e| CommonError::internal(e.to_string()))?;
        }

        self.datastore
            .write_mandelbox_status(mandelbox.id(), MandelboxStatus::Running)
            .await?;

        Ok(JsonTransportResult {
            host_port_32262: mandelbox
                .host_port(32262, Protocol::Tcp)
                .map_err(|e| CommonError::internal(e.to_string()))?,
            host_port_32263: mandelbox
                .host_port(32263, Protocol::Udp)
                .map_err(|e| CommonError::internal(e.to_string()))?,
            host_port_32273: mandelbox
                .host_port(32273, Protocol::Tcp)
                .map_err(|e| CommonError::internal(e.to_string()))?,
            aes_key: mandelbox.private_key().unwrap_or_default(),
        })
    }

    /// Tears down a mandelbox whose container died.
    pub async fn mandelbox_die_handler(&self, runtime_id: &str) {
        let Some(mandelbox) = self.registry.lookup_by_runtime_id(runtime_id) else {
            warn!(runtime_id, "die event for an unknown or already-closed container");
            return;
        };
        let mandelbox_id = mandelbox.id();
        info!(%mandelbox_id, runtime_id, "container died, tearing down mandelbox");

        self.transport.remove(mandelbox_id);
        self.registry.remove(mandelbox_id);
        mandelbox.close();

        if let Err(e) = self
            .runtime
            .stop_container(runtime_id, GRACEFUL_STOP_TIMEOUT)
            .await
        {
            warn!(runtime_id, error = %e, "graceful container stop failed");
        }
    }

    /// Refills waiting mandelboxes up to the instance's remaining
    /// capacity. Runs after every mandelbox death.
    pub async fn monitor_waiting_mandelboxes(&self) {
        if self.cancel.is_cancelled() || environment::app_environment().is_local_without_db() {
            return;
        }
        let capacity = match self
            .datastore
            .instance_capacity(&self.config.instance_id)
            .await
        {
            Ok(capacity) => capacity,
            Err(e) => {
                error!(error = %e, "couldn't read instance capacity");
                return;
            }
        };

        let waiting = i32::try_from(self.registry.count()).unwrap_or(i32::MAX);
        let refill = capacity - waiting;
        info!(capacity, waiting, "checked waiting mandelbox count");
        if refill > 0 {
            info!(refill, "starting new waiting mandelboxes");
            self.spin_up_waiting_mandelboxes(refill).await;
        }
    }

    /// Stops every still-waiting mandelbox so shutdown isn't blocked on
    /// zygotes.
    pub async fn stop_waiting_mandelboxes(&self) {
        for mandelbox in self.registry.all() {
            if mandelbox.status() != LocalStatus::Waiting {
                continue;
            }
            let mandelbox_id = mandelbox.id();
            if let Some(runtime_id) = mandelbox.runtime_id() {
                if let Err(e) = self
                    .runtime
                    .stop_container(&runtime_id, GRACEFUL_STOP_TIMEOUT)
                    .await
                {
                    warn!(%mandelbox_id, error = %e, "failed to stop waiting container");
                }
            }
            self.registry.remove(mandelbox_id);
            mandelbox.close();
        }
    }
}

fn sanitize_container_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::InsecureVerifier;
    use crate::config::AgentConfig;
    use crate::metrics::Metrics;
    use crate::runtime::{ContainerRuntime, ContainerSpec, NullRuntime, RuntimeEvent, StreamError};
    use crate::state::{HostDatastore, TransportMap};
    use async_trait::async_trait;
    use fleetbox_core::Dirs;
    use fleetbox_db::MemoryRepository;
    use fleetbox_mandelbox::{MandelboxRegistry, ResourceBroker};
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    /// Engine that fails container creation, for exercising the failure
    /// cleanup path after resources were acquired.
    struct FailingRuntime;

    #[async_trait]
    impl ContainerRuntime for FailingRuntime {
        async fn create_container(&self, _spec: &ContainerSpec) -> fleetbox_error::Result<String> {
            Err(CommonError::internal("engine on fire"))
        }

        async fn start_container(&self, _runtime_id: &str) -> fleetbox_error::Result<()> {
            Ok(())
        }

        async fn stop_container(
            &self,
            _runtime_id: &str,
            _timeout: Duration,
        ) -> fleetbox_error::Result<()> {
            Ok(())
        }

        async fn remove_container(&self, _runtime_id: &str) -> fleetbox_error::Result<()> {
            Ok(())
        }

        async fn subscribe_events(
            &self,
        ) -> fleetbox_error::Result<
            mpsc::Receiver<std::result::Result<RuntimeEvent, StreamError>>,
        > {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    fn test_agent(runtime: Arc<dyn ContainerRuntime>, tmp: &TempDir) -> Arc<Agent> {
        let (death_tx, death_rx) = mpsc::channel(32);
        // Teardown death events have nowhere to go in these tests.
        std::mem::drop(death_rx);
        Arc::new(Agent {
            config: AgentConfig {
                fleet_dir: tmp.path().join("fleet"),
                temp_dir: tmp.path().join("temp"),
                enable_uinput: false,
                gpu_count: 1,
                ..AgentConfig::default()
            },
            dirs: Dirs::new(tmp.path().join("fleet"), tmp.path().join("temp")),
            broker: Arc::new(ResourceBroker::with_seed(1, 11)),
            registry: Arc::new(MandelboxRegistry::new()),
            datastore: HostDatastore::disabled(Arc::new(MemoryRepository::new())),
            runtime,
            verifier: Arc::new(InsecureVerifier),
            metrics: Arc::new(Metrics::new(1)),
            transport: TransportMap::default(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            death_tx,
        })
    }

    #[tokio::test]
    async fn successful_spinup_reaches_waiting_with_populated_params() {
        let tmp = TempDir::new().unwrap();
        let agent = test_agent(Arc::new(NullRuntime::new()), &tmp);

        let mandelbox_id = MandelboxId::new();
        let mandelbox = agent
            .start_mandelbox_spin_up(mandelbox_id, "browsers/chromium")
            .await
            .unwrap();

        assert_eq!(mandelbox.status(), LocalStatus::Waiting);
        assert_eq!(agent.registry.count(), 1);
        assert!(mandelbox.runtime_id().is_some());

        let mapping_dir = agent.dirs.resource_mapping_dir(&mandelbox_id.to_string());
        for file in ["hostPort_for_my_32262_tcp", "tty", "gpu_index", "timeout", ".paramsReady"] {
            assert!(mapping_dir.join(file).exists(), "{file} missing");
        }
    }

    #[tokio::test]
    async fn failed_spinup_releases_every_acquired_resource() {
        let tmp = TempDir::new().unwrap();
        let agent = test_agent(Arc::new(FailingRuntime), &tmp);
        assert!(agent.broker.is_pristine());

        // Repeated guaranteed-failure spinups must leave the broker
        // exactly as it started.
        for _ in 0..5 {
            let err = agent
                .start_mandelbox_spin_up(MandelboxId::new(), "browsers/chromium")
                .await
                .unwrap_err();
            assert!(err.to_string().contains("engine on fire"));
            assert!(agent.broker.is_pristine());
            assert_eq!(agent.registry.count(), 0);
        }
        assert_eq!(agent.metrics.error_rate(), 5);
    }

    #[tokio::test]
    async fn die_handler_is_tolerant_of_unknown_containers() {
        let tmp = TempDir::new().unwrap();
        let agent = test_agent(Arc::new(NullRuntime::new()), &tmp);
        // Nothing registered: must not panic or touch broker state.
        agent.mandelbox_die_handler("runtime-ghost").await;
        assert!(agent.broker.is_pristine());
    }

    #[tokio::test]
    async fn die_handler_tears_down_and_frees_resources() {
        let tmp = TempDir::new().unwrap();
        let agent = test_agent(Arc::new(NullRuntime::new()), &tmp);

        let mandelbox = agent
            .start_mandelbox_spin_up(MandelboxId::new(), "browsers/chromium")
            .await
            .unwrap();
        let runtime_id = mandelbox.runtime_id().unwrap();
        assert!(!agent.broker.is_pristine());

        agent.mandelbox_die_handler(&runtime_id).await;
        assert!(agent.broker.is_pristine());
        assert_eq!(agent.registry.count(), 0);

        // A second die event for the same container is a no-op.
        agent.mandelbox_die_handler(&runtime_id).await;
    }

    #[test]
    fn container_names_are_sanitized() {
        assert_eq!(
            sanitize_container_name("browsers/chromium-abc 123"),
            "browsers-chromium-abc-123"
        );
    }
}
