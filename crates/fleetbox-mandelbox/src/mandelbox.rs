//! The mandelbox object.
//!
//! One `Mandelbox` exists per user-dedicated container on this host. It is
//! the exclusive owner of its host resources (port bindings, TTY, GPU slot,
//! uinput devices, on-disk directories) from creation until `close()`,
//! which is idempotent and always releases everything, no matter how far
//! the spinup got.
//!
//! Lifecycle:
//!
//! ```text
//! Created → ParamsReady → Waiting → Allocated → Connecting → Running → Closed
//!      ↘ (any state) ────────────────────────────────────────────→ Closed
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetbox_core::Dirs;
use fleetbox_db::MandelboxId;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::ResourceBroker;
use crate::error::{MandelboxError, Result};
use crate::params::ResourceMappingDir;
use crate::ports::{PortBinding, Protocol};
use crate::uinput::{self, DeviceMapping, UinputDevices};

/// Marker file the application creates when it finished starting up.
pub const READY_SIGNAL_FILE: &str = "done_sleeping_until_X_clients";

/// File the user's initial browser data is written to.
pub const BROWSER_DATA_FILE: &str = "initial_browser_data.json";

/// Host-local lifecycle status of a mandelbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalStatus {
    /// Object exists, no resources bound yet.
    Created,
    /// Resources bound, parameter files written, container created.
    ParamsReady,
    /// Container started; zygote waiting for a user.
    Waiting,
    /// A user was assigned by the scaling controller.
    Allocated,
    /// Transport request received; configs decrypting.
    Connecting,
    /// Application up and serving.
    Running,
    /// Torn down; all resources released.
    Closed,
}

impl std::fmt::Display for LocalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::ParamsReady => "params_ready",
            Self::Waiting => "waiting",
            Self::Allocated => "allocated",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

struct State {
    status: LocalStatus,
    runtime_id: Option<String>,
    user_id: Option<String>,
    session_id: Option<String>,
    tty: Option<u8>,
    gpu_index: Option<u8>,
    port_bindings: Vec<PortBinding>,
    uinput: Option<UinputDevices>,
    uinput_server: Option<tokio::task::JoinHandle<()>>,
    private_key: Option<String>,
    params: Option<ResourceMappingDir>,
    updated_at: DateTime<Utc>,
}

/// One mandelbox and everything it owns on this host.
pub struct Mandelbox {
    id: MandelboxId,
    app_name: String,
    server_session_id: String,
    broker: Arc<ResourceBroker>,
    dirs: Dirs,
    cancel: CancellationToken,
    death_tx: mpsc::Sender<MandelboxId>,
    state: Mutex<State>,
}

impl std::fmt::Debug for Mandelbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mandelbox")
            .field("id", &self.id)
            .field("app_name", &self.app_name)
            .finish_non_exhaustive()
    }
}

impl Mandelbox {
    /// Creates a new mandelbox object in `Created` state.
    ///
    /// The `death_tx` channel is signalled exactly once, from `close()`, so
    /// the event loop can refill waiting mandelboxes.
    #[must_use]
    pub fn new(
        id: MandelboxId,
        app_name: impl Into<String>,
        broker: Arc<ResourceBroker>,
        dirs: Dirs,
        death_tx: mpsc::Sender<MandelboxId>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            app_name: app_name.into(),
            server_session_id: rand_hex(20),
            broker,
            dirs,
            cancel: CancellationToken::new(),
            death_tx,
            state: Mutex::new(State {
                status: LocalStatus::Created,
                runtime_id: None,
                user_id: None,
                session_id: None,
                tty: None,
                gpu_index: None,
                port_bindings: Vec::new(),
                uinput: None,
                uinput_server: None,
                private_key: None,
                params: None,
                updated_at: Utc::now(),
            }),
        })
    }

    /// The mandelbox id.
    #[must_use]
    pub fn id(&self) -> MandelboxId {
        self.id
    }

    /// The application this mandelbox runs (e.g. `browsers/chromium`).
    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// The application name the datastore stores: uppercased, with the
    /// `browsers/` prefix stripped.
    #[must_use]
    pub fn app_name_for_db(&self) -> String {
        self.app_name
            .rsplit('/')
            .next()
            .unwrap_or(&self.app_name)
            .to_uppercase()
    }

    /// Server-side session id, distinct from the client's session id; used
    /// for log paths of services that start before a user is assigned.
    #[must_use]
    pub fn server_session_id(&self) -> &str {
        &self.server_session_id
    }

    /// This mandelbox's cancellation token; cancelled by `close()`.
    #[must_use]
    pub fn context(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> LocalStatus {
        self.state.lock().status
    }

    /// Moves the lifecycle forward and bumps `updated_at`.
    pub fn set_status(&self, status: LocalStatus) {
        let mut state = self.state.lock();
        state.status = status;
        state.updated_at = Utc::now();
    }

    /// Last state-change time.
    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.state.lock().updated_at
    }

    // ------------------------------------------------------------------
    // Resource binding
    // ------------------------------------------------------------------

    /// Atomically allocates the desired port bindings from the broker.
    pub fn assign_port_bindings(&self, desired: &[PortBinding]) -> Result<()> {
        let granted = self.broker.ports.allocate(desired)?;
        self.state.lock().port_bindings = granted;
        Ok(())
    }

    /// Snapshot of the granted bindings.
    #[must_use]
    pub fn port_bindings(&self) -> Vec<PortBinding> {
        self.state.lock().port_bindings.clone()
    }

    /// Host port bound to a given mandelbox port.
    pub fn host_port(&self, mandelbox_port: u16, protocol: Protocol) -> Result<u16> {
        self.state
            .lock()
            .port_bindings
            .iter()
            .find(|b| b.mandelbox_port == mandelbox_port && b.protocol == protocol)
            .map(|b| b.host_port)
            .ok_or_else(|| {
                MandelboxError::Lifecycle(format!(
                    "no host port bound for {mandelbox_port}/{protocol}"
                ))
            })
    }

    /// Assigns the lowest free TTY.
    pub fn initialize_tty(&self) -> Result<()> {
        let tty = self.broker.ttys.assign()?;
        self.state.lock().tty = Some(tty);
        Ok(())
    }

    /// The assigned TTY, if any.
    #[must_use]
    pub fn tty(&self) -> Option<u8> {
        self.state.lock().tty
    }

    /// Assigns the least-loaded GPU. Skipped in CI by the caller.
    pub fn assign_gpu(&self) -> Result<()> {
        let index = self.broker.gpus.assign()?;
        self.state.lock().gpu_index = Some(index);
        Ok(())
    }

    /// The assigned GPU index, if any.
    #[must_use]
    pub fn gpu_index(&self) -> Option<u8> {
        self.state.lock().gpu_index
    }

    /// Creates the virtual input devices and starts the socket that ships
    /// their fds into the mandelbox.
    pub fn initialize_uinput_devices(&self) -> Result<()> {
        let devices = uinput::create_devices(&self.id.to_string())?;
        let socket_path = self.uinput_socket_path();
        let server = uinput::spawn_fd_server(&socket_path, &devices, self.cancel.child_token())?;

        let mut state = self.state.lock();
        state.uinput = Some(devices);
        state.uinput_server = Some(server);
        Ok(())
    }

    /// Container device mappings for the created input devices.
    #[must_use]
    pub fn device_mappings(&self) -> Vec<DeviceMapping> {
        self.state
            .lock()
            .uinput
            .as_ref()
            .map(UinputDevices::device_mappings)
            .unwrap_or_default()
    }

    fn uinput_socket_path(&self) -> PathBuf {
        self.dirs
            .sockets_dir(&self.id.to_string())
            .join("uinput.sock")
    }

    // ------------------------------------------------------------------
    // Parameter files
    // ------------------------------------------------------------------

    /// Writes the identifying host port, TTY, and GPU index into the
    /// resource-mapping directory.
    pub fn write_params(&self) -> Result<()> {
        let params = ResourceMappingDir::create(self.dirs.resource_mapping_dir(&self.id.to_string()))?;
        let host_port = self.host_port(32262, Protocol::Tcp)?;
        let (tty, gpu_index) = {
            let state = self.state.lock();
            (state.tty, state.gpu_index)
        };

        params.write_host_port(host_port)?;
        params.write_tty(tty.ok_or_else(|| {
            MandelboxError::Lifecycle("params written before TTY assignment".into())
        })?)?;
        // CI hosts skip GPU assignment; the container still expects a value.
        params.write_gpu_index(gpu_index.unwrap_or(0))?;

        self.state.lock().params = Some(params);
        Ok(())
    }

    /// Writes the protocol timeout; `-1` means wait forever (zygotes).
    pub fn write_protocol_timeout(&self, seconds: i32) -> Result<()> {
        self.params_handle()?.write_timeout(seconds)
    }

    /// Creates `.paramsReady`, unblocking the container's A/V services.
    pub fn mark_params_ready(&self) -> Result<()> {
        self.params_handle()?.mark_params_ready()
    }

    /// Creates `.configReady`, unblocking the user-config symlink step.
    pub fn mark_config_ready(&self) -> Result<()> {
        self.params_handle()?.mark_config_ready()
    }

    /// Writes the client session id file.
    pub fn write_session_id(&self) -> Result<()> {
        let session_id = self
            .session_id()
            .ok_or_else(|| MandelboxError::Lifecycle("no session id set".into()))?;
        self.params_handle()?.write_session_id(&session_id)
    }

    /// Writes the client's JSON transport blob for the protocol.
    pub fn write_config_json(&self, json_data: &str) -> Result<()> {
        self.params_handle()?.write_config_json(json_data)
    }

    /// Writes the user's initial browser data into the user-config
    /// directory.
    pub fn write_browser_data(&self, browser_data: &str) -> Result<()> {
        let dir = self.dirs.user_configs_dir(&self.id.to_string());
        std::fs::create_dir_all(&dir).map_err(fleetbox_error::CommonError::Io)?;
        std::fs::write(dir.join(BROWSER_DATA_FILE), browser_data)
            .map_err(fleetbox_error::CommonError::Io)?;
        Ok(())
    }

    /// Waits for the application's readiness signal, up to `timeout`.
    pub async fn wait_for_ready_signal(&self, timeout: Duration) -> Result<()> {
        let params = self.params_handle()?;
        params.wait_for_file(READY_SIGNAL_FILE, timeout).await
    }

    fn params_handle(&self) -> Result<ResourceMappingDir> {
        self.state
            .lock()
            .params
            .clone()
            .ok_or_else(|| MandelboxError::Lifecycle("resource dir not yet created".into()))
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    /// Records the container runtime's id for this mandelbox.
    pub fn register_creation(&self, runtime_id: impl Into<String>) {
        self.state.lock().runtime_id = Some(runtime_id.into());
    }

    /// The container runtime id, once created.
    #[must_use]
    pub fn runtime_id(&self) -> Option<String> {
        self.state.lock().runtime_id.clone()
    }

    /// Binds this mandelbox to a user.
    pub fn assign_to_user(&self, user_id: impl Into<String>) {
        self.state.lock().user_id = Some(user_id.into());
    }

    /// The assigned user, if any.
    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        self.state.lock().user_id.clone()
    }

    /// Stores the client session id.
    pub fn set_session_id(&self, session_id: impl Into<String>) {
        self.state.lock().session_id = Some(session_id.into());
    }

    /// The client session id, if set.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }

    /// Stores the AES key returned to the client on transport.
    pub fn set_private_key(&self, key: impl Into<String>) {
        self.state.lock().private_key = Some(key.into());
    }

    /// The AES key, if generated.
    #[must_use]
    pub fn private_key(&self) -> Option<String> {
        self.state.lock().private_key.clone()
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Tears the mandelbox down and releases every held resource.
    ///
    /// Idempotent: only the first call does work. Always sends exactly one
    /// death event so the event loop can refill capacity.
    pub fn close(&self) {
        let (bindings, tty, gpu_index, uinput, server, params) = {
            let mut state = self.state.lock();
            if state.status == LocalStatus::Closed {
                return;
            }
            state.status = LocalStatus::Closed;
            state.updated_at = Utc::now();
            (
                std::mem::take(&mut state.port_bindings),
                state.tty.take(),
                state.gpu_index.take(),
                state.uinput.take(),
                state.uinput_server.take(),
                state.params.take(),
            )
        };

        // Stop per-mandelbox tasks (uinput fd server, pending waits).
        self.cancel.cancel();
        if let Some(server) = server {
            server.abort();
        }

        self.broker.ports.free(&bindings);
        if let Some(tty) = tty {
            self.broker.ttys.release(tty);
        }
        if let Some(gpu_index) = gpu_index {
            self.broker.gpus.release(gpu_index);
        }
        drop(uinput);

        if let Some(params) = params {
            params.remove();
        }
        let id_string = self.id.to_string();
        if let Err(e) = std::fs::remove_dir_all(self.dirs.mandelbox_dir(&id_string)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(mandelbox_id = %self.id, error = %e, "failed to remove mandelbox dir");
            }
        }
        if let Err(e) = std::fs::remove_dir_all(self.dirs.mandelbox_temp_dir(&id_string)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(mandelbox_id = %self.id, error = %e, "failed to remove mandelbox temp dir");
            }
        }

        if self.death_tx.try_send(self.id).is_err() {
            // The event loop is gone (shutdown) or the channel is full;
            // either way teardown already happened.
            info!(mandelbox_id = %self.id, "death event not delivered");
        }
        info!(mandelbox_id = %self.id, "mandelbox closed");
    }
}

fn rand_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

/// Generates the AES key handed to the client on transport.
#[must_use]
pub fn generate_aes_key() -> String {
    rand_hex(16)
}
