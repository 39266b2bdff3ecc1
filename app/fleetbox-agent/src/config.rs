//! Host agent configuration.
//!
//! Everything comes from the environment (`FLEETBOX_*`) merged over serde
//! defaults; the agent itself takes no CLI flags. The host identity fields
//! (instance id, image id, region, instance type, public ip) are injected
//! by the launch userdata in deployments and default to local placeholders
//! for development.

use std::path::PathBuf;

use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// HTTPS port the agent listens on; permanently reserved in the port
/// broker.
pub const HTTPS_PORT: u16 = 4678;

/// Mandelboxes one GPU can drive; the capacity the agent reports at
/// registration.
pub const MANDELBOXES_PER_GPU: i32 = 3;

/// Host agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// User-visible root for mandelbox resources.
    pub fleet_dir: PathBuf,
    /// Root-only temp root (sockets, logs).
    pub temp_dir: PathBuf,
    /// Directory holding the TLS certificate and key.
    pub private_dir: PathBuf,

    /// This host's cloud instance id.
    pub instance_id: String,
    /// Machine image this host booted from.
    pub image_id: String,
    /// Cloud region.
    pub region: String,
    /// Cloud instance type.
    pub instance_type: String,
    /// Public IPv4 of this host.
    pub public_ip: String,

    /// GPUs on this host.
    pub gpu_count: usize,
    /// Application every zygote runs.
    pub app_name: String,
    /// Container engine socket.
    pub engine_socket: PathBuf,
    /// Whether to create virtual input devices (off in CI).
    pub enable_uinput: bool,

    /// Datastore GraphQL endpoint (HTTP).
    pub database_url: String,
    /// Datastore GraphQL endpoint (websocket).
    pub database_ws_url: String,
    /// Datastore admin secret.
    pub database_secret: Option<String>,

    /// Expected JWT audience.
    pub jwt_audience: String,
    /// Expected JWT issuer.
    pub jwt_issuer: String,
    /// JWKS endpoint for signature verification.
    pub jwks_url: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            fleet_dir: PathBuf::from("/fleetbox"),
            temp_dir: PathBuf::from("/fleetbox/temp"),
            private_dir: PathBuf::from("/fleetbox-private"),
            instance_id: format!("localdev-{}", std::process::id()),
            image_id: "localdev-image".to_owned(),
            region: "us-east-1".to_owned(),
            instance_type: "g4dn.2xlarge".to_owned(),
            public_ip: "127.0.0.1".to_owned(),
            gpu_count: 1,
            app_name: "browsers/chromium".to_owned(),
            engine_socket: PathBuf::from("/var/run/docker.sock"),
            enable_uinput: !fleetbox_core::environment::is_running_in_ci(),
            database_url: "http://localhost:8080/v1/graphql".to_owned(),
            database_ws_url: "ws://localhost:8080/v1/graphql".to_owned(),
            database_secret: None,
            jwt_audience: "https://api.fleetbox.dev".to_owned(),
            jwt_issuer: "https://auth.fleetbox.dev/".to_owned(),
            jwks_url: "https://auth.fleetbox.dev/.well-known/jwks.json".to_owned(),
        }
    }
}

impl AgentConfig {
    /// Loads configuration from the environment over defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when an environment value fails to parse.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("FLEETBOX_"))
            .extract()
    }

    /// The capacity this host reports when registering.
    #[must_use]
    pub fn reported_capacity(&self) -> i32 {
        i32::try_from(self.gpu_count).unwrap_or(0) * MANDELBOXES_PER_GPU
    }
}
