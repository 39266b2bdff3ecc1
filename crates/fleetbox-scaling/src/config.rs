//! Controller configuration.
//!
//! Most knobs come from the config datastore at startup: the minimum
//! accepted frontend version and the desired free-mandelbox buffer per
//! region. Everything falls back to safe defaults when the config
//! datastore has no entry.

use std::collections::HashMap;
use std::time::Duration;

use fleetbox_core::AppEnvironment;
use fleetbox_db::{ConfigRepository, FrontendVersion};
use parking_lot::RwLock;
use tracing::{error, info};

/// Fallback free-mandelbox buffer per region.
pub const DEFAULT_DESIRED_FREE_MANDELBOXES: i32 = 2;

/// Commit-hash sentinel that bypasses the version gate in development.
pub const CLIENT_COMMIT_HASH_DEV_OVERRIDE: &str = "local_dev";

/// How long to wait for launched instances to become ready.
pub const MAX_WAIT_TIME_READY: Duration = Duration::from_secs(5 * 60);

/// How long to wait for draining instances to terminate.
pub const MAX_WAIT_TIME_TERMINATED: Duration = Duration::from_secs(5 * 60);

/// Bounded-retry attempts for cloud launch calls.
pub const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Fixed spacing between cloud launch retries.
pub const WAIT_TIME_BEFORE_RETRY: Duration = Duration::from_secs(15);

/// Live mandelboxes one user may hold.
pub const DEFAULT_MANDELBOX_LIMIT_PER_USER: usize = 1;

/// Regions the controller serves.
pub const DEFAULT_ENABLED_REGIONS: &[&str] = &["us-east-1", "us-west-1", "ca-central-1"];

/// Per-controller configuration, shared read-mostly across actions.
pub struct ScalingConfig {
    /// Deployment environment.
    pub environment: AppEnvironment,
    /// Regions assignment may serve.
    pub enabled_regions: Vec<String>,
    /// Instance type launched on scale-up.
    pub default_instance_type: String,
    /// Live-mandelbox limit per user.
    pub mandelbox_limit_per_user: usize,
    desired_free_mandelboxes: RwLock<HashMap<String, i32>>,
    frontend_version: RwLock<Option<FrontendVersion>>,
}

impl ScalingConfig {
    /// Creates a config with defaults for the given environment.
    #[must_use]
    pub fn new(environment: AppEnvironment) -> Self {
        Self {
            environment,
            enabled_regions: DEFAULT_ENABLED_REGIONS
                .iter()
                .map(|r| (*r).to_owned())
                .collect(),
            default_instance_type: "g4dn.2xlarge".to_owned(),
            mandelbox_limit_per_user: DEFAULT_MANDELBOX_LIMIT_PER_USER,
            desired_free_mandelboxes: RwLock::new(HashMap::new()),
            frontend_version: RwLock::new(None),
        }
    }

    /// Populates the version gate and the per-region buffers from the
    /// config datastore. Missing or malformed entries fall back to the
    /// defaults; the query itself failing is logged, not fatal.
    pub async fn populate(&self, repository: &dyn ConfigRepository) {
        if self.environment.is_local_without_db() {
            info!("running on localdev, using default scaling configuration");
            return;
        }

        match repository.frontend_version().await {
            Ok(Some(version)) => self.set_frontend_version(version),
            Ok(None) => error!("config datastore has no frontend version row"),
            Err(e) => error!(error = %e, "failed to query frontend version"),
        }

        let configs = match repository.configs(self.environment.as_str()).await {
            Ok(configs) => configs,
            Err(e) => {
                error!(error = %e, "failed to query configs, keeping defaults");
                return;
            }
        };

        let mut buffers = HashMap::new();
        for region in &self.enabled_regions {
            let key = format!(
                "DESIRED_FREE_MANDELBOXES_{}",
                region.replace('-', "_").to_uppercase()
            );
            let desired = configs
                .get(&key)
                .and_then(|raw| raw.parse::<i32>().ok())
                .unwrap_or(DEFAULT_DESIRED_FREE_MANDELBOXES);
            buffers.insert(region.clone(), desired);
        }
        *self.desired_free_mandelboxes.write() = buffers;
    }

    /// The desired free-mandelbox buffer for a region.
    #[must_use]
    pub fn desired_free_mandelboxes(&self, region: &str) -> i32 {
        self.desired_free_mandelboxes
            .read()
            .get(region)
            .copied()
            .unwrap_or(DEFAULT_DESIRED_FREE_MANDELBOXES)
    }

    /// Overrides one region's buffer (tests and config reloads).
    pub fn set_desired_free_mandelboxes(&self, region: &str, desired: i32) {
        self.desired_free_mandelboxes
            .write()
            .insert(region.to_owned(), desired);
    }

    /// True when assignment may serve this region.
    #[must_use]
    pub fn is_region_enabled(&self, region: &str) -> bool {
        self.enabled_regions.iter().any(|r| r == region)
    }

    /// The memoized minimum frontend version, if known.
    #[must_use]
    pub fn frontend_version(&self) -> Option<FrontendVersion> {
        *self.frontend_version.read()
    }

    /// Updates the memoized frontend version (rollout events).
    pub fn set_frontend_version(&self, version: FrontendVersion) {
        *self.frontend_version.write() = Some(version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetbox_db::MemoryRepository;

    #[tokio::test]
    async fn populate_reads_buffers_and_version() {
        let repo = MemoryRepository::new();
        repo.seed_frontend_version(FrontendVersion { major: 3, minor: 0, micro: 0 });
        repo.seed_configs(
            [("DESIRED_FREE_MANDELBOXES_US_EAST_1".to_owned(), "5".to_owned())]
                .into_iter()
                .collect(),
        );

        let config = ScalingConfig::new(AppEnvironment::Dev);
        config.populate(&repo).await;

        assert_eq!(config.desired_free_mandelboxes("us-east-1"), 5);
        // No entry for us-west-1: default applies.
        assert_eq!(
            config.desired_free_mandelboxes("us-west-1"),
            DEFAULT_DESIRED_FREE_MANDELBOXES
        );
        assert_eq!(
            config.frontend_version(),
            Some(FrontendVersion { major: 3, minor: 0, micro: 0 })
        );
    }

    #[tokio::test]
    async fn localdev_keeps_defaults() {
        let repo = MemoryRepository::new();
        repo.seed_frontend_version(FrontendVersion { major: 9, minor: 9, micro: 9 });

        let config = ScalingConfig::new(AppEnvironment::LocalDev);
        config.populate(&repo).await;
        assert_eq!(config.frontend_version(), None);
    }
}
