//! Deployment environment metadata.
//!
//! The services read two environment variables at startup: `APP_ENV`, which
//! selects the deployment environment, and `CI`, which marks a continuous
//! integration run (GPU assignment is bypassed there). Both are memoized on
//! first read.

use std::str::FromStr;
use std::sync::OnceLock;

/// The deployment environment this process runs in.
///
/// `LocalDev` and `LocalDevWithDb` are personal development instances (the
/// latter talks to a real database); `Dev`, `Staging`, and `Prod` are the
/// deployed tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    /// Local development without a database.
    LocalDev,
    /// Local development against a real database.
    LocalDevWithDb,
    /// Development deployment.
    Dev,
    /// Staging deployment.
    Staging,
    /// Production deployment.
    Prod,
}

impl AppEnvironment {
    /// Reads the environment from `APP_ENV`, defaulting to `LocalDev` for
    /// any unknown value.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var("APP_ENV")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Self::LocalDev)
    }

    /// Returns true for the local development environments.
    #[must_use]
    pub const fn is_local(self) -> bool {
        matches!(self, Self::LocalDev | Self::LocalDevWithDb)
    }

    /// Returns true when running locally without a database.
    #[must_use]
    pub const fn is_local_without_db(self) -> bool {
        matches!(self, Self::LocalDev)
    }

    /// Returns the lowercase name, useful for building larger strings such
    /// as image references.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalDev => "localdev",
            Self::LocalDevWithDb => "localdevwithdb",
            Self::Dev => "dev",
            Self::Staging => "staging",
            Self::Prod => "prod",
        }
    }
}

impl FromStr for AppEnvironment {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Dev),
            "staging" => Ok(Self::Staging),
            "prod" | "production" => Ok(Self::Prod),
            "localdevwithdb" | "localdev_with_db" => Ok(Self::LocalDevWithDb),
            _ => Ok(Self::LocalDev),
        }
    }
}

impl std::fmt::Display for AppEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns the memoized environment of this process.
#[must_use]
pub fn app_environment() -> AppEnvironment {
    static ENV: OnceLock<AppEnvironment> = OnceLock::new();
    *ENV.get_or_init(AppEnvironment::from_env)
}

/// Returns true when running in continuous integration.
///
/// Any of `1`, `true`, `yes`, `on` (case-insensitive) in `CI` counts.
#[must_use]
pub fn is_running_in_ci() -> bool {
    static CI: OnceLock<bool> = OnceLock::new();
    *CI.get_or_init(|| {
        matches!(
            std::env::var("CI").unwrap_or_default().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// Returns the build identifier this binary ships.
///
/// Instances only accept clients built from the same commit; registration
/// verifies the database row's sha is a prefix of this value.
#[must_use]
pub fn client_commit_hash() -> String {
    static SHA: OnceLock<String> = OnceLock::new();
    SHA.get_or_init(|| {
        std::env::var("FLEETBOX_COMMIT_SHA")
            .ok()
            .or_else(|| option_env!("FLEETBOX_COMMIT_SHA").map(str::to_owned))
            .unwrap_or_else(|| "local_dev".to_owned())
    })
    .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_environments() {
        assert_eq!("dev".parse::<AppEnvironment>(), Ok(AppEnvironment::Dev));
        assert_eq!("PROD".parse::<AppEnvironment>(), Ok(AppEnvironment::Prod));
        assert_eq!(
            "localdevwithdb".parse::<AppEnvironment>(),
            Ok(AppEnvironment::LocalDevWithDb)
        );
    }

    #[test]
    fn unknown_environment_defaults_to_localdev() {
        assert_eq!(
            "karaoke".parse::<AppEnvironment>(),
            Ok(AppEnvironment::LocalDev)
        );
    }

    #[test]
    fn local_predicates() {
        assert!(AppEnvironment::LocalDev.is_local());
        assert!(AppEnvironment::LocalDev.is_local_without_db());
        assert!(AppEnvironment::LocalDevWithDb.is_local());
        assert!(!AppEnvironment::LocalDevWithDb.is_local_without_db());
        assert!(!AppEnvironment::Prod.is_local());
    }
}
