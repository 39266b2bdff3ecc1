//! On-disk directory layout for mandelbox resources.
//!
//! Each mandelbox gets a resource-mapping directory the container reads its
//! parameters from, a user-config directory, a sockets directory for the
//! uinput file-descriptor hand-off, and a per-session log directory.

use std::path::{Path, PathBuf};

/// Root directories the host agent works under.
#[derive(Debug, Clone)]
pub struct Dirs {
    /// User-visible root (resource mappings, unpacked user configs).
    pub fleet_dir: PathBuf,
    /// Root-only temp root (uinput sockets, per-session logs).
    pub temp_dir: PathBuf,
}

impl Default for Dirs {
    fn default() -> Self {
        Self {
            fleet_dir: PathBuf::from("/fleetbox"),
            temp_dir: PathBuf::from("/fleetbox/temp"),
        }
    }
}

impl Dirs {
    /// Creates a layout rooted at the given directories.
    #[must_use]
    pub fn new(fleet_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            fleet_dir: fleet_dir.into(),
            temp_dir: temp_dir.into(),
        }
    }

    /// Directory of typed parameter files the container reads.
    #[must_use]
    pub fn resource_mapping_dir(&self, mandelbox_id: &str) -> PathBuf {
        self.fleet_dir
            .join(mandelbox_id)
            .join("mandelboxResourceMappings")
    }

    /// Directory the user's unpacked configs are symlinked from.
    #[must_use]
    pub fn user_configs_dir(&self, mandelbox_id: &str) -> PathBuf {
        self.fleet_dir
            .join(mandelbox_id)
            .join("userConfigs")
            .join("unpacked_configs")
    }

    /// Directory holding the uinput hand-off socket.
    #[must_use]
    pub fn sockets_dir(&self, mandelbox_id: &str) -> PathBuf {
        self.temp_dir.join(mandelbox_id).join("sockets")
    }

    /// Per-session log directory.
    #[must_use]
    pub fn session_log_dir(&self, mandelbox_id: &str, session_id: &str) -> PathBuf {
        self.temp_dir.join("logs").join(mandelbox_id).join(session_id)
    }

    /// Root of everything owned by one mandelbox under `fleet_dir`.
    #[must_use]
    pub fn mandelbox_dir(&self, mandelbox_id: &str) -> PathBuf {
        self.fleet_dir.join(mandelbox_id)
    }

    /// Root of everything owned by one mandelbox under `temp_dir`.
    #[must_use]
    pub fn mandelbox_temp_dir(&self, mandelbox_id: &str) -> PathBuf {
        self.temp_dir.join(mandelbox_id)
    }

    /// Returns true when `path` is inside the fleet directory.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.fleet_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let dirs = Dirs::new("/fleetbox", "/fleetbox/temp");
        assert_eq!(
            dirs.resource_mapping_dir("abc"),
            PathBuf::from("/fleetbox/abc/mandelboxResourceMappings")
        );
        assert_eq!(
            dirs.user_configs_dir("abc"),
            PathBuf::from("/fleetbox/abc/userConfigs/unpacked_configs")
        );
        assert_eq!(
            dirs.sockets_dir("abc"),
            PathBuf::from("/fleetbox/temp/abc/sockets")
        );
        assert_eq!(
            dirs.session_log_dir("abc", "s1"),
            PathBuf::from("/fleetbox/temp/logs/abc/s1")
        );
    }
}
