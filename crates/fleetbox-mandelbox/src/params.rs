//! The per-mandelbox resource directory.
//!
//! The container reads its runtime parameters from small typed files in
//! `<fleet_dir>/<mandelbox_id>/mandelboxResourceMappings/`. Every file is
//! written atomically (temp file + rename) so the container never observes
//! a partial write, and the readiness markers are ordered: `.paramsReady`
//! before `.configReady` before `.ready`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleetbox_error::CommonError;
use tracing::debug;

use crate::error::{MandelboxError, Result};

/// Host port file for the identifying mandelbox port.
pub const HOST_PORT_FILE: &str = "hostPort_for_my_32262_tcp";
/// TTY index file.
pub const TTY_FILE: &str = "tty";
/// GPU index file.
pub const GPU_INDEX_FILE: &str = "gpu_index";
/// Protocol timeout file; `-1` means no timeout.
pub const TIMEOUT_FILE: &str = "timeout";
/// Session id file.
pub const SESSION_ID_FILE: &str = "session_id";
/// Client-provided JSON blob the protocol reads.
pub const CONFIG_JSON_FILE: &str = "config.json";

/// Marker: ports, TTY, and GPU are bound, A/V services may start.
pub const PARAMS_READY_MARKER: &str = ".paramsReady";
/// Marker: user configs are decrypted and unpacked.
pub const CONFIG_READY_MARKER: &str = ".configReady";
/// Marker: the mandelbox is fully ready for the client.
pub const READY_MARKER: &str = ".ready";

/// Poll interval for [`ResourceMappingDir::wait_for_file`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Writer for one mandelbox's resource-mapping directory.
#[derive(Debug, Clone)]
pub struct ResourceMappingDir {
    dir: PathBuf,
}

impl ResourceMappingDir {
    /// Creates a writer rooted at `dir` and ensures the directory exists.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be created.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(CommonError::Io)?;
        Ok(Self { dir })
    }

    /// The directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Writes one file atomically: the data lands in a temp file that is
    /// fsynced and renamed into place.
    pub fn write_file(&self, name: &str, data: &str) -> Result<()> {
        let final_path = self.dir.join(name);
        let temp_path = self.dir.join(format!(".{name}.tmp"));

        let mut file = std::fs::File::create(&temp_path).map_err(|e| {
            MandelboxError::from(CommonError::internal(format!(
                "creating {}: {e}",
                temp_path.display()
            )))
        })?;
        file.write_all(data.as_bytes()).map_err(|e| {
            MandelboxError::from(CommonError::internal(format!("writing {name}: {e}")))
        })?;
        file.sync_all().map_err(|e| {
            MandelboxError::from(CommonError::internal(format!("syncing {name}: {e}")))
        })?;
        drop(file);

        std::fs::rename(&temp_path, &final_path).map_err(|e| {
            MandelboxError::from(CommonError::internal(format!(
                "renaming {name} into place: {e}"
            )))
        })?;
        debug!(file = name, dir = %self.dir.display(), "wrote resource mapping");
        Ok(())
    }

    /// Writes the identifying host port.
    pub fn write_host_port(&self, host_port: u16) -> Result<()> {
        self.write_file(HOST_PORT_FILE, &host_port.to_string())
    }

    /// Writes the TTY index.
    pub fn write_tty(&self, tty: u8) -> Result<()> {
        self.write_file(TTY_FILE, &tty.to_string())
    }

    /// Writes the GPU index.
    pub fn write_gpu_index(&self, gpu_index: u8) -> Result<()> {
        self.write_file(GPU_INDEX_FILE, &gpu_index.to_string())
    }

    /// Writes the protocol timeout in seconds; `-1` disables the timeout
    /// (waiting zygotes).
    pub fn write_timeout(&self, seconds: i32) -> Result<()> {
        self.write_file(TIMEOUT_FILE, &seconds.to_string())
    }

    /// Writes the client session id.
    pub fn write_session_id(&self, session_id: &str) -> Result<()> {
        self.write_file(SESSION_ID_FILE, session_id)
    }

    /// Writes the client's JSON transport blob.
    pub fn write_config_json(&self, json_data: &str) -> Result<()> {
        self.write_file(CONFIG_JSON_FILE, json_data)
    }

    /// Creates `.paramsReady`.
    pub fn mark_params_ready(&self) -> Result<()> {
        self.write_file(PARAMS_READY_MARKER, "")
    }

    /// Creates `.configReady`. Requires `.paramsReady`.
    pub fn mark_config_ready(&self) -> Result<()> {
        self.require_marker(PARAMS_READY_MARKER)?;
        self.write_file(CONFIG_READY_MARKER, "")
    }

    /// Creates `.ready`. Requires `.configReady`.
    pub fn mark_ready(&self) -> Result<()> {
        self.require_marker(CONFIG_READY_MARKER)?;
        self.write_file(READY_MARKER, "")
    }

    fn require_marker(&self, predecessor: &str) -> Result<()> {
        if self.dir.join(predecessor).exists() {
            Ok(())
        } else {
            Err(MandelboxError::Lifecycle(format!(
                "marker ordering violated: {predecessor} missing in {}",
                self.dir.display()
            )))
        }
    }

    /// Returns true when the named file exists.
    #[must_use]
    pub fn has_file(&self, name: &str) -> bool {
        self.dir.join(name).exists()
    }

    /// Waits until the container creates `name`, up to `timeout`.
    ///
    /// # Errors
    ///
    /// Fails with a timeout error when the file does not appear in time.
    pub async fn wait_for_file(&self, name: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.has_file(name) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MandelboxError::from(CommonError::timeout(format!(
                    "file {name} not created within {timeout:?}"
                ))));
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Removes the whole directory. Missing directories are fine.
    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::error!(dir = %self.dir.display(), error = %e, "failed to remove resource dir");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn writer() -> (ResourceMappingDir, TempDir) {
        let tmp = TempDir::new().unwrap();
        let dir = ResourceMappingDir::create(tmp.path().join("mappings")).unwrap();
        (dir, tmp)
    }

    #[test]
    fn writes_typed_files() {
        let (dir, _tmp) = writer();
        dir.write_host_port(32801).unwrap();
        dir.write_tty(11).unwrap();
        dir.write_gpu_index(0).unwrap();
        dir.write_timeout(-1).unwrap();

        let read = |name: &str| std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read(HOST_PORT_FILE), "32801");
        assert_eq!(read(TTY_FILE), "11");
        assert_eq!(read(GPU_INDEX_FILE), "0");
        assert_eq!(read(TIMEOUT_FILE), "-1");
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let (dir, _tmp) = writer();
        dir.write_host_port(32801).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn markers_enforce_ordering() {
        let (dir, _tmp) = writer();
        assert!(dir.mark_config_ready().is_err());
        dir.mark_params_ready().unwrap();
        assert!(dir.mark_ready().is_err());
        dir.mark_config_ready().unwrap();
        dir.mark_ready().unwrap();
        assert!(dir.has_file(READY_MARKER));
    }

    #[tokio::test]
    async fn wait_for_file_sees_late_creation() {
        let (dir, _tmp) = writer();
        let path = dir.path().join("done_sleeping_until_X_clients");
        let writer_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            std::fs::write(path, "").unwrap();
        });
        dir.wait_for_file("done_sleeping_until_X_clients", Duration::from_secs(5))
            .await
            .unwrap();
        writer_task.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_file_times_out() {
        let (dir, _tmp) = writer();
        let err = dir
            .wait_for_file("never", Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, MandelboxError::Common(e) if e.is_timeout()));
    }
}
