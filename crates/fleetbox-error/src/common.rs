//! Common error types shared across fleetbox crates.

use thiserror::Error;

/// Errors that occur across multiple fleetbox crates.
///
/// The variants follow the failure taxonomy of the control plane: transient
/// external calls (datastore, cloud provider), invariant violations caught at
/// registration or reconciliation, host resource exhaustion, client errors,
/// and lifecycle timeouts. Crate-specific errors wrap this type with
/// `#[from]`.
#[derive(Debug, Error)]
pub enum CommonError {
    /// I/O error from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Resource not found.
    ///
    /// Used when a requested row or in-memory entry (instance, mandelbox,
    /// image) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource already exists or was already submitted.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Invariant violation: an existing row or object does not match what
    /// this process expects (image id, commit sha, status, region).
    ///
    /// Permanent: callers must not retry.
    #[error("mismatch: {0}")]
    Mismatch(String),

    /// Invalid state transition.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Host resource exhaustion: no free port, TTY, or GPU.
    ///
    /// Fails a single spinup; the service keeps operating.
    #[error("resource exhausted: {0}")]
    Exhausted(String),

    /// A datastore call failed.
    ///
    /// Transient: callers may retry with bounded spacing.
    #[error("database error: {0}")]
    Database(String),

    /// A cloud-provider call failed.
    ///
    /// Transient: callers may retry with bounded spacing.
    #[error("cloud provider error: {0}")]
    Cloud(String),

    /// Operation exceeded its allowed time limit.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Internal error. Should carry enough context for debugging.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CommonError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// Creates a new already exists error.
    #[must_use]
    pub fn already_exists(resource: impl Into<String>) -> Self {
        Self::AlreadyExists(resource.into())
    }

    /// Creates a new mismatch error.
    #[must_use]
    pub fn mismatch(msg: impl Into<String>) -> Self {
        Self::Mismatch(msg.into())
    }

    /// Creates a new invalid state error.
    #[must_use]
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Creates a new resource exhaustion error.
    #[must_use]
    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::Exhausted(msg.into())
    }

    /// Creates a new database error.
    #[must_use]
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Creates a new cloud-provider error.
    #[must_use]
    pub fn cloud(msg: impl Into<String>) -> Self {
        Self::Cloud(msg.into())
    }

    /// Creates a new timeout error.
    #[must_use]
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if this error may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Cloud(_) | Self::Io(_))
    }

    /// Returns true if this is a not found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if this is a permanent invariant violation.
    #[must_use]
    pub const fn is_mismatch(&self) -> bool {
        matches!(self, Self::Mismatch(_))
    }

    /// Returns true if this is a resource exhaustion error.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted(_))
    }

    /// Returns true if this is a timeout error.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let common_err: CommonError = io_err.into();
        assert!(common_err.is_transient());
        assert!(common_err.to_string().contains("I/O error"));
    }

    #[test]
    fn mismatch_is_permanent() {
        let err = CommonError::mismatch("image id differs");
        assert!(err.is_mismatch());
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "mismatch: image id differs");
    }

    #[test]
    fn transient_kinds() {
        assert!(CommonError::database("connection refused").is_transient());
        assert!(CommonError::cloud("throttled").is_transient());
        assert!(!CommonError::exhausted("no free TTY").is_transient());
    }

    #[test]
    fn exhausted_error() {
        let err = CommonError::exhausted("no free port in range");
        assert!(err.is_exhausted());
        assert_eq!(err.to_string(), "resource exhausted: no free port in range");
    }

    #[test]
    fn timeout_error() {
        let err = CommonError::timeout("readiness marker not seen in 20s");
        assert!(err.is_timeout());
    }
}
