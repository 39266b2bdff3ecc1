//! Mandelbox error types.

use fleetbox_error::CommonError;
use thiserror::Error;

/// Errors raised by the broker and the mandelbox lifecycle.
#[derive(Debug, Error)]
pub enum MandelboxError {
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Port allocation failed: out of range, reserved, in use, or no free
    /// random port found.
    #[error("port allocation failed: {0}")]
    PortAllocation(String),

    /// Virtual input device setup failed.
    #[error("uinput setup failed: {0}")]
    Uinput(String),

    /// Invalid lifecycle transition or missing resource.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),
}

impl MandelboxError {
    /// Returns true when the failure is host resource exhaustion.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Common(e) if e.is_exhausted())
    }
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, MandelboxError>;
