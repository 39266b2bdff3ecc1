//! Common error types for fleetbox.
//!
//! This crate provides the unified error vocabulary shared across the
//! fleetbox crates. Each crate defines its own `thiserror` enum that wraps
//! `CommonError` via `#[from]` and adds crate-specific variants.

mod common;

pub use common::CommonError;

/// Result type alias using `CommonError`.
pub type Result<T> = std::result::Result<T, CommonError>;
