//! Shared building blocks for the fleetbox services.
//!
//! This crate holds what both the host agent and the scaling controller
//! need: environment metadata (`APP_ENV`, `CI`), the on-disk directory
//! layout for mandelbox resources, a cancellation-aware bounded retry
//! helper, and the one-shot [`slot::OnceSlot`] used to enforce once-only
//! delivery of requests and results.

pub mod dirs;
pub mod environment;
pub mod retry;
pub mod slot;

pub use dirs::Dirs;
pub use environment::AppEnvironment;
pub use slot::{OnceSlot, SlotSetError, SlotSetErrorKind};
