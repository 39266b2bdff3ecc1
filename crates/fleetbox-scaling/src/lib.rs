//! The per-region scaling algorithm.
//!
//! One [`DefaultScalingAlgorithm`] runs per cloud region. It consumes a
//! stream of [`ScalingEvent`]s (database changes, scheduled ticks, and
//! server requests), and dispatches each to a scaling action: verifying
//! the free-mandelbox buffer, launching or draining instances, reconciling
//! rows for terminated instances, rolling out new images, and assigning
//! user mandelbox requests to warm instances. The datastore is the
//! serialization point; actions are idempotent against repeated events.

pub mod actions;
pub mod algorithm;
pub mod assign;
pub mod capacity;
pub mod config;
pub mod event;
pub mod hosts;

pub use algorithm::DefaultScalingAlgorithm;
pub use assign::{AssignRequest, AssignResult};
pub use config::ScalingConfig;
pub use event::{EventKind, ScalingEvent};
pub use hosts::{HostHandler, RetryingHost};
