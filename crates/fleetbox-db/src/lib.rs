//! Datastore model and access for the fleetbox control plane.
//!
//! The datastore is the serialization point of the whole system: the host
//! agent registers itself and its mandelboxes there, the scaling controller
//! sizes the fleet from it, and all cross-service causality flows through
//! it. This crate defines the entities, the repository interfaces both
//! services program against, an in-memory repository for local development
//! and tests, a remote repository speaking GraphQL over HTTP, and the
//! long-lived websocket subscription client both services use for pub/sub.

pub mod hasura;
pub mod memory;
pub mod queries;
pub mod repository;
pub mod subscriptions;
pub mod types;

pub use memory::MemoryRepository;
pub use repository::{ConfigRepository, HostRepository, RegisterOutcome, ScalerRepository};
pub use types::{
    FrontendVersion, Image, Instance, InstanceMetrics, InstanceStatus, InstanceTakeover,
    InstanceWithMandelboxes, Mandelbox, MandelboxId, MandelboxStatus,
};
