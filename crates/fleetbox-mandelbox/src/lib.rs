//! Mandelbox objects and host resource brokerage.
//!
//! A mandelbox is a short-lived, user-dedicated application container with
//! host resources bound to it: TCP/UDP port mappings, a TTY, a GPU slot,
//! and virtual input devices. This crate owns the process-wide broker that
//! hands those resources out without conflicts, the mandelbox object that
//! holds them through its lifecycle, the typed resource-directory files the
//! container reads its parameters from, and the registry that maps
//! mandelbox and runtime ids to live objects.

pub mod broker;
pub mod error;
pub mod gpu;
pub mod mandelbox;
pub mod params;
pub mod ports;
pub mod registry;
pub mod tty;
pub mod uinput;

pub use broker::ResourceBroker;
pub use error::{MandelboxError, Result};
pub use mandelbox::{LocalStatus, Mandelbox};
pub use ports::{PortBinding, Protocol};
pub use registry::MandelboxRegistry;
