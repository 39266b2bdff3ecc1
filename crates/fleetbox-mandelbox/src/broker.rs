//! The process-wide resource broker.
//!
//! Bundles the port, TTY, and GPU allocators behind one handle. Each
//! resource class keeps its own lock; operations are short and
//! non-blocking, and mutation happens only through the allocator methods.

use crate::gpu::GpuAllocator;
use crate::ports::PortBroker;
use crate::tty::TtyAllocator;

/// Every host-unique resource the agent hands to mandelboxes.
pub struct ResourceBroker {
    /// Host port maps (TCP and UDP).
    pub ports: PortBroker,
    /// TTY table.
    pub ttys: TtyAllocator,
    /// GPU usage table.
    pub gpus: GpuAllocator,
}

impl ResourceBroker {
    /// Creates a broker for a host with `gpu_count` GPUs.
    #[must_use]
    pub fn new(gpu_count: usize) -> Self {
        Self {
            ports: PortBroker::new(),
            ttys: TtyAllocator::new(),
            gpus: GpuAllocator::new(gpu_count),
        }
    }

    /// Deterministic broker for tests.
    #[must_use]
    pub fn with_seed(gpu_count: usize, seed: u64) -> Self {
        Self {
            ports: PortBroker::with_seed(seed),
            ttys: TtyAllocator::new(),
            gpus: GpuAllocator::new(gpu_count),
        }
    }

    /// Returns true when no mandelbox holds any resource: the state a
    /// broker starts in and must return to after every failed spinup.
    #[must_use]
    pub fn is_pristine(&self) -> bool {
        self.ports.in_use_count() == 0
            && self.ttys.assigned_count() == 0
            && self.gpus.usage().iter().all(|count| *count == 0)
    }
}
