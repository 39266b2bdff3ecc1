//! GPU slot allocation.
//!
//! Mandelboxes are spread across the host's GPUs by live count: an
//! assignment goes to the GPU currently running the fewest mandelboxes,
//! ties broken by the lowest index. CI hosts have no GPUs and skip
//! assignment entirely.

use parking_lot::Mutex;
use tracing::warn;

use fleetbox_error::CommonError;

use crate::error::Result;

/// Process-wide GPU usage table.
pub struct GpuAllocator {
    live_counts: Mutex<Vec<u32>>,
}

impl GpuAllocator {
    /// Creates a table for `gpu_count` devices.
    #[must_use]
    pub fn new(gpu_count: usize) -> Self {
        Self {
            live_counts: Mutex::new(vec![0; gpu_count]),
        }
    }

    /// Assigns the least-loaded GPU and increments its live count.
    ///
    /// # Errors
    ///
    /// Fails with a resource-exhaustion error when the host has no GPUs.
    pub fn assign(&self) -> Result<u8> {
        let mut counts = self.live_counts.lock();
        let (index, _) = counts
            .iter()
            .enumerate()
            .min_by_key(|(index, count)| (**count, *index))
            .ok_or_else(|| CommonError::exhausted("no GPUs on this host"))?;
        counts[index] += 1;
        #[allow(clippy::cast_possible_truncation)]
        Ok(index as u8)
    }

    /// Decrements a GPU's live count.
    pub fn release(&self, index: u8) {
        let mut counts = self.live_counts.lock();
        match counts.get_mut(index as usize) {
            Some(count) if *count > 0 => *count -= 1,
            _ => warn!(gpu = index, "released a GPU that had no live mandelboxes"),
        }
    }

    /// Snapshot of live counts per GPU.
    #[must_use]
    pub fn usage(&self) -> Vec<u32> {
        self.live_counts.lock().clone()
    }

    /// Number of GPUs on this host.
    #[must_use]
    pub fn gpu_count(&self) -> usize {
        self.live_counts.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balances_by_live_count() {
        let gpus = GpuAllocator::new(2);
        assert_eq!(gpus.assign().unwrap(), 0);
        assert_eq!(gpus.assign().unwrap(), 1);
        assert_eq!(gpus.assign().unwrap(), 0);
        assert_eq!(gpus.usage(), vec![2, 1]);
    }

    #[test]
    fn release_rebalances() {
        let gpus = GpuAllocator::new(2);
        let first = gpus.assign().unwrap();
        let _second = gpus.assign().unwrap();
        gpus.release(first);
        // GPU 0 is free again, so it wins the tie at count zero.
        assert_eq!(gpus.assign().unwrap(), 0);
    }

    #[test]
    fn no_gpus_is_an_exhaustion_error() {
        let gpus = GpuAllocator::new(0);
        assert!(gpus.assign().unwrap_err().is_exhausted());
    }

    #[test]
    fn release_below_zero_is_ignored() {
        let gpus = GpuAllocator::new(1);
        gpus.release(0);
        assert_eq!(gpus.usage(), vec![0]);
    }
}
