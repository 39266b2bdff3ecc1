//! Host metrics.
//!
//! Request and error counters for the HTTP ingress plus the snapshot that
//! rides every heartbeat. Counters are plain atomics; the snapshot reads
//! `/proc/meminfo` best-effort and tolerates absence (non-Linux dev
//! machines).

use std::sync::atomic::{AtomicU64, Ordering};

use fleetbox_db::InstanceMetrics;

/// Process-wide counters.
#[derive(Default)]
pub struct Metrics {
    error_rate: AtomicU64,
    failed_requests: AtomicU64,
    successful_requests: AtomicU64,
    total_request_time_ms: AtomicU64,
    gpu_count: u64,
}

impl Metrics {
    /// Creates the counters for a host with `gpu_count` GPUs.
    #[must_use]
    pub fn new(gpu_count: usize) -> Self {
        Self {
            gpu_count: gpu_count as u64,
            ..Self::default()
        }
    }

    /// Counts one internal error.
    pub fn increment_error_rate(&self) {
        self.error_rate.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one rejected HTTP request.
    pub fn increment_failed_requests(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one served HTTP request.
    pub fn increment_successful_requests(&self) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Accumulates request handling time.
    pub fn add_request_time_ms(&self, elapsed_ms: u64) {
        self.total_request_time_ms
            .fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    /// Current error count (tests and logs).
    #[must_use]
    pub fn error_rate(&self) -> u64 {
        self.error_rate.load(Ordering::Relaxed)
    }

    /// Current failed-request count.
    #[must_use]
    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    /// The snapshot written with each heartbeat.
    #[must_use]
    pub fn snapshot(&self, mandelbox_count: usize) -> InstanceMetrics {
        InstanceMetrics {
            memory_remaining_kb: available_memory_kb().unwrap_or(0),
            nanocpus_remaining: available_nanocpus(),
            gpu_vram_remaining_kb: 0,
            number_of_gpus: u32::try_from(self.gpu_count).unwrap_or(0),
            mandelbox_count: u32::try_from(mandelbox_count).unwrap_or(0),
        }
    }
}

fn available_memory_kb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

fn available_nanocpus() -> u64 {
    let cpus = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1) as u64;
    cpus * 1_000_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new(2);
        metrics.increment_failed_requests();
        metrics.increment_failed_requests();
        metrics.increment_error_rate();
        assert_eq!(metrics.failed_requests(), 2);
        assert_eq!(metrics.error_rate(), 1);
    }

    #[test]
    fn snapshot_carries_gpu_and_mandelbox_counts() {
        let metrics = Metrics::new(4);
        let snapshot = metrics.snapshot(3);
        assert_eq!(snapshot.number_of_gpus, 4);
        assert_eq!(snapshot.mandelbox_count, 3);
        assert!(snapshot.nanocpus_remaining > 0);
    }
}
