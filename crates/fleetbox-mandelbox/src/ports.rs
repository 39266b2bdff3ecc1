//! Host port brokerage.
//!
//! Hands out host ports for mandelbox port bindings without conflicts. A
//! port is either reserved (permanently unavailable, e.g. the agent's own
//! HTTPS port), in use by exactly one mandelbox, or free. Allocation of a
//! binding list is atomic: on any failure every port taken so far is
//! released before the error is returned.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MandelboxError, Result};

/// Lowest allocatable host port (inclusive).
pub const MIN_ALLOWED_PORT: u16 = 1025;
/// Highest allocatable host port (exclusive).
pub const MAX_ALLOWED_PORT: u16 = 49151;

/// Bound on the random search for a free port.
const MAX_RANDOM_TRIES: u32 = 100;

/// Transport protocol of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// A port inside the mandelbox bound to a host port with the same protocol.
///
/// Host-local state, never persisted to the datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Port inside the mandelbox.
    pub mandelbox_port: u16,
    /// Port exposed on the host; `0` in a request means "any free port".
    pub host_port: u16,
    /// IP address the host port is bound to.
    pub bind_ip: String,
    /// Transport protocol.
    pub protocol: Protocol,
}

impl PortBinding {
    /// A request for any free host port for the given mandelbox port.
    #[must_use]
    pub fn any(mandelbox_port: u16, protocol: Protocol) -> Self {
        Self {
            mandelbox_port,
            host_port: 0,
            bind_ip: String::new(),
            protocol,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortStatus {
    Reserved,
    InUse,
}

#[derive(Default)]
struct PortMaps {
    tcp: HashMap<u16, PortStatus>,
    udp: HashMap<u16, PortStatus>,
}

impl PortMaps {
    fn map_for(&mut self, protocol: Protocol) -> &mut HashMap<u16, PortStatus> {
        match protocol {
            Protocol::Tcp => &mut self.tcp,
            Protocol::Udp => &mut self.udp,
        }
    }
}

/// Process-wide port broker. One lock guards both protocol maps so that a
/// multi-binding allocation is atomic.
pub struct PortBroker {
    inner: Mutex<(PortMaps, StdRng)>,
}

impl PortBroker {
    /// Creates a broker with a process-seeded PRNG.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((PortMaps::default(), StdRng::from_os_rng())),
        }
    }

    /// Creates a broker with a fixed seed (deterministic tests).
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            inner: Mutex::new((PortMaps::default(), StdRng::seed_from_u64(seed))),
        }
    }

    /// Permanently reserves a port so it is never handed to a mandelbox.
    ///
    /// Must be called at startup, before any mandelbox allocates.
    pub fn reserve(&self, port: u16, protocol: Protocol) {
        let mut guard = self.inner.lock();
        guard.0.map_for(protocol).insert(port, PortStatus::Reserved);
    }

    /// Allocates every requested binding or nothing.
    ///
    /// A zero `host_port` asks for a random free port; a nonzero one asks
    /// for that specific port.
    ///
    /// # Errors
    ///
    /// Fails when a specific port is out of `[1025, 49151)`, already
    /// reserved or in use, or when no free random port is found within 100
    /// tries. On failure no port is retained.
    pub fn allocate(&self, desired: &[PortBinding]) -> Result<Vec<PortBinding>> {
        let mut guard = self.inner.lock();
        let (maps, rng) = &mut *guard;

        let mut granted: Vec<PortBinding> = Vec::with_capacity(desired.len());
        let mut failure: Option<MandelboxError> = None;

        for request in desired {
            match allocate_single(maps, rng, request) {
                Ok(binding) => granted.push(binding),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            for binding in &granted {
                free_single(maps, binding);
            }
            return Err(err);
        }
        Ok(granted)
    }

    /// Releases every non-reserved binding. Freeing a reserved port is
    /// logged and ignored.
    pub fn free(&self, bindings: &[PortBinding]) {
        if bindings.is_empty() {
            return;
        }
        let mut guard = self.inner.lock();
        for binding in bindings {
            free_single(&mut guard.0, binding);
        }
    }

    /// Returns true when the port is currently reserved or in use.
    #[must_use]
    pub fn is_taken(&self, port: u16, protocol: Protocol) -> bool {
        self.inner.lock().0.map_for(protocol).contains_key(&port)
    }

    /// Number of ports currently in use by mandelboxes (reserved excluded).
    #[must_use]
    pub fn in_use_count(&self) -> usize {
        let mut guard = self.inner.lock();
        let tcp = guard
            .0
            .map_for(Protocol::Tcp)
            .values()
            .filter(|s| **s == PortStatus::InUse)
            .count();
        let udp = guard
            .0
            .map_for(Protocol::Udp)
            .values()
            .filter(|s| **s == PortStatus::InUse)
            .count();
        tcp + udp
    }
}

impl Default for PortBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn in_allowed_range(port: u16) -> bool {
    (MIN_ALLOWED_PORT..MAX_ALLOWED_PORT).contains(&port)
}

fn allocate_single(
    maps: &mut PortMaps,
    rng: &mut StdRng,
    request: &PortBinding,
) -> Result<PortBinding> {
    let map = maps.map_for(request.protocol);

    if request.host_port != 0 {
        if !in_allowed_range(request.host_port) {
            return Err(MandelboxError::PortAllocation(format!(
                "requested disallowed port {}/{}",
                request.host_port, request.protocol
            )));
        }
        if map.contains_key(&request.host_port) {
            return Err(MandelboxError::PortAllocation(format!(
                "port {}/{} already bound or reserved",
                request.host_port, request.protocol
            )));
        }
        map.insert(request.host_port, PortStatus::InUse);
        return Ok(request.clone());
    }

    for _ in 0..MAX_RANDOM_TRIES {
        let candidate = rng.random_range(MIN_ALLOWED_PORT..MAX_ALLOWED_PORT);
        if !map.contains_key(&candidate) {
            map.insert(candidate, PortStatus::InUse);
            return Ok(PortBinding {
                host_port: candidate,
                ..request.clone()
            });
        }
    }
    Err(MandelboxError::PortAllocation(format!(
        "no free random port for {}/{} after {MAX_RANDOM_TRIES} tries",
        request.mandelbox_port, request.protocol
    )))
}

fn free_single(maps: &mut PortMaps, binding: &PortBinding) {
    let map = maps.map_for(binding.protocol);
    match map.get(&binding.host_port) {
        None => warn!(
            port = binding.host_port,
            protocol = %binding.protocol,
            "tried to free a nonexistent port binding"
        ),
        Some(PortStatus::Reserved) => warn!(
            port = binding.host_port,
            protocol = %binding.protocol,
            "refusing to free a reserved port"
        ),
        Some(PortStatus::InUse) => {
            map.remove(&binding.host_port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard_request() -> Vec<PortBinding> {
        vec![
            PortBinding::any(32261, Protocol::Tcp),
            PortBinding::any(32262, Protocol::Tcp),
            PortBinding::any(32263, Protocol::Udp),
            PortBinding::any(32273, Protocol::Tcp),
        ]
    }

    #[test]
    fn allocates_all_or_nothing() {
        let broker = PortBroker::with_seed(7);
        let granted = broker.allocate(&standard_request()).unwrap();
        assert_eq!(granted.len(), 4);
        for binding in &granted {
            assert!(binding.host_port >= MIN_ALLOWED_PORT);
            assert!(binding.host_port < MAX_ALLOWED_PORT);
            assert!(broker.is_taken(binding.host_port, binding.protocol));
        }
        assert_eq!(broker.in_use_count(), 4);
    }

    #[test]
    fn specific_port_conflict_releases_partial_grant() {
        let broker = PortBroker::with_seed(7);
        broker.reserve(9000, Protocol::Tcp);

        let request = vec![
            PortBinding::any(32261, Protocol::Tcp),
            PortBinding {
                mandelbox_port: 32262,
                host_port: 9000,
                bind_ip: String::new(),
                protocol: Protocol::Tcp,
            },
        ];
        let err = broker.allocate(&request).unwrap_err();
        assert!(matches!(err, MandelboxError::PortAllocation(_)));
        // The first random grant must have been rolled back.
        assert_eq!(broker.in_use_count(), 0);
    }

    #[test]
    fn rejects_out_of_range_ports() {
        let broker = PortBroker::with_seed(7);
        for bad in [80, 1024, MAX_ALLOWED_PORT, 65535] {
            let err = broker
                .allocate(&[PortBinding {
                    mandelbox_port: 32262,
                    host_port: bad,
                    bind_ip: String::new(),
                    protocol: Protocol::Tcp,
                }])
                .unwrap_err();
            assert!(matches!(err, MandelboxError::PortAllocation(_)), "{bad}");
        }
        assert_eq!(broker.in_use_count(), 0);
    }

    #[test]
    fn free_returns_broker_to_initial_state() {
        let broker = PortBroker::with_seed(42);
        broker.reserve(4678, Protocol::Tcp);

        let granted = broker.allocate(&standard_request()).unwrap();
        broker.free(&granted);
        assert_eq!(broker.in_use_count(), 0);
        // The reserved port survives the free pass.
        assert!(broker.is_taken(4678, Protocol::Tcp));
    }

    #[test]
    fn freeing_reserved_port_is_ignored() {
        let broker = PortBroker::with_seed(42);
        broker.reserve(4678, Protocol::Tcp);
        broker.free(&[PortBinding {
            mandelbox_port: 0,
            host_port: 4678,
            bind_ip: String::new(),
            protocol: Protocol::Tcp,
        }]);
        assert!(broker.is_taken(4678, Protocol::Tcp));
    }

    #[test]
    fn same_port_different_protocols_coexist() {
        let broker = PortBroker::with_seed(42);
        let tcp = broker
            .allocate(&[PortBinding {
                mandelbox_port: 32262,
                host_port: 9000,
                bind_ip: String::new(),
                protocol: Protocol::Tcp,
            }])
            .unwrap();
        let udp = broker
            .allocate(&[PortBinding {
                mandelbox_port: 32263,
                host_port: 9000,
                bind_ip: String::new(),
                protocol: Protocol::Udp,
            }])
            .unwrap();
        assert_eq!(tcp[0].host_port, udp[0].host_port);
        assert_eq!(broker.in_use_count(), 2);
    }
}
