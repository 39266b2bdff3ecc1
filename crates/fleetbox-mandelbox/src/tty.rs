//! TTY allocation.
//!
//! The host exposes 256 TTY indices. Indices below 10 belong to the system
//! and are permanently reserved; mandelboxes get the lowest unused index in
//! `[10, 256)`.

use parking_lot::Mutex;
use tracing::warn;

use fleetbox_error::CommonError;

use crate::error::Result;

/// First index handed to mandelboxes; everything below is reserved.
pub const TTY_MIN: u16 = 10;
/// One past the last valid index.
pub const TTY_MAX: u16 = 256;

/// Process-wide TTY table.
pub struct TtyAllocator {
    in_use: Mutex<[bool; TTY_MAX as usize]>,
}

impl TtyAllocator {
    /// Creates the table with the system range marked used.
    #[must_use]
    pub fn new() -> Self {
        let mut table = [false; TTY_MAX as usize];
        for slot in table.iter_mut().take(TTY_MIN as usize) {
            *slot = true;
        }
        Self {
            in_use: Mutex::new(table),
        }
    }

    /// Returns the lowest unused TTY.
    ///
    /// # Errors
    ///
    /// Fails with a resource-exhaustion error when every index is taken.
    pub fn assign(&self) -> Result<u8> {
        let mut table = self.in_use.lock();
        for tty in TTY_MIN..TTY_MAX {
            if !table[tty as usize] {
                table[tty as usize] = true;
                #[allow(clippy::cast_possible_truncation)]
                return Ok(tty as u8);
            }
        }
        Err(CommonError::exhausted("no free TTY on this host").into())
    }

    /// Releases a TTY. Releasing a reserved or free index is logged and
    /// ignored.
    pub fn release(&self, tty: u8) {
        if u16::from(tty) < TTY_MIN {
            warn!(tty, "refusing to release a reserved TTY");
            return;
        }
        let mut table = self.in_use.lock();
        if !table[tty as usize] {
            warn!(tty, "released a TTY that was not assigned");
            return;
        }
        table[tty as usize] = false;
    }

    /// Returns true when the index is currently assigned or reserved.
    #[must_use]
    pub fn is_taken(&self, tty: u8) -> bool {
        self.in_use.lock()[tty as usize]
    }

    /// Number of TTYs currently assigned to mandelboxes.
    #[must_use]
    pub fn assigned_count(&self) -> usize {
        self.in_use.lock()[TTY_MIN as usize..]
            .iter()
            .filter(|used| **used)
            .count()
    }
}

impl Default for TtyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_lowest_free_index() {
        let ttys = TtyAllocator::new();
        assert_eq!(ttys.assign().unwrap(), 10);
        assert_eq!(ttys.assign().unwrap(), 11);
        ttys.release(10);
        assert_eq!(ttys.assign().unwrap(), 10);
    }

    #[test]
    fn reserved_range_is_never_assigned() {
        let ttys = TtyAllocator::new();
        for _ in 0..20 {
            let tty = ttys.assign().unwrap();
            assert!(u16::from(tty) >= TTY_MIN);
        }
    }

    #[test]
    fn exhausts_cleanly() {
        let ttys = TtyAllocator::new();
        for _ in TTY_MIN..TTY_MAX {
            ttys.assign().unwrap();
        }
        let err = ttys.assign().unwrap_err();
        assert!(err.is_exhausted());
    }

    #[test]
    fn release_of_reserved_index_is_ignored() {
        let ttys = TtyAllocator::new();
        ttys.release(3);
        assert!(ttys.is_taken(3));
    }

    #[test]
    fn double_release_is_harmless() {
        let ttys = TtyAllocator::new();
        let tty = ttys.assign().unwrap();
        ttys.release(tty);
        ttys.release(tty);
        assert_eq!(ttys.assigned_count(), 0);
    }
}
