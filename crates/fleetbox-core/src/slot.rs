//! One-shot delivery cell.
//!
//! The control plane hands values across tasks exactly once: an HTTP
//! transport request is consumed by exactly one spinup, and a spinup's
//! result is consumed by exactly one waiting HTTP handler. `OnceSlot`
//! enforces both halves with explicit set-or-error semantics: a second
//! `set` returns a typed error carrying the rejected value, and a second
//! `wait` finds the receiver gone.

use std::sync::Mutex;

use fleetbox_error::CommonError;
use tokio::sync::oneshot;

/// Why a `set` was rejected. Carries the value back to the caller so a
/// duplicate submission can still be answered.
#[derive(Debug)]
pub struct SlotSetError<T> {
    /// The value that was not stored.
    pub value: T,
    /// Whether the slot was already written or its consumer is gone.
    pub kind: SlotSetErrorKind,
}

/// The two ways a `set` can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSetErrorKind {
    /// The slot was already written once.
    AlreadySet,
    /// The consumer side was dropped before the value arrived.
    Abandoned,
}

impl<T> std::fmt::Display for SlotSetError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            SlotSetErrorKind::AlreadySet => f.write_str("slot already written"),
            SlotSetErrorKind::Abandoned => f.write_str("slot consumer dropped"),
        }
    }
}

impl<T: std::fmt::Debug> std::error::Error for SlotSetError<T> {}

/// A single-value, single-producer, single-consumer cell.
pub struct OnceSlot<T> {
    sender: Mutex<Option<oneshot::Sender<T>>>,
    receiver: Mutex<Option<oneshot::Receiver<T>>>,
}

impl<T> OnceSlot<T> {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
        }
    }

    /// Stores `value`, consuming the single write permit.
    ///
    /// # Errors
    ///
    /// Returns the value back inside a [`SlotSetError`] when the slot was
    /// already written or the consumer is gone.
    pub fn set(&self, value: T) -> Result<(), SlotSetError<T>> {
        let Some(sender) = self.sender.lock().expect("slot sender lock poisoned").take() else {
            return Err(SlotSetError {
                value,
                kind: SlotSetErrorKind::AlreadySet,
            });
        };
        sender.send(value).map_err(|value| SlotSetError {
            value,
            kind: SlotSetErrorKind::Abandoned,
        })
    }

    /// Waits for the value. Only the first caller receives it.
    ///
    /// # Errors
    ///
    /// Returns `CommonError::InvalidState` if another task already claimed
    /// the receive side, or if the producer side was dropped unwritten.
    pub async fn wait(&self) -> Result<T, CommonError> {
        let receiver = self
            .receiver
            .lock()
            .expect("slot receiver lock poisoned")
            .take()
            .ok_or_else(|| CommonError::invalid_state("slot already claimed"))?;
        receiver
            .await
            .map_err(|_| CommonError::invalid_state("slot producer dropped"))
    }

    /// Returns true once a value has been written (or the writer is gone).
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.sender.lock().expect("slot sender lock poisoned").is_none()
    }
}

impl<T> Default for OnceSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_once() {
        let slot = OnceSlot::new();
        slot.set(42).unwrap();
        assert!(slot.is_set());
        assert_eq!(slot.wait().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn double_set_returns_the_value() {
        let slot = OnceSlot::new();
        slot.set(1).unwrap();
        let err = slot.set(2).unwrap_err();
        assert_eq!(err.kind, SlotSetErrorKind::AlreadySet);
        assert_eq!(err.value, 2);
    }

    #[tokio::test]
    async fn double_wait_is_a_typed_error() {
        let slot = OnceSlot::new();
        slot.set("x").unwrap();
        let _ = slot.wait().await.unwrap();
        let err = slot.wait().await.unwrap_err();
        assert!(matches!(err, CommonError::InvalidState(_)));
    }

    #[tokio::test]
    async fn waiter_unblocks_on_set() {
        let slot = std::sync::Arc::new(OnceSlot::new());
        let waiter = {
            let slot = std::sync::Arc::clone(&slot);
            tokio::spawn(async move { slot.wait().await })
        };
        tokio::task::yield_now().await;
        slot.set(9).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 9);
    }
}
