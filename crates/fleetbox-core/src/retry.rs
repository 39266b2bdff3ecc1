//! Cancellation-aware bounded retry.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Runs `op` up to `max_attempts` times with a fixed `spacing` between
/// attempts, returning the first success or the last error.
///
/// Cancelling `cancel` stops waiting between attempts and surfaces the most
/// recent error; the attempt currently in flight is allowed to finish. The
/// first attempt runs immediately.
pub async fn with_spacing<T, E, F, Fut>(
    max_attempts: u32,
    spacing: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    debug_assert!(max_attempts > 0);

    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_attempts || cancel.is_cancelled() {
                    return Err(err);
                }
                warn!(attempt, max_attempts, error = %err, "attempt failed, retrying");
                tokio::select! {
                    () = tokio::time::sleep(spacing) => {}
                    () = cancel.cancelled() => return Err(err),
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_first_success() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> =
            with_spacing(3, Duration::from_millis(1), &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_exhausted() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<(), String> =
            with_spacing(3, Duration::from_millis(1), &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nope".to_owned())
            })
            .await;
        assert_eq!(result.unwrap_err(), "nope");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_waiting() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let result: Result<(), String> =
            with_spacing(10, Duration::from_secs(60), &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down".to_owned())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
