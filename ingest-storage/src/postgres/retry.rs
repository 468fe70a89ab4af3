//! The retry envelope (§4.7).
//!
//! Every transactional ingestion is wrapped in this loop. It retries only on
//! `IngestError::Conflict` (a transient MVCC conflict, see
//! `postgres::error::classify`), with a capped exponential backoff: up to
//! eight attempts, delay starting at 50ms and doubling, capped at 5s.
//! `tokio_retry`'s `ExponentialBackoff` iterator supplies the delay schedule;
//! the loop itself is hand-rolled rather than driven by `tokio_retry::Retry`
//! so that the cancellable sleep and the "carry the last transient error into
//! a cancellation" behaviour (§5, §7) can be expressed precisely.
//!
//! Crucially, `attempt` is called again from scratch on every retry — the
//! caller is responsible for writing the staging CSV once, before calling
//! `with_retry`, and reusing it on every attempt (§4.7, §6.3).

use ingest_core::error::IngestError;
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const MAX_ATTEMPTS: usize = 8;
const INITIAL_DELAY_MS: u64 = 50;
const MAX_DELAY: Duration = Duration::from_secs(5);

/// The 50ms, 100ms, 200ms, ... 6400ms (capped at 5s) delay schedule,
/// `MAX_ATTEMPTS` long.
fn backoff_schedule() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor(INITIAL_DELAY_MS / 2)
        .max_delay(MAX_DELAY)
        .take(MAX_ATTEMPTS)
}

/// Runs `attempt` up to [`MAX_ATTEMPTS`] times, retrying only on transient
/// conflicts. Checks `cancellation` before every attempt and races it against
/// the backoff sleep, so a cancellation is noticed promptly rather than only
/// between attempts.
pub async fn with_retry<F, Fut, T>(
    cancellation: &CancellationToken,
    mut attempt: F,
) -> Result<T, IngestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IngestError>>,
{
    let mut last_transient: Option<IngestError> = None;
    let mut delays = backoff_schedule();

    for attempt_no in 1..=MAX_ATTEMPTS {
        if cancellation.is_cancelled() {
            return Err(IngestError::cancelled(
                "context cancelled before attempt",
                last_transient,
            ));
        }

        match attempt().await {
            Ok(value) => {
                if attempt_no > 1 {
                    info!(attempt = attempt_no, "ingestion succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() => {
                warn!(attempt = attempt_no, error = %err, "transient conflict, retrying");
                let delay = delays.next().unwrap_or(MAX_DELAY);
                last_transient = Some(err);

                if attempt_no == MAX_ATTEMPTS {
                    break;
                }

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancellation.cancelled() => {
                        return Err(IngestError::cancelled(
                            "context cancelled during backoff",
                            last_transient,
                        ));
                    }
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_transient.unwrap_or_else(|| {
        IngestError::Store("retry attempts exhausted without a transient error".into())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn schedule_doubles_from_50ms_and_caps_at_5s() {
        let delays: Vec<Duration> = backoff_schedule().collect();
        assert_eq!(delays.len(), MAX_ATTEMPTS);
        assert_eq!(delays[0], Duration::from_millis(50));
        assert_eq!(delays[1], Duration::from_millis(100));
        assert_eq!(delays[2], Duration::from_millis(200));
        assert_eq!(delays[3], Duration::from_millis(400));
        assert_eq!(delays[4], Duration::from_millis(800));
        assert_eq!(delays[5], Duration::from_millis(1600));
        assert_eq!(delays[6], Duration::from_millis(3200));
        // 6400ms would be the unclamped 8th term; it must be capped.
        assert_eq!(delays[7], Duration::from_secs(5));
    }

    #[tokio::test]
    async fn succeeds_without_retry_on_first_success() {
        let calls = AtomicUsize::new(0);
        let token = CancellationToken::new();
        let result: Result<u32, IngestError> = with_retry(&token, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_conflicts_then_succeeds() {
        let calls = AtomicUsize::new(0);
        let token = CancellationToken::new();
        let result: Result<u32, IngestError> = with_retry(&token, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(IngestError::Conflict("could not serialize access".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_retries_non_transient_errors() {
        let calls = AtomicUsize::new(0);
        let token = CancellationToken::new();
        let result: Result<u32, IngestError> = with_retry(&token, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(IngestError::Validation("bad config".into()))
        })
        .await;
        assert!(matches!(result, Err(IngestError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_attempts_surfaces_last_transient_error() {
        let calls = AtomicUsize::new(0);
        let token = CancellationToken::new();
        let result: Result<u32, IngestError> = with_retry(&token, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(IngestError::Conflict("deadlock detected".into()))
        })
        .await;
        assert!(matches!(result, Err(IngestError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn cancellation_before_first_attempt_short_circuits() {
        let calls = AtomicUsize::new(0);
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<u32, IngestError> = with_retry(&token, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        })
        .await;
        assert!(matches!(result, Err(IngestError::Cancelled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
