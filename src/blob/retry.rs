//! Retry/backoff policy, centralized (spec.md §9: "Retry/backoff was
//! ad-hoc per backend call: centralize as a policy wrapper over the Blob
//! Layer").

use std::future::Future;
use std::time::Duration;

use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;

use crate::error::{Error, Result};

/// Run `op`, retrying with bounded exponential backoff while it returns an
/// [`Error::Transient`]. Any other error kind is returned immediately. On
/// exhaustion the last transient error is promoted and returned as-is (the
/// caller's pool task then fails, per spec.md §7).
pub async fn with_retry<F, Fut, T>(op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(200))
        .with_max_interval(Duration::from_secs(10))
        .with_max_elapsed_time(Some(Duration::from_secs(60)))
        .build();

    retry(backoff, || async {
        match op().await {
            Ok(v) => Ok(v),
            Err(e) if e.is_retryable() => Err(backoff::Error::transient(e)),
            Err(e) => Err(backoff::Error::permanent(e)),
        }
    })
    .await
    .map_err(|e| match e {
        backoff::Error::Permanent(e) => e,
        backoff::Error::Transient { err, .. } => err,
    })
}

/// A request that never succeeds, for exhaustion tests, with a clock-free
/// bound on attempts rather than wall time.
#[cfg(test)]
fn fatal_error() -> Error {
    Error::Fatal("nope".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_on_first_try() {
        let calls = AtomicU32::new(0);
        let result = with_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(42)
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry(|| async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(Error::Transient("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = with_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(fatal_error())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
