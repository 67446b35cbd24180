//! Bounded-concurrency executor with cancel-on-first-failure (spec.md
//! §4.5). Used by every multi-object operation: partition upload/download,
//! pooled WAL push, WAL prefetch.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// A single-use, bounded-concurrency pool. Tasks are submitted FIFO;
/// completion order is unspecified. The first task to fail cancels every
/// other task via a shared [`CancellationToken`] and `wait_all` returns
/// that failure.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    tasks: JoinSet<Result<()>>,
}

/// Handed to each submitted task so it can check for cooperative
/// cancellation between retry attempts or before spawning a subprocess
/// (spec.md §5).
#[derive(Clone)]
pub struct CancelGuard(CancellationToken);

impl CancelGuard {
    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.0.cancelled().await
    }
}

impl WorkerPool {
    /// `degree` is the concurrency bound `P` (spec.md §4.5 defaults: 4 for
    /// base-backup partitions, 8 for pooled WAL push/prefetch).
    pub fn new(degree: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(degree.max(1))),
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Submit one task. `f` receives a [`CancelGuard`] to observe
    /// cancellation triggered by a sibling's failure; a task may also
    /// simply return an error itself, which triggers cancellation of the
    /// rest of the pool.
    pub fn submit<F, Fut>(&mut self, f: F)
    where
        F: FnOnce(CancelGuard) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let cancel = self.cancel.clone();
        let guard = CancelGuard(cancel.clone());
        self.tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| Error::Fatal("worker pool semaphore closed".into()))?;
            if cancel.is_cancelled() {
                return Err(Error::Fatal("cancelled before running".into()));
            }
            f(guard).await
        });
    }

    /// Wait for every submitted task. Returns the first error encountered
    /// (by completion order, which is unspecified). As soon as one task
    /// fails, the shared cancellation token fires (so in-flight tasks
    /// checking [`CancelGuard`] can stop early) and every task still
    /// pending or running is aborted outright via `JoinSet::abort_all` —
    /// not merely left to finish naturally — then drained so this function
    /// still returns once every task has actually stopped. Returns `Ok(())`
    /// only if every task succeeded.
    pub async fn wait_all(mut self) -> Result<()> {
        let mut first_error: Option<Error> = None;
        while let Some(joined) = self.tasks.join_next().await {
            let outcome = match joined {
                Ok(result) => result,
                Err(join_err) if join_err.is_cancelled() => continue,
                Err(join_err) => Err(Error::Fatal(format!("worker task panicked: {join_err}"))),
            };
            if let Err(e) = outcome {
                if first_error.is_none() {
                    self.cancel.cancel();
                    self.tasks.abort_all();
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn all_tasks_succeed() {
        let mut pool = WorkerPool::new(2);
        let completed = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let completed = completed.clone();
            pool.submit(move |_guard| async move {
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        pool.wait_all().await.unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn first_failure_cancels_siblings() {
        let mut pool = WorkerPool::new(4);
        let ran_after_cancel = Arc::new(AtomicUsize::new(0));

        pool.submit(|_guard| async move { Err(Error::Integrity("boom".into())) });

        for _ in 0..4 {
            let ran_after_cancel = ran_after_cancel.clone();
            pool.submit(move |guard| async move {
                // Give the failing task a chance to land first.
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                if guard.is_cancelled() {
                    return Ok(());
                }
                ran_after_cancel.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let result = pool.wait_all().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn respects_concurrency_bound() {
        let mut pool = WorkerPool::new(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let in_flight = in_flight.clone();
            let max_observed = max_observed.clone();
            pool.submit(move |_guard| async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_observed.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        pool.wait_all().await.unwrap();
        assert!(max_observed.load(Ordering::SeqCst) <= 2);
    }
}
