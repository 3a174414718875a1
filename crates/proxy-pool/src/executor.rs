//! Bounded-concurrency fan-out.
//!
//! Runs an async operation across a batch of items with a concurrency cap,
//! placing results at their input index regardless of completion order. A
//! progress callback fires as items finish; a [`CancelToken`] stops new
//! dispatches and aborts in-flight work while keeping the completed prefix.

use std::future::Future;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::debug;

/// Cooperative cancellation handle; cloneable, observed by the executor
/// between and during item dispatches.
#[derive(Clone)]
pub struct CancelToken {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: std::sync::Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        // The sender lives in self, so changed() can only fail after cancel.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one batch run. `results[i]` is `None` iff item `i` never
/// completed (cancelled before or during its dispatch).
#[derive(Debug)]
pub struct BatchOutcome<R> {
    pub results: Vec<Option<R>>,
    pub completed: usize,
    pub cancelled: bool,
}

impl<R> BatchOutcome<R> {
    /// Completed results in input order, dropping never-run slots.
    pub fn into_completed(self) -> Vec<R> {
        self.results.into_iter().flatten().collect()
    }
}

pub type ProgressFn<'a> = &'a mut (dyn FnMut(usize, usize) + Send);

pub struct ParallelExecutor {
    concurrency: usize,
}

impl ParallelExecutor {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Runs `op` over `items`. Two or fewer items run serially in order;
    /// larger batches keep up to the concurrency cap in flight. The progress
    /// callback observes a strictly non-decreasing completed count.
    pub async fn run<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        op: F,
        mut on_progress: Option<ProgressFn<'_>>,
        cancel: Option<&CancelToken>,
    ) -> BatchOutcome<R>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = R>,
    {
        let total = items.len();
        let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
        let mut completed = 0usize;
        let mut cancelled = false;

        if total <= 2 {
            for (index, item) in items.into_iter().enumerate() {
                if is_cancelled(cancel) {
                    cancelled = true;
                    break;
                }
                let value = match cancel {
                    Some(token) => tokio::select! {
                        _ = token.cancelled() => None,
                        value = op(item) => Some(value),
                    },
                    None => Some(op(item).await),
                };
                match value {
                    Some(value) => {
                        results[index] = Some(value);
                        completed += 1;
                        if let Some(progress) = on_progress.as_mut() {
                            progress(completed, total);
                        }
                    }
                    None => {
                        cancelled = true;
                        break;
                    }
                }
            }
            return BatchOutcome { results, completed, cancelled };
        }

        let op = &op;
        let mut in_flight = stream::iter(items.into_iter().enumerate().map(|(index, item)| async move {
            (index, op(item).await)
        }))
        .buffer_unordered(self.concurrency);

        loop {
            let next = match cancel {
                Some(token) => tokio::select! {
                    _ = token.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    next = in_flight.next() => next,
                },
                None => in_flight.next().await,
            };
            let Some((index, value)) = next else { break };
            results[index] = Some(value);
            completed += 1;
            if let Some(progress) = on_progress.as_mut() {
                progress(completed, total);
            }
        }

        // Dropping the stream aborts everything still in flight.
        drop(in_flight);
        if cancelled {
            debug!("batch cancelled after {}/{} items", completed, total);
        }
        BatchOutcome { results, completed, cancelled }
    }
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::new(10)
    }
}

fn is_cancelled(cancel: Option<&CancelToken>) -> bool {
    cancel.map(CancelToken::is_cancelled).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serial_path_preserves_order() {
        let executor = ParallelExecutor::new(4);
        let outcome = executor
            .run(vec![1u64, 2], |n| async move { n * 10 }, None, None)
            .await;
        assert_eq!(outcome.results, vec![Some(10), Some(20)]);
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let executor = ParallelExecutor::new(4);
        let token = CancelToken::new();
        token.cancel();
        let outcome = executor
            .run(vec![1u64, 2], |n| async move { n }, None, Some(&token))
            .await;
        assert!(outcome.cancelled);
        assert_eq!(outcome.completed, 0);
        assert!(outcome.results.iter().all(Option::is_none));
    }
}
