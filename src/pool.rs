//! Bounded task pool returning futures.
//!
//! Jobs are plain closures pushed onto a bounded `flume` queue and drained
//! by blocking worker tasks; every push hands back a future resolving to
//! the job's result. Stages use a pool for intra-rank parallelism: the
//! source reads per-file time axes through one, and map-reduce fan-out is
//! bounded by the stage's configured width. A panicking job surfaces as a
//! [`Error::Resource`] on its future, never as a process abort.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct TaskPool {
    queue: flume::Sender<Job>,
    width: usize,
}

/// Resolves pool widths: `n < 0` means hardware concurrency, `n == 0` is
/// clamped to one worker.
pub fn resolve_width(n: isize) -> usize {
    if n < 0 {
        std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1)
    } else {
        (n as usize).max(1)
    }
}

impl TaskPool {
    /// Spawns `n` blocking workers (`-1` = hardware concurrency). Must be
    /// called from within a tokio runtime.
    pub fn new(n: isize) -> Self {
        let width = resolve_width(n);
        let (queue, rx) = flume::bounded::<Job>(4 * width);
        for _ in 0..width {
            let rx = rx.clone();
            tokio::task::spawn_blocking(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            });
        }
        Self { queue, width }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Enqueues a job; awaits only when the queue is full.
    pub async fn push<T, F>(&self, job: F) -> TaskFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let wrapped: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(job))
                .unwrap_or_else(|_| Err(Error::resource("pool worker panicked")));
            let _ = tx.send(result);
        });
        if self.queue.send_async(wrapped).await.is_err() {
            // Workers are gone; the receiver side of `rx` will report it.
            tracing::error!("task pool queue closed, dropping job");
        }
        TaskFuture { rx }
    }

    /// Collects a batch of results in submission order, failing on the
    /// first job error.
    pub async fn wait_all<T: Send + 'static>(futures: Vec<TaskFuture<T>>) -> Result<Vec<T>> {
        let mut results = Vec::with_capacity(futures.len());
        for f in futures {
            results.push(f.await?);
        }
        Ok(results)
    }
}

pub struct TaskFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for TaskFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(Error::resource("pool worker dropped its result")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn results_come_back_in_submission_order() {
        let pool = TaskPool::new(4);
        let mut futures = Vec::new();
        for i in 0..32u64 {
            futures.push(pool.push(move || Ok(i * i)).await);
        }
        let results = TaskPool::wait_all(futures).await.unwrap();
        let expected: Vec<u64> = (0..32).map(|i| i * i).collect();
        assert_eq!(results, expected);
    }

    #[tokio::test]
    async fn job_errors_propagate() {
        let pool = TaskPool::new(1);
        let f = pool
            .push(|| Err::<u64, _>(Error::semantic("bad input")))
            .await;
        assert!(f.await.is_err());
    }

    #[tokio::test]
    async fn panics_become_resource_errors() {
        let pool = TaskPool::new(1);
        let f = pool.push(|| -> Result<()> { panic!("boom") }).await;
        match f.await {
            Err(Error::Resource(_)) => {}
            other => panic!("expected resource error, got {other:?}"),
        }
    }

    #[test]
    fn width_resolution() {
        assert!(resolve_width(-1) >= 1);
        assert_eq!(resolve_width(0), 1);
        assert_eq!(resolve_width(3), 3);
    }
}
