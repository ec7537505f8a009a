//! Bounded-parallel work queue with in-order result delivery.
//!
//! Three stages of the pipeline share this primitive: PBZX chunk decoding
//! and per-block LZFSE encoding need results in strict submission order,
//! and the per-file extraction pool reuses it as a plain bounded executor
//! (its results carry no payload, so the ordering is incidental there).
//!
//! Results come back in submission order because completed-but-out-of-turn
//! tasks simply sit finished in their join handles until their turn comes.
//! The result buffer is bounded: a permit is taken at submission and only
//! released once the task's result has been yielded to the consumer, so a
//! slow consumer stalls the producer rather than growing the buffer.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

struct Slot<T> {
    permit: OwnedSemaphorePermit,
    handle: JoinHandle<T>,
}

/// Submission half of a queue created by [`work_queue`].
pub struct WorkQueue<T> {
    slots: UnboundedSender<Slot<T>>,
    permits: Arc<Semaphore>,
}

/// Consumption half: results in submission order.
pub struct Results<T> {
    slots: UnboundedReceiver<Slot<T>>,
    permits: Arc<Semaphore>,
}

/// Create a queue running at most `batch` tasks concurrently.
pub fn work_queue<T: Send + 'static>(batch: usize) -> (WorkQueue<T>, Results<T>) {
    let permits = Arc::new(Semaphore::new(batch));
    let (tx, rx) = mpsc::unbounded_channel();
    (
        WorkQueue {
            slots: tx,
            permits: permits.clone(),
        },
        Results { slots: rx, permits },
    )
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Submit a task. Suspends while the queue is at capacity; fails with
    /// [`Error::Cancelled`] once the consumer has gone away.
    pub async fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let permit = self.admit().await?;
        self.dispatch(permit, tokio::spawn(task))
    }

    /// Submit CPU-bound work onto the blocking pool.
    pub async fn submit_blocking<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let permit = self.admit().await?;
        self.dispatch(permit, tokio::task::spawn_blocking(work))
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Cancelled)
    }

    fn dispatch(&self, permit: OwnedSemaphorePermit, handle: JoinHandle<T>) -> Result<()> {
        self.slots
            .send(Slot { permit, handle })
            .map_err(|_| Error::Cancelled)
    }
}

impl<T: Send + 'static> Results<T> {
    /// Next result in submission order, or `None` once every submitted task
    /// has been yielded and the submission half is dropped.
    pub async fn next(&mut self) -> Option<T> {
        let Slot { permit, handle } = self.slots.recv().await?;
        let value = match handle.await {
            Ok(value) => value,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            // Runtime shutdown; the driver is gone with it.
            Err(_) => return None,
        };
        drop(permit);
        Some(value)
    }
}

impl<T> Drop for Results<T> {
    fn drop(&mut self) {
        // Wake pending submitters so they observe cancellation instead of
        // waiting for permits that will never be released, and keep
        // not-yet-started tasks from starting.
        self.permits.close();
        self.slots.close();
        while let Ok(slot) = self.slots.try_recv() {
            slot.handle.abort();
        }
    }
}

/// Completion handle for a previously submitted job.
///
/// Clones share one signal. Waiting after the signal has fired resolves
/// immediately, and the signal fires on success and swallowed failure
/// alike, so a failing job still releases its dependents.
#[derive(Clone)]
pub struct Completion {
    done: watch::Receiver<bool>,
}

/// Signals the paired [`Completion`] when dropped.
pub struct CompletionGuard {
    done: watch::Sender<bool>,
}

pub fn completion() -> (Completion, CompletionGuard) {
    let (tx, rx) = watch::channel(false);
    (Completion { done: rx }, CompletionGuard { done: tx })
}

impl Completion {
    pub async fn wait(&self) {
        let mut done = self.done.clone();
        // The guard stores `true` before the sender can drop, so an error
        // here still means the job has finished.
        let _ = done.wait_for(|signalled| *signalled).await;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let _ = self.done.send(true);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn results_follow_submission_order() {
        let (queue, mut results) = work_queue(8);
        let consumer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(value) = results.next().await {
                seen.push(value);
            }
            seen
        });

        for i in 0u32..32 {
            queue
                .submit(async move {
                    // Later tasks finish earlier; order must still hold.
                    tokio::time::sleep(Duration::from_millis(u64::from(32 - i) % 7)).await;
                    i
                })
                .await
                .unwrap();
        }
        drop(queue);

        let seen = consumer.await.unwrap();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn at_most_batch_tasks_run_concurrently() {
        let batch = 4;
        let (queue, mut results) = work_queue(batch);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let consumer = tokio::spawn(async move { while results.next().await.is_some() {} });

        for _ in 0..24 {
            let running = running.clone();
            let peak = peak.clone();
            queue
                .submit_blocking(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
        }
        drop(queue);
        consumer.await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= batch);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_buffer_stalls_the_submitter() {
        let (queue, mut results) = work_queue::<u32>(2);
        queue.submit(async { 1 }).await.unwrap();
        queue.submit(async { 2 }).await.unwrap();

        // Both slots occupied until the consumer drains one.
        let stalled = tokio::time::timeout(Duration::from_millis(50), queue.submit(async { 3 }));
        assert!(stalled.await.is_err());

        assert_eq!(results.next().await, Some(1));
        tokio::time::timeout(Duration::from_millis(500), queue.submit(async { 3 }))
            .await
            .expect("slot freed by consumption")
            .unwrap();
    }

    #[tokio::test]
    async fn dropping_results_cancels_submission() {
        let (queue, results) = work_queue::<u32>(1);
        drop(results);
        assert!(matches!(
            queue.submit(async { 1 }).await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn completion_releases_all_clones() {
        let (handle, guard) = completion();
        let early = handle.clone();
        let waiter = tokio::spawn(async move { early.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);

        waiter.await.unwrap();
        // A wait that starts after the signal resolves immediately.
        handle.wait().await;
    }
}
