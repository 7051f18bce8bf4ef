//! Bounded worker pool for blocking source invocations.
//!
//! Slots are handed out by a fair (FIFO) semaphore. A slot belongs to the
//! adapter that acquired it and is released when that adapter reaches its
//! terminal event. A blocking call the adapter abandoned after a timeout or
//! cancellation no longer counts against the pool, so a hung upstream
//! cannot starve sources queued behind it.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::cancel::CancelObserver;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
}

/// Result of waiting for a slot.
#[derive(Debug)]
pub enum Acquired {
    Slot(WorkerSlot),
    /// The session was cancelled while the invocation was queued.
    Cancelled,
    /// The source's deadline passed while the invocation was queued.
    Expired,
}

impl Acquired {
    pub fn slot(self) -> Option<WorkerSlot> {
        match self {
            Self::Slot(slot) => Some(slot),
            Self::Cancelled | Self::Expired => None,
        }
    }
}

impl WorkerPool {
    /// A pool of `size` slots; 0 is bumped to 1.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Waits for a free slot in FIFO order, giving up on cancellation or
    /// once `deadline` passes. A queued invocation that gives up is never
    /// started.
    pub async fn acquire(&self, cancel: &CancelObserver, deadline: Instant) -> Acquired {
        if cancel.is_cancelled() {
            return Acquired::Cancelled;
        }
        let slots = Arc::clone(&self.slots);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("queued invocation skipped after cancellation");
                Acquired::Cancelled
            }
            _ = tokio::time::sleep_until(deadline) => {
                debug!("queued invocation expired before a slot was free");
                Acquired::Expired
            }
            permit = slots.acquire_owned() => match permit {
                Ok(permit) => {
                    trace!(available = self.slots.available_permits(), "worker slot acquired");
                    Acquired::Slot(WorkerSlot { _permit: permit })
                }
                Err(_) => Acquired::Cancelled,
            },
        }
    }
}

/// A reserved slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
}

impl WorkerSlot {
    /// Runs `body` on the blocking thread pool. The slot is not moved, so
    /// its holder decides when the slot is released.
    pub fn spawn_blocking<F, T>(&self, body: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(body)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::Result;
    use tokio::time::Instant;

    use super::{Acquired, WorkerPool};
    use crate::cancel::CancellationController;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn never_runs_more_than_size_bodies_at_once() -> Result<()> {
        let pool = WorkerPool::new(2);
        let cancel = CancellationController::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let observer = cancel.observer();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let slot = pool
                    .acquire(&observer, far_deadline())
                    .await
                    .slot()
                    .expect("not cancelled");
                let outcome = slot
                    .spawn_blocking(move || {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(30));
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
                drop(slot);
                outcome
            }));
        }
        for handle in handles {
            handle.await??;
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(pool.available(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn queued_acquire_is_skipped_on_cancel() -> Result<()> {
        let pool = WorkerPool::new(1);
        let cancel = CancellationController::new();
        let held = pool.acquire(&cancel.observer(), far_deadline()).await.slot();
        assert!(held.is_some());

        let waiter = {
            let pool = pool.clone();
            let observer = cancel.observer();
            tokio::spawn(async move { pool.acquire(&observer, far_deadline()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        assert!(matches!(waiter.await?, Acquired::Cancelled));
        drop(held);
        assert_eq!(pool.available(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn queued_acquire_expires_at_its_deadline() -> Result<()> {
        let pool = WorkerPool::new(1);
        let cancel = CancellationController::new();
        let held = pool.acquire(&cancel.observer(), far_deadline()).await.slot();
        assert!(held.is_some());

        let started = std::time::Instant::now();
        let deadline = Instant::now() + Duration::from_millis(50);
        let outcome = pool.acquire(&cancel.observer(), deadline).await;
        assert!(matches!(outcome, Acquired::Expired));
        assert!(started.elapsed() < Duration::from_millis(500));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropping_the_slot_frees_it_while_the_body_still_runs() -> Result<()> {
        let pool = WorkerPool::new(1);
        let cancel = CancellationController::new();
        let slot = pool
            .acquire(&cancel.observer(), far_deadline())
            .await
            .slot()
            .expect("free slot");
        let body = slot.spawn_blocking(|| std::thread::sleep(Duration::from_millis(200)));
        drop(slot);

        assert_eq!(pool.available(), 1);
        assert!(!body.is_finished());
        body.await?;
        Ok(())
    }

    #[test]
    fn zero_sized_pool_still_has_one_slot() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }
}
