//! Fixed-capacity worker pool.
//!
//! The pool does no queueing of its own. A caller first takes a [`Slot`]
//! with [`WorkerPool::try_acquire`], then hands it to [`WorkerPool::run`]
//! together with the session future. The slot travels into the spawned task
//! and is released when that task ends, however it ends.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::trace;

struct PoolInner {
    capacity: usize,
    occupied: AtomicUsize,
    /// Highest occupancy ever observed
    peak: AtomicUsize,
    /// Signalled each time a slot is released
    released: Notify,
}

/// Bounded set of execution slots shared by the controller and its sessions.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                occupied: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                released: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn occupied(&self) -> usize {
        self.inner.occupied.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.occupied())
    }

    pub fn peak_occupied(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    /// Take a slot if one is free. Never blocks.
    pub fn try_acquire(&self) -> Option<Slot> {
        let inner = &self.inner;
        let mut current = inner.occupied.load(Ordering::SeqCst);
        loop {
            if current >= inner.capacity {
                return None;
            }
            match inner.occupied.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    inner.peak.fetch_max(current + 1, Ordering::SeqCst);
                    trace!(occupied = current + 1, "Slot acquired");
                    return Some(Slot {
                        pool: Arc::clone(inner),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Run `session` on its own task, holding `slot` until the task ends.
    pub fn run<F>(&self, slot: Slot, session: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let _slot = slot;
            session.await;
        })
    }

    /// Wait until some slot is released.
    ///
    /// Releases that happen while nobody is waiting are remembered once, so a
    /// release racing with the call is not lost.
    pub async fn released(&self) {
        self.inner.released.notified().await;
    }
}

/// An occupied pool slot. Dropping it frees the slot.
pub struct Slot {
    pool: Arc<PoolInner>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let previous = self.pool.occupied.fetch_sub(1, Ordering::SeqCst);
        trace!(occupied = previous - 1, "Slot released");
        self.pool.released.notify_one();
    }
}
