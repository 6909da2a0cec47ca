//! Admission control in front of the worker pool.
//!
//! Every arrival is either admitted straight onto a free slot or placed in
//! the waiting queue. A single dispatcher task owns the overflow path: it
//! sleeps until a slot is released, a new entry is queued, or the earliest
//! deadline passes, then admits eligible waiters in arrival order and evicts
//! the ones that waited too long.
//!
//! Each queued entry is removed under the queue lock by exactly one of the
//! two passes, so a connection is never both admitted and evicted.

use crate::config::AdmissionConfig;
use crate::connection::ConnectionHandle;
use crate::pool::{Slot, WorkerPool};
use crate::queue::{Waiting, WaitingQueue};
use crate::session::SessionHandler;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Smallest step of the tokio timer. An entry only expires once it has
/// waited strictly longer than the timeout, so the dispatcher wakes one step
/// past each deadline.
const TIMER_RESOLUTION: Duration = Duration::from_millis(1);

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Running on a pool slot.
    Admitted,
    /// Waiting for a slot; the dispatcher decides later.
    Queued,
    /// Closed without being served.
    Evicted,
}

/// Point-in-time view of the controller's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    /// Admitted on arrival
    pub admitted: u64,
    /// Admitted after waiting in the queue
    pub admitted_from_queue: u64,
    /// Sent to the queue on arrival
    pub queued: u64,
    /// Closed without being served
    pub evicted: u64,
    /// Currently waiting
    pub waiting: usize,
    /// Currently occupied slots
    pub occupied: usize,
    /// Highest occupancy seen
    pub peak_occupied: usize,
}

#[derive(Default)]
struct Counters {
    admitted: AtomicU64,
    admitted_from_queue: AtomicU64,
    queued: AtomicU64,
    evicted: AtomicU64,
}

struct Shared<C, H> {
    config: AdmissionConfig,
    pool: WorkerPool,
    queue: Mutex<WaitingQueue<C>>,
    handler: Arc<H>,
    /// Signalled when a connection is queued
    enqueued: Notify,
    closed: AtomicBool,
    counters: Counters,
}

/// Admits connections onto a bounded [`WorkerPool`], queueing the overflow.
pub struct AdmissionController<C, H>
where
    C: ConnectionHandle,
    H: SessionHandler<C>,
{
    shared: Arc<Shared<C, H>>,
    dispatcher: JoinHandle<()>,
}

impl<C, H> AdmissionController<C, H>
where
    C: ConnectionHandle,
    H: SessionHandler<C>,
{
    /// Build the controller and start its dispatcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: AdmissionConfig, handler: H) -> Self {
        info!(
            max_clients = config.max_clients,
            wait_timeout_ms = config.wait_timeout.as_millis() as u64,
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            strict_fifo = config.strict_fifo,
            "Initializing admission controller"
        );

        let shared = Arc::new(Shared {
            config,
            pool: WorkerPool::new(config.max_clients),
            queue: Mutex::new(WaitingQueue::new()),
            handler: Arc::new(handler),
            enqueued: Notify::new(),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&shared)));

        Self {
            shared,
            dispatcher,
        }
    }

    #[cfg(test)]
    pub fn pool(&self) -> &WorkerPool {
        &self.shared.pool
    }

    /// Admit `conn` now if possible, otherwise queue it.
    ///
    /// With `strict_fifo`, a free slot is only taken directly when nobody is
    /// already waiting; otherwise the newcomer goes behind the waiters.
    pub fn admit(&self, conn: C) -> Admission {
        let shared = &self.shared;
        let peer = conn.peer();

        if shared.closed.load(Ordering::SeqCst) {
            debug!(peer = %peer, "Controller closed, dropping connection");
            shared.counters.evicted.fetch_add(1, Ordering::SeqCst);
            return Admission::Evicted;
        }

        let mut queue = shared.lock_queue();

        if !shared.config.strict_fifo || queue.is_empty() {
            if let Some(slot) = shared.pool.try_acquire() {
                drop(queue);
                shared.counters.admitted.fetch_add(1, Ordering::SeqCst);
                info!(peer = %peer, occupied = shared.pool.occupied(), "Connection admitted");
                shared.dispatch(slot, conn);
                return Admission::Admitted;
            }
        }

        if shared.config.wait_timeout.is_zero() {
            drop(queue);
            shared.counters.evicted.fetch_add(1, Ordering::SeqCst);
            info!(peer = %peer, "Connection limit reached and waiting disabled, dropping connection");
            return Admission::Evicted;
        }

        queue.enqueue(conn, Instant::now());
        let waiting = queue.len();
        drop(queue);

        shared.counters.queued.fetch_add(1, Ordering::SeqCst);
        info!(peer = %peer, waiting, "Connection limit reached, client entering waiting queue");
        shared.enqueued.notify_one();
        Admission::Queued
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> AdmissionStats {
        let shared = &self.shared;
        let counters = &shared.counters;
        AdmissionStats {
            admitted: counters.admitted.load(Ordering::SeqCst),
            admitted_from_queue: counters.admitted_from_queue.load(Ordering::SeqCst),
            queued: counters.queued.load(Ordering::SeqCst),
            evicted: counters.evicted.load(Ordering::SeqCst),
            waiting: shared.lock_queue().len(),
            occupied: shared.pool.occupied(),
            peak_occupied: shared.pool.peak_occupied(),
        }
    }

    /// Stop the dispatcher and evict everything still waiting.
    ///
    /// Sessions already running are left to finish. Later arrivals are
    /// evicted immediately. Returns the number of waiters evicted.
    pub fn shutdown(&self) -> usize {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        self.dispatcher.abort();

        let now = Instant::now();
        let drained = shared.lock_queue().drain();
        let count = drained.len();
        for entry in drained {
            shared.evict(entry, now, "shutdown");
        }
        info!(evicted = count, "Admission controller shut down");
        count
    }
}

impl<C, H> Drop for AdmissionController<C, H>
where
    C: ConnectionHandle,
    H: SessionHandler<C>,
{
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

impl<C, H> Shared<C, H>
where
    C: ConnectionHandle,
    H: SessionHandler<C>,
{
    fn lock_queue(&self) -> MutexGuard<'_, WaitingQueue<C>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, slot: Slot, conn: C) {
        let handler = Arc::clone(&self.handler);
        self.pool.run(slot, async move {
            handler.serve(conn).await;
        });
    }

    /// Close a waiting connection without serving it.
    fn evict(&self, entry: Waiting<C>, now: Instant, reason: &'static str) {
        self.counters.evicted.fetch_add(1, Ordering::SeqCst);
        info!(
            peer = %entry.conn.peer(),
            waited_ms = entry.waited(now).as_millis() as u64,
            reason,
            "Discarding client connection"
        );
    }

    /// One capacity pass followed by one expiry pass.
    ///
    /// Returns the earliest remaining deadline, if anyone is still waiting.
    fn dispatch_once(&self, now: Instant) -> Option<Instant> {
        let timeout = self.config.wait_timeout;

        let (admitted, expired, next_deadline) = {
            let mut queue = self.lock_queue();
            let mut admitted = Vec::new();
            while let Some(ready) = queue.try_dequeue_if_capacity(&self.pool, now, timeout) {
                admitted.push(ready);
            }
            let expired = queue.expire(now, timeout);
            (admitted, expired, queue.next_deadline(timeout))
        };

        for (entry, slot) in admitted {
            self.counters
                .admitted_from_queue
                .fetch_add(1, Ordering::SeqCst);
            info!(
                peer = %entry.conn.peer(),
                waited_ms = entry.waited(now).as_millis() as u64,
                "Client from the waiting queue will be processed"
            );
            self.dispatch(slot, entry.conn);
        }

        for entry in expired {
            self.evict(entry, now, "wait timeout");
        }

        next_deadline
    }
}

/// Drives the waiting queue until the controller shuts down.
async fn dispatch_loop<C, H>(shared: Arc<Shared<C, H>>)
where
    C: ConnectionHandle,
    H: SessionHandler<C>,
{
    loop {
        let now = Instant::now();
        let next_deadline = shared.dispatch_once(now);

        match next_deadline {
            Some(deadline) => {
                let wake_at = (deadline + TIMER_RESOLUTION).min(now + shared.config.poll_interval);
                trace!("Waiting for an available processing slot");
                tokio::select! {
                    _ = shared.pool.released() => {}
                    _ = shared.enqueued.notified() => {}
                    _ = tokio::time::sleep_until(wake_at) => {}
                }
            }
            None => {
                tokio::select! {
                    _ = shared.pool.released() => {}
                    _ = shared.enqueued.notified() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::sync::Semaphore;

    type Log = Arc<Mutex<Vec<u16>>>;

    struct FakeConn {
        id: u16,
        closed: Log,
    }

    impl ConnectionHandle for FakeConn {
        fn peer(&self) -> SocketAddr {
            SocketAddr::from(([127, 0, 0, 1], self.id))
        }
    }

    impl Drop for FakeConn {
        fn drop(&mut self) {
            self.closed.lock().unwrap().push(self.id);
        }
    }

    /// Records each served connection, then holds its slot until the test
    /// adds a permit to `gate`.
    struct GatedHandler {
        started: Log,
        gate: Arc<Semaphore>,
    }

    impl SessionHandler<FakeConn> for GatedHandler {
        async fn serve(&self, conn: FakeConn) {
            self.started.lock().unwrap().push(conn.id);
            self.gate.acquire().await.unwrap().forget();
        }
    }

    struct Harness {
        controller: AdmissionController<FakeConn, GatedHandler>,
        started: Log,
        closed: Log,
        gate: Arc<Semaphore>,
    }

    impl Harness {
        fn new(config: AdmissionConfig) -> Self {
            let started = Log::default();
            let gate = Arc::new(Semaphore::new(0));
            let handler = GatedHandler {
                started: Arc::clone(&started),
                gate: Arc::clone(&gate),
            };
            Self {
                controller: AdmissionController::new(config, handler),
                started,
                closed: Log::default(),
                gate,
            }
        }

        fn arrive(&self, id: u16) -> Admission {
            self.controller.admit(FakeConn {
                id,
                closed: Arc::clone(&self.closed),
            })
        }

        fn finish(&self, sessions: usize) {
            self.gate.add_permits(sessions);
        }

        fn started(&self) -> Vec<u16> {
            self.started.lock().unwrap().clone()
        }

        fn closed(&self) -> Vec<u16> {
            self.closed.lock().unwrap().clone()
        }
    }

    fn config(max_clients: usize) -> AdmissionConfig {
        AdmissionConfig {
            max_clients,
            ..AdmissionConfig::default()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_client_admitted_when_slot_frees() {
        let h = Harness::new(config(2));

        assert_eq!(h.arrive(1), Admission::Admitted);
        assert_eq!(h.arrive(2), Admission::Admitted);
        assert_eq!(h.arrive(3), Admission::Queued);
        settle().await;
        assert_eq!(h.started(), vec![1, 2]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        h.finish(1);
        settle().await;

        assert_eq!(h.started(), vec![1, 2, 3]);
        let stats = h.controller.stats();
        assert_eq!(stats.admitted, 2);
        assert_eq!(stats.admitted_from_queue, 1);
        assert_eq!(stats.evicted, 0);
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.occupied, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_client_evicted_after_wait_timeout() {
        let h = Harness::new(config(2));

        h.arrive(1);
        h.arrive(2);
        assert_eq!(h.arrive(3), Admission::Queued);

        tokio::time::sleep(Duration::from_millis(5900)).await;
        assert!(h.closed().is_empty());
        assert_eq!(h.controller.stats().waiting, 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.closed(), vec![3]);
        assert_eq!(h.controller.stats().evicted, 1);

        // A slot freeing afterwards must not resurrect the evicted client
        h.finish(2);
        settle().await;
        assert_eq!(h.started(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_freeing_exactly_at_wait_timeout_admits_waiter() {
        let h = Harness::new(config(1));

        assert_eq!(h.arrive(1), Admission::Admitted);
        assert_eq!(h.arrive(2), Admission::Queued);

        // Waited exactly the allowance, not longer
        tokio::time::sleep(Duration::from_secs(6)).await;
        h.finish(1);
        settle().await;

        assert_eq!(h.started(), vec![1, 2]);
        assert_eq!(h.closed(), vec![1]);
        let stats = h.controller.stats();
        assert_eq!(stats.admitted_from_queue, 1);
        assert_eq!(stats.evicted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_in_arrival_order() {
        let h = Harness::new(config(1));

        assert_eq!(h.arrive(1), Admission::Admitted);
        for id in 2..=4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(h.arrive(id), Admission::Queued);
        }

        for _ in 0..3 {
            h.finish(1);
            settle().await;
        }

        assert_eq!(h.started(), vec![1, 2, 3, 4]);
        assert_eq!(h.controller.stats().peak_occupied, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_waiter_evicted_while_younger_waits() {
        let h = Harness::new(config(1));

        h.arrive(1);
        assert_eq!(h.arrive(2), Admission::Queued);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.arrive(3), Admission::Queued);

        // Client 2 reaches its deadline, client 3 still has 3s left
        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(h.closed(), vec![2]);
        assert_eq!(h.controller.stats().waiting, 1);

        h.finish(1);
        settle().await;
        assert_eq!(h.started(), vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_fifo_newcomer_queues_behind_waiter() {
        let h = Harness::new(config(1));

        let occupant = h.controller.pool().try_acquire().unwrap();
        assert_eq!(h.arrive(1), Admission::Queued);

        // Slot is free again, but client 1 is still waiting
        drop(occupant);
        assert_eq!(h.arrive(2), Admission::Queued);

        settle().await;
        assert_eq!(h.started(), vec![1]);

        h.finish(1);
        settle().await;
        assert_eq!(h.started(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relaxed_fifo_lets_newcomer_take_free_slot() {
        let h = Harness::new(AdmissionConfig {
            strict_fifo: false,
            ..config(1)
        });

        let occupant = h.controller.pool().try_acquire().unwrap();
        assert_eq!(h.arrive(1), Admission::Queued);

        drop(occupant);
        assert_eq!(h.arrive(2), Admission::Admitted);

        settle().await;
        assert_eq!(h.started(), vec![2]);

        h.finish(1);
        settle().await;
        assert_eq!(h.started(), vec![2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_wait_timeout_evicts_immediately() {
        let h = Harness::new(AdmissionConfig {
            wait_timeout: Duration::ZERO,
            ..config(1)
        });

        assert_eq!(h.arrive(1), Admission::Admitted);
        assert_eq!(h.arrive(2), Admission::Evicted);
        assert_eq!(h.closed(), vec![2]);
        assert_eq!(h.controller.stats().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_evicts_waiters() {
        let h = Harness::new(config(1));

        h.arrive(1);
        h.arrive(2);
        h.arrive(3);
        settle().await;

        assert_eq!(h.controller.shutdown(), 2);
        assert_eq!(h.closed(), vec![2, 3]);
        assert_eq!(h.arrive(4), Admission::Evicted);
        assert_eq!(h.controller.shutdown(), 0);

        h.finish(1);
        settle().await;
        assert_eq!(h.started(), vec![1]);
        assert_eq!(h.controller.stats().evicted, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_arrival_has_exactly_one_outcome() {
        let h = Harness::new(AdmissionConfig {
            wait_timeout: Duration::from_millis(500),
            ..config(2)
        });

        for id in 1..=20u16 {
            h.arrive(id);
            tokio::time::sleep(Duration::from_millis(40)).await;
            if id % 3 == 0 {
                h.finish(1);
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.finish(20);
        settle().await;

        let started = h.started();
        let closed = h.closed();
        let stats = h.controller.stats();

        // Evicted connections were closed without ever starting
        let evicted: Vec<_> = closed.iter().filter(|id| !started.contains(id)).collect();
        assert_eq!(evicted.len() as u64, stats.evicted);
        assert_eq!(started.len() + evicted.len(), 20);
        assert_eq!(
            stats.admitted + stats.admitted_from_queue + stats.evicted,
            20
        );
        assert!(stats.peak_occupied <= 2);
        assert_eq!(stats.waiting, 0);
    }
}
