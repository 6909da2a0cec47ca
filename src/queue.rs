//! Waiting queue for connections that found no free slot.
//!
//! Entries keep arrival order. The queue never blocks and never rejects;
//! bounding the wait is done by expiry, not by capacity.

use crate::pool::{Slot, WorkerPool};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// A queued connection and the instant it entered the queue.
#[derive(Debug)]
pub struct Waiting<C> {
    pub conn: C,
    pub enqueued_at: Instant,
}

impl<C> Waiting<C> {
    /// Instant at which this entry stops being eligible for admission.
    pub fn deadline(&self, wait_timeout: Duration) -> Instant {
        self.enqueued_at + wait_timeout
    }

    /// True once the entry has waited longer than its allowance.
    pub fn is_expired(&self, now: Instant, wait_timeout: Duration) -> bool {
        now > self.deadline(wait_timeout)
    }

    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }
}

/// Unbounded FIFO of waiting connections.
#[derive(Debug)]
pub struct WaitingQueue<C> {
    entries: VecDeque<Waiting<C>>,
}

impl<C> Default for WaitingQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> WaitingQueue<C> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append `conn` at the tail, stamped with `now`.
    pub fn enqueue(&mut self, conn: C, now: Instant) {
        self.entries.push_back(Waiting {
            conn,
            enqueued_at: now,
        });
    }

    /// Take the oldest still-eligible entry, together with a pool slot.
    ///
    /// Returns `None` when the pool is full or no entry is eligible. Entries
    /// that are already past their deadline are skipped and left for
    /// [`WaitingQueue::expire`].
    pub fn try_dequeue_if_capacity(
        &mut self,
        pool: &WorkerPool,
        now: Instant,
        wait_timeout: Duration,
    ) -> Option<(Waiting<C>, Slot)> {
        if pool.available() == 0 {
            return None;
        }
        let pos = self
            .entries
            .iter()
            .position(|entry| !entry.is_expired(now, wait_timeout))?;
        let slot = pool.try_acquire()?;
        let entry = self.entries.remove(pos)?;
        Some((entry, slot))
    }

    /// Remove every entry that has waited longer than `wait_timeout`.
    pub fn expire(&mut self, now: Instant, wait_timeout: Duration) -> Vec<Waiting<C>> {
        if !self
            .entries
            .iter()
            .any(|entry| entry.is_expired(now, wait_timeout))
        {
            return Vec::new();
        }

        let (expired, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|entry| entry.is_expired(now, wait_timeout));
        self.entries = kept.into();
        expired
    }

    /// Earliest deadline among the waiting entries.
    pub fn next_deadline(&self, wait_timeout: Duration) -> Option<Instant> {
        self.entries
            .iter()
            .map(|entry| entry.deadline(wait_timeout))
            .min()
    }

    /// Remove everything, oldest first.
    pub fn drain(&mut self) -> Vec<Waiting<C>> {
        self.entries.drain(..).collect()
    }
}
