// SPDX-License-Identifier: MPL-2.0

use std::collections::VecDeque;

use crate::os::{Box, Vec};

/// A suspended operation, waiting to be resumed with access to the owning
/// zone's state (`Z`).
///
/// A waiter carries nothing but its continuation and an optional tag used
/// by [`WaitQueue::dequeue_matching`]. The continuation runs on the zone
/// thread that owns the queue, so it may freely mutate zone state.
pub struct Waiter<Z> {
    tag: u64,
    callback: Box<dyn FnOnce(&mut Z) + Send>,
}

impl<Z> Waiter<Z> {
    /// Creates a waiter resuming into `callback`.
    pub fn new(callback: impl FnOnce(&mut Z) + Send + 'static) -> Self {
        Self::with_tag(0, callback)
    }

    /// Creates a waiter with a tag that `dequeue_matching` can select on.
    pub fn with_tag(tag: u64, callback: impl FnOnce(&mut Z) + Send + 'static) -> Self {
        Self {
            tag,
            callback: Box::new(callback),
        }
    }

    /// Returns the waiter's tag.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Consumes the waiter, running its continuation.
    pub fn fire(self, zone: &mut Z) {
        (self.callback)(zone)
    }
}

/// A FIFO of suspended operations.
///
/// Each wait queue is owned by exactly one zone and is serviced only on
/// that zone's thread, so the queue itself needs no synchronization.
/// Enqueue and dequeue are constant time.
pub struct WaitQueue<Z> {
    waiters: VecDeque<Waiter<Z>>,
}

impl<Z> WaitQueue<Z> {
    /// Creates an empty wait queue.
    pub fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    /// Returns the number of waiters in the queue.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Returns whether the queue holds no waiters.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Appends a waiter at the tail.
    pub fn enqueue(&mut self, waiter: Waiter<Z>) {
        self.waiters.push_back(waiter);
    }

    /// Removes and returns the waiter at the head, if any.
    pub fn dequeue_next(&mut self) -> Option<Waiter<Z>> {
        self.waiters.pop_front()
    }

    /// Resumes the waiter at the head, if any. Returns whether one ran.
    pub fn notify_next(&mut self, zone: &mut Z) -> bool {
        match self.waiters.pop_front() {
            Some(waiter) => {
                waiter.fire(zone);
                true
            }
            None => false,
        }
    }

    /// Resumes every waiter in FIFO order. Returns how many ran.
    ///
    /// Waiters enqueued while the notification runs are not resumed by
    /// this call; they stay queued for the next notification.
    pub fn notify_all(&mut self, zone: &mut Z) -> usize {
        let batch: Vec<_> = self.waiters.drain(..).collect();
        let count = batch.len();
        for waiter in batch {
            waiter.fire(zone);
        }
        count
    }

    /// Moves every waiter from `self` onto the tail of `to`, preserving order.
    pub fn transfer_all(&mut self, to: &mut WaitQueue<Z>) {
        to.waiters.append(&mut self.waiters);
    }

    /// Removes all waiters whose tag satisfies `pred`, preserving the order
    /// of the remainder, and returns the removed waiters in FIFO order.
    pub fn dequeue_matching(&mut self, pred: impl Fn(u64) -> bool) -> Vec<Waiter<Z>> {
        let mut matched = Vec::new();
        let mut kept = VecDeque::with_capacity(self.waiters.len());
        for waiter in self.waiters.drain(..) {
            if pred(waiter.tag()) {
                matched.push(waiter);
            } else {
                kept.push_back(waiter);
            }
        }
        self.waiters = kept;
        matched
    }
}

impl<Z> Default for WaitQueue<Z> {
    fn default() -> Self {
        Self::new()
    }
}
