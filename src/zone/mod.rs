// SPDX-License-Identifier: MPL-2.0

//! Zones and work queues.
//!
//! Every mutable datum in the engine belongs to exactly one *zone*: a
//! cooperatively scheduled execution context serviced by a single worker
//! thread. Crossing a zone boundary is expressed by enqueueing a
//! continuation on the destination zone's work queue; the continuation
//! runs with exclusive `&mut` access to that zone's state.
//!
//! A worker thread may service one zone or several (the small-device
//! configuration runs every zone on one thread); a zone is never serviced
//! by more than one thread.

use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;

use crate::{
    os::{spawn, Arc, Box, Condvar, JoinHandle, Mutex, String, ToString, Vec},
    prelude::*,
};

/// The priority of a work item. Within one priority, order is FIFO.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    /// Journal commits and other latency-critical metadata work.
    High,
    /// The data path.
    Normal,
    /// Background work such as scrubbing.
    Low,
}

const PRIORITY_LEVELS: usize = 3;

/// A continuation to run on a zone's thread with its state.
pub type Work<S> = Box<dyn FnOnce(&mut S) + Send>;

/// The wakeup latch shared by all queues serviced by one worker thread.
pub struct WorkerWakeup {
    pending: Mutex<bool>,
    cvar: Condvar,
    stopping: AtomicBool,
}

impl WorkerWakeup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(false),
            cvar: Condvar::new(),
            stopping: AtomicBool::new(false),
        })
    }

    fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cvar.notify_one();
    }
}

/// A single-consumer work queue owned by one zone.
pub struct WorkQueue<S> {
    name: String,
    inner: Mutex<[VecDeque<Work<S>>; PRIORITY_LEVELS]>,
    wakeup: Arc<WorkerWakeup>,
}

impl<S> WorkQueue<S> {
    /// Creates a queue that wakes the given worker when work arrives.
    pub fn new(name: &str, wakeup: Arc<WorkerWakeup>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            inner: Mutex::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
            wakeup,
        })
    }

    /// Returns the queue's name, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues a continuation at the given priority.
    pub fn enqueue(&self, priority: Priority, work: Work<S>) {
        self.inner.lock()[priority as usize].push_back(work);
        self.wakeup.notify();
    }

    /// Enqueues a closure at the given priority.
    pub fn send(&self, priority: Priority, work: impl FnOnce(&mut S) + Send + 'static) {
        self.enqueue(priority, Box::new(work));
    }

    /// Returns the number of queued work items across all priorities.
    pub fn len(&self) -> usize {
        self.inner.lock().iter().map(VecDeque::len).sum()
    }

    /// Returns whether no work is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop(&self) -> Option<Work<S>> {
        let mut levels = self.inner.lock();
        levels.iter_mut().find_map(VecDeque::pop_front)
    }
}

/// A handle used to post work onto a zone from any thread.
pub type ZoneHandle<S> = Arc<WorkQueue<S>>;

/// A queue paired with the zone state it feeds.
///
/// Only the owning worker thread ever touches `state`; the pairing is what
/// enforces the "one zone, one mutator" rule.
pub struct ZoneCell<S> {
    queue: ZoneHandle<S>,
    state: S,
}

impl<S> ZoneCell<S> {
    pub fn new(queue: ZoneHandle<S>, state: S) -> Self {
        Self { queue, state }
    }
}

/// Anything a worker thread can service. Erases the zone state type so one
/// worker can interleave heterogeneous zones.
pub trait Serviceable: Send {
    /// Runs queued work to exhaustion. Returns how many items ran.
    fn service(&mut self) -> usize;
}

impl<S: Send> Serviceable for ZoneCell<S> {
    fn service(&mut self) -> usize {
        let mut count = 0;
        while let Some(work) = self.queue.pop() {
            work(&mut self.state);
            count += 1;
        }
        count
    }
}

/// A worker thread driving one or more zones.
pub struct Worker {
    wakeup: Arc<WorkerWakeup>,
    handle: Option<JoinHandle>,
}

impl Worker {
    /// Spawns a worker servicing the given zones until stopped.
    pub fn spawn(name: &str, wakeup: Arc<WorkerWakeup>, zones: Vec<Box<dyn Serviceable>>) -> Self {
        let thread_wakeup = wakeup.clone();
        let handle = spawn(name.to_string(), move || {
            Self::run(thread_wakeup, zones);
        });
        Self {
            wakeup,
            handle: Some(handle),
        }
    }

    fn run(wakeup: Arc<WorkerWakeup>, mut zones: Vec<Box<dyn Serviceable>>) {
        loop {
            let mut serviced = 0;
            for zone in zones.iter_mut() {
                serviced += zone.service();
            }
            if serviced > 0 {
                continue;
            }

            let mut pending = wakeup.pending.lock();
            if *pending {
                *pending = false;
                continue;
            }
            if wakeup.stopping.load(Ordering::Acquire) {
                return;
            }
            let _unused = wakeup.cvar.wait(pending);
        }
    }

    /// Asks the worker to exit once its queues are empty and joins it.
    pub fn stop_and_join(mut self) {
        self.wakeup.stopping.store(true, Ordering::Release);
        self.wakeup.notify();
        if let Some(handle) = self.handle.take() {
            handle.join();
        }
    }
}
