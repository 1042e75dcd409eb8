// SPDX-License-Identifier: MPL-2.0

use std::collections::VecDeque;

use bitflags::bitflags;

use crate::{
    layers::{
        bio::{Buf, Lbn, Pbn},
        dedupe::{ChunkName, DedupeAdvice, IndexStats},
        journal::{BlockMapEntry, JournalPoint},
    },
    os::{Box, Mutex, Vec},
    prelude::*,
};

bitflags! {
    /// Flags modifying an I/O descriptor.
    pub struct IoFlags: u32 {
        /// Force the covering journal block to stable storage before
        /// acknowledging.
        const FUA = 0b01;
        /// The descriptor is a flush barrier as well as (optionally) a
        /// write.
        const FLUSH = 0b10;
    }
}

/// The operation a host I/O requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VioOp {
    Read,
    Write,
    Discard,
    Flush,
}

/// The completion callback handed in with each descriptor. Reads receive
/// their data; other operations receive `None`.
pub type IoCompletion = Box<dyn FnOnce(Result<Option<Buf>>) + Send>;

/// One host block operation, as submitted.
pub struct IoDescriptor {
    pub op: VioOp,
    pub lbn: Lbn,
    pub data: Option<Buf>,
    pub flags: IoFlags,
    pub completion: IoCompletion,
}

/// The in-memory state of one host I/O in flight through the pipeline.
pub struct DataVio {
    pub op: VioOp,
    pub lbn: Lbn,
    pub data: Option<Buf>,
    pub flags: IoFlags,
    pub completion: Option<IoCompletion>,
    /// The fingerprint of the data, once hashed.
    pub chunk_name: Option<ChunkName>,
    /// The mapping found in the block map at the start of the operation.
    pub old_mapping: BlockMapEntry,
    /// The mapping this operation will install.
    pub new_mapping: BlockMapEntry,
    /// A freshly allocated block (provisionally referenced, write lock
    /// held) if the write path allocated one.
    pub allocated_pbn: Option<Pbn>,
    /// PBN locks held, as (physical zone, pbn) pairs.
    pub held_locks: Vec<(u32, Pbn)>,
    /// The block-map slot covering `lbn`, once the tree path exists.
    pub slot: Option<(Pbn, u16)>,
    /// Advice returned by the dedupe index, if any arrived in time.
    pub advice: Option<DedupeAdvice>,
    /// Set when the index missed the advice timeout and the write went on
    /// without it.
    pub advice_timed_out: bool,
    /// Set when the advice was verified byte-for-byte.
    pub is_duplicate: bool,
    /// Set when an advised candidate failed verification.
    pub verify_failed: bool,
    /// Copied from the logical zone's compression toggle at submission.
    pub try_compress: bool,
    /// The deflated payload, when the compression path accepted it.
    pub compressed: Option<Vec<u8>>,
    /// Physical zones already asked (and unable) to allocate.
    pub alloc_attempts: u32,
    /// The journal points assigned to this vio's entries (increment
    /// first).
    pub journal_points: Vec<JournalPoint>,
    /// The journal-zone token pinning the journal head for this vio.
    pub journal_token: u64,
}

impl DataVio {
    /// Builds the vio for a submitted descriptor.
    pub fn new(descriptor: IoDescriptor) -> Self {
        Self {
            op: descriptor.op,
            lbn: descriptor.lbn,
            data: descriptor.data,
            flags: descriptor.flags,
            completion: Some(descriptor.completion),
            chunk_name: None,
            old_mapping: BlockMapEntry::UNMAPPED,
            new_mapping: BlockMapEntry::UNMAPPED,
            allocated_pbn: None,
            held_locks: Vec::new(),
            slot: None,
            advice: None,
            advice_timed_out: false,
            is_duplicate: false,
            verify_failed: false,
            try_compress: false,
            compressed: None,
            alloc_attempts: 0,
            journal_points: Vec::new(),
            journal_token: 0,
        }
    }

    /// Takes the completion; it can only fire once.
    pub fn take_completion(&mut self) -> IoCompletion {
        self.completion
            .take()
            .expect("a data-vio completes exactly once")
    }
}

struct PoolInner {
    available: usize,
    queued: VecDeque<IoDescriptor>,
    in_flight: usize,
    drain_waiters: Vec<Box<dyn FnOnce() + Send>>,
}

/// The fixed-capacity admission pool for data-vios.
///
/// Submissions beyond the limit wait in FIFO order; a completed vio's
/// permit goes to the oldest queued descriptor. The pool is the only
/// boundary object the host thread touches directly.
pub struct DataVioPool {
    inner: Mutex<PoolInner>,
}

impl DataVioPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                available: capacity,
                queued: VecDeque::new(),
                in_flight: 0,
                drain_waiters: Vec::new(),
            }),
        }
    }

    /// Admits a descriptor: returns it back when a permit was granted
    /// (the caller dispatches it), or queues it.
    pub fn admit(&self, descriptor: IoDescriptor) -> Option<IoDescriptor> {
        let mut inner = self.inner.lock();
        if inner.available > 0 {
            inner.available -= 1;
            inner.in_flight += 1;
            Some(descriptor)
        } else {
            inner.queued.push_back(descriptor);
            None
        }
    }

    /// Releases a permit; returns the next queued descriptor to dispatch
    /// (its permit transfers) and any drain waiters that became ready.
    pub fn release(&self) -> (Option<IoDescriptor>, Vec<Box<dyn FnOnce() + Send>>) {
        let mut inner = self.inner.lock();
        if let Some(next) = inner.queued.pop_front() {
            return (Some(next), Vec::new());
        }
        inner.available += 1;
        inner.in_flight -= 1;
        let waiters = if inner.in_flight == 0 {
            core::mem::take(&mut inner.drain_waiters)
        } else {
            Vec::new()
        };
        (None, waiters)
    }

    /// The number of vios currently holding permits.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Runs `waiter` once no vio is in flight (immediately if idle).
    pub fn notify_when_drained(&self, waiter: Box<dyn FnOnce() + Send>) {
        let run_now = {
            let mut inner = self.inner.lock();
            if inner.in_flight == 0 {
                true
            } else {
                inner.drain_waiters.push(waiter);
                return;
            }
        };
        if run_now {
            waiter();
        }
    }
}

/// A point-in-time statistics snapshot, aggregated across zones.
#[derive(Clone, Debug, Default)]
pub struct DeviceStats {
    pub reads: u64,
    pub writes: u64,
    pub discards: u64,
    pub flushes: u64,
    pub zero_block_writes: u64,
    pub dedupe_hits: u64,
    pub dedupe_verify_failures: u64,
    pub dedupe_timeouts: u64,
    pub compressed_fragments_written: u64,
    pub journal_entries_committed: u64,
    pub journal_blocks_written: u64,
    pub logical_blocks_used: u64,
    pub free_physical_blocks: u64,
    pub allocations: u64,
    pub slabs_scrubbed: u64,
    pub block_map_cache_loads: u64,
    pub block_map_cache_writebacks: u64,
    pub index: IndexStats,
    pub read_only: bool,
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::{DataVioPool, IoDescriptor, IoFlags, VioOp};

    fn descriptor(lbn: u64) -> IoDescriptor {
        IoDescriptor {
            op: VioOp::Read,
            lbn,
            data: None,
            flags: IoFlags::empty(),
            completion: Box::new(|_result| ()),
        }
    }

    #[test]
    fn admission_and_queueing() {
        let pool = DataVioPool::new(2);
        assert!(pool.admit(descriptor(0)).is_some());
        assert!(pool.admit(descriptor(1)).is_some());
        assert_eq!(pool.in_flight(), 2);

        // The third waits its turn.
        assert!(pool.admit(descriptor(2)).is_none());

        // Releasing hands the permit to the queued descriptor.
        let (next, waiters) = pool.release();
        assert_eq!(next.map(|descriptor| descriptor.lbn), Some(2));
        assert!(waiters.is_empty());
        assert_eq!(pool.in_flight(), 2);
    }

    #[test]
    fn drain_waiter_fires_at_idle() {
        let pool = DataVioPool::new(1);
        let fired = Arc::new(AtomicUsize::new(0));

        // Idle pool: fires immediately.
        let fired_clone = fired.clone();
        pool.notify_when_drained(Box::new(move || {
            fired_clone.fetch_add(1, Ordering::Relaxed);
        }));
        assert_eq!(fired.load(Ordering::Relaxed), 1);

        let _ = pool.admit(descriptor(0)).unwrap();
        let fired_clone = fired.clone();
        pool.notify_when_drained(Box::new(move || {
            fired_clone.fetch_add(1, Ordering::Relaxed);
        }));
        assert_eq!(fired.load(Ordering::Relaxed), 1);

        let (next, waiters) = pool.release();
        assert!(next.is_none());
        assert_eq!(waiters.len(), 1);
        for waiter in waiters {
            waiter();
        }
        assert_eq!(fired.load(Ordering::Relaxed), 2);
    }
}
