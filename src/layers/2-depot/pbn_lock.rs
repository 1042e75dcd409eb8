// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicU32, Ordering};

use crate::prelude::*;

/// The kinds of lock a data-vio may hold on a physical block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PbnLockType {
    /// Shared by readers and dedupe-verify candidates.
    Read,
    /// Exclusive, held while writing new data to the block.
    Write,
    /// Exclusive, held by the packer for a block of compressed fragments.
    CompressedWrite,
    /// Exclusive, held while writing a block-map tree page.
    BlockMapWrite,
}

impl PbnLockType {
    /// Returns whether two locks of these types may coexist on one block.
    pub fn is_compatible_with(self, other: PbnLockType) -> bool {
        // Read locks share with each other; every other combination
        // (read/write, write/write) conflicts.
        self == PbnLockType::Read && other == PbnLockType::Read
    }
}

/// A lock on a physical block number.
///
/// The lock is owned for the lifetime of a data-vio's interest in the
/// block. A read lock taken for deduplication records how many reference
/// increments were known to be available when it was acquired; sharers
/// claim increments one at a time and stop deduplicating against the
/// block once the limit is exhausted.
#[derive(Debug)]
pub struct PbnLock {
    type_: PbnLockType,
    holder_count: u32,
    has_provisional_reference: bool,
    increment_limit: u32,
    increments_claimed: AtomicU32,
}

impl PbnLock {
    fn new(type_: PbnLockType) -> Self {
        Self {
            type_,
            holder_count: 1,
            has_provisional_reference: false,
            increment_limit: 0,
            increments_claimed: AtomicU32::new(0),
        }
    }

    /// Returns the lock's current type.
    pub fn lock_type(&self) -> PbnLockType {
        self.type_
    }

    /// Returns whether this is a read lock.
    pub fn is_read_lock(&self) -> bool {
        self.type_ == PbnLockType::Read
    }

    /// Returns the number of data-vios holding the lock.
    pub fn holder_count(&self) -> u32 {
        self.holder_count
    }

    /// Adds a sharer. Only legal for the shared lock types: read locks
    /// and compressed-write locks (one holder per packed fragment).
    pub fn add_holder(&mut self) {
        debug_assert!(self.is_read_lock() || self.type_ == PbnLockType::CompressedWrite);
        self.holder_count += 1;
    }

    /// Drops one holder; returns whether the lock is now unheld.
    pub fn remove_holder(&mut self) -> bool {
        debug_assert!(self.holder_count > 0);
        self.holder_count -= 1;
        self.holder_count == 0
    }

    /// Converts an exclusive write-type lock into a read lock, making the
    /// block eligible as a dedupe target. `increment_limit` is the number
    /// of reference increments known available at this moment.
    pub fn downgrade_to_read(&mut self, increment_limit: u32) {
        debug_assert!(!self.is_read_lock());
        debug_assert_eq!(self.holder_count, 1);
        self.type_ = PbnLockType::Read;
        self.increment_limit = increment_limit;
        self.increments_claimed.store(0, Ordering::Relaxed);
    }

    /// Records how many reference increments are available under a lock
    /// whose sharers will claim them one at a time (fresh read locks and
    /// compressed-write locks counting their fragments).
    pub fn set_increment_limit(&mut self, increment_limit: u32) {
        self.increment_limit = increment_limit;
        self.increments_claimed.store(0, Ordering::Relaxed);
    }

    /// Claims one of the reference increments available under a read lock.
    /// Returns whether the claim succeeded.
    pub fn claim_increment(&self) -> bool {
        let claim = self.increments_claimed.fetch_add(1, Ordering::Relaxed);
        if claim < self.increment_limit {
            true
        } else {
            self.increments_claimed.fetch_sub(1, Ordering::Relaxed);
            false
        }
    }

    /// Marks the lock as carrying the provisional reference taken when the
    /// block was allocated.
    pub fn assign_provisional_reference(&mut self) {
        debug_assert!(!self.has_provisional_reference);
        self.has_provisional_reference = true;
    }

    /// Clears the provisional-reference mark, returning whether it was set.
    pub fn unassign_provisional_reference(&mut self) -> bool {
        let had = self.has_provisional_reference;
        self.has_provisional_reference = false;
        had
    }

    /// Returns whether the lock carries a provisional reference.
    pub fn has_provisional_reference(&self) -> bool {
        self.has_provisional_reference
    }
}

/// An index into a [`PbnLockPool`].
pub type PbnLockIndex = usize;

/// A fixed-capacity pool of PBN locks.
///
/// Sized at startup to the maximum number of concurrent data-vios plus
/// compressed-write slack; `borrow` fails rather than allocating.
pub struct PbnLockPool {
    slots: Vec<Option<PbnLock>>,
    free: Vec<PbnLockIndex>,
}

impl PbnLockPool {
    /// Creates a pool with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            free: (0..capacity).rev().collect(),
        }
    }

    /// Returns the number of locks available to borrow.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Returns the pool's total capacity.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Borrows a lock initialized to the given type.
    pub fn borrow(&mut self, type_: PbnLockType) -> Result<PbnLockIndex> {
        let Some(index) = self.free.pop() else {
            return_errno_with_msg!(LockFailed, "PBN lock pool is empty");
        };
        debug_assert!(self.slots[index].is_none());
        self.slots[index] = Some(PbnLock::new(type_));
        Ok(index)
    }

    /// Returns a borrowed lock to the pool, zeroing it.
    pub fn release(&mut self, index: PbnLockIndex) {
        debug_assert!(self.slots[index].is_some());
        self.slots[index] = None;
        self.free.push(index);
    }

    /// Accesses a borrowed lock.
    pub fn get(&self, index: PbnLockIndex) -> &PbnLock {
        self.slots[index].as_ref().expect("stale PBN lock index")
    }

    /// Mutably accesses a borrowed lock.
    pub fn get_mut(&mut self, index: PbnLockIndex) -> &mut PbnLock {
        self.slots[index].as_mut().expect("stale PBN lock index")
    }
}

#[cfg(test)]
mod tests {
    use super::{PbnLockPool, PbnLockType};

    #[test]
    fn borrow_and_release_restore_capacity() {
        let mut pool = PbnLockPool::new(2);
        assert_eq!(pool.available(), 2);

        let a = pool.borrow(PbnLockType::Write).unwrap();
        let b = pool.borrow(PbnLockType::Read).unwrap();
        assert_eq!(pool.available(), 0);
        assert!(pool.borrow(PbnLockType::Write).is_err());

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn type_compatibility() {
        assert!(PbnLockType::Read.is_compatible_with(PbnLockType::Read));
        assert!(!PbnLockType::Read.is_compatible_with(PbnLockType::Write));
        assert!(!PbnLockType::Write.is_compatible_with(PbnLockType::Write));
        assert!(!PbnLockType::CompressedWrite.is_compatible_with(PbnLockType::Read));
    }

    #[test]
    fn claim_increments_respect_limit() {
        let mut pool = PbnLockPool::new(1);
        let index = pool.borrow(PbnLockType::Write).unwrap();
        pool.get_mut(index).downgrade_to_read(2);

        let lock = pool.get(index);
        assert!(lock.claim_increment());
        assert!(lock.claim_increment());
        assert!(!lock.claim_increment());
    }

    #[test]
    fn provisional_reference_mark() {
        let mut pool = PbnLockPool::new(1);
        let index = pool.borrow(PbnLockType::Write).unwrap();
        pool.get_mut(index).assign_provisional_reference();
        assert!(pool.get(index).has_provisional_reference());
        assert!(pool.get_mut(index).unassign_provisional_reference());
        assert!(!pool.get_mut(index).unassign_provisional_reference());
    }
}
