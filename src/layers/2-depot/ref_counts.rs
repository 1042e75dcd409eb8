// SPDX-License-Identifier: MPL-2.0

use crate::{
    layers::{
        bio::{BlockSet, Buf, BLOCK_SIZE},
        journal::{JournalOperation, JournalPoint},
    },
    prelude::*,
    util::BitMap,
};

/// The four classes of value an 8-bit reference counter can hold.
///
/// The encoding is: `0` free, `1..=253` a counted number of references,
/// `254` a provisional reference, `255` shared ("too many to count";
/// saturating and non-decreasing once reached).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceCount {
    /// The block is unreferenced and may be allocated.
    Free,
    /// The block is reserved by an in-flight allocation.
    Provisional,
    /// The block has this many references.
    Count(u8),
    /// The block has too many references to count.
    Shared,
}

const PROVISIONAL_ENCODING: u8 = 254;
const SHARED_ENCODING: u8 = 255;
const MAX_COUNTED: u8 = 253;

impl ReferenceCount {
    /// Encodes the value class to its 8-bit on-disk form.
    pub fn encode(self) -> u8 {
        match self {
            ReferenceCount::Free => 0,
            ReferenceCount::Count(n) => {
                debug_assert!((1..=MAX_COUNTED).contains(&n));
                n
            }
            ReferenceCount::Provisional => PROVISIONAL_ENCODING,
            ReferenceCount::Shared => SHARED_ENCODING,
        }
    }

    /// Decodes an 8-bit counter. Total: every byte decodes to a class.
    pub fn decode(byte: u8) -> Self {
        match byte {
            0 => ReferenceCount::Free,
            PROVISIONAL_ENCODING => ReferenceCount::Provisional,
            SHARED_ENCODING => ReferenceCount::Shared,
            n => ReferenceCount::Count(n),
        }
    }

    /// Returns whether the block holds any reference (including a
    /// provisional one).
    pub fn is_referenced(self) -> bool {
        self != ReferenceCount::Free
    }
}

/// The reference counters for every data block of one slab.
///
/// Owned by the slab's physical zone. Replay is idempotent with respect to
/// `slab_journal_point`: an entry at or before the watermark has already
/// been applied and is skipped.
pub struct RefCounts {
    counts: Vec<u8>,
    /// One bit per data block; set while the block is free. Keeps
    /// free-block searches from scanning the counter bytes.
    free_map: BitMap,
    free_count: u64,
    /// The journal point of the last slab-journal entry applied.
    slab_journal_point: JournalPoint,
    /// Rotating start position for free-block searches.
    search_cursor: usize,
}

impl RefCounts {
    /// Creates counters for `block_count` data blocks, all free.
    pub fn new(block_count: u64) -> Self {
        Self {
            counts: vec![0; block_count as usize],
            free_map: BitMap::repeat(true, block_count as usize),
            free_count: block_count,
            slab_journal_point: JournalPoint::default(),
            search_cursor: 0,
        }
    }

    /// Returns the number of data blocks covered.
    pub fn block_count(&self) -> u64 {
        self.counts.len() as u64
    }

    /// Returns the number of free data blocks.
    pub fn free_block_count(&self) -> u64 {
        self.free_count
    }

    /// Returns the watermark of applied slab-journal entries.
    pub fn slab_journal_point(&self) -> JournalPoint {
        self.slab_journal_point
    }

    /// Returns the value class of the counter for slab block `sbn`.
    pub fn get(&self, sbn: u64) -> ReferenceCount {
        ReferenceCount::decode(self.counts[sbn as usize])
    }

    fn set(&mut self, sbn: u64, value: ReferenceCount) {
        let old = ReferenceCount::decode(self.counts[sbn as usize]);
        if old == ReferenceCount::Free && value != ReferenceCount::Free {
            self.free_count -= 1;
            self.free_map.set(sbn as usize, false);
        } else if old != ReferenceCount::Free && value == ReferenceCount::Free {
            self.free_count += 1;
            self.free_map.set(sbn as usize, true);
        }
        self.counts[sbn as usize] = value.encode();
    }

    /// Reserves a free block for an in-flight allocation.
    pub fn provisionally_reference(&mut self, sbn: u64) -> Result<()> {
        match self.get(sbn) {
            ReferenceCount::Free => {
                self.set(sbn, ReferenceCount::Provisional);
                Ok(())
            }
            _ => Err(Error::with_msg(
                BadState,
                "provisional reference on a referenced block",
            )),
        }
    }

    /// Releases a provisional reference that will not be committed.
    pub fn release_provisional(&mut self, sbn: u64) {
        if self.get(sbn) == ReferenceCount::Provisional {
            self.set(sbn, ReferenceCount::Free);
        }
    }

    /// Applies one reference-count change, returning the new value class.
    pub fn adjust(&mut self, sbn: u64, operation: JournalOperation) -> Result<ReferenceCount> {
        let old = self.get(sbn);
        let new = match operation {
            JournalOperation::DataIncrement | JournalOperation::BlockMapIncrement => match old {
                ReferenceCount::Free | ReferenceCount::Provisional => ReferenceCount::Count(1),
                ReferenceCount::Count(MAX_COUNTED) => ReferenceCount::Shared,
                ReferenceCount::Count(n) => ReferenceCount::Count(n + 1),
                ReferenceCount::Shared => ReferenceCount::Shared,
            },
            JournalOperation::DataDecrement => match old {
                ReferenceCount::Free => {
                    return_errno_with_msg!(BadState, "decrement of an unreferenced block")
                }
                ReferenceCount::Provisional | ReferenceCount::Count(1) => ReferenceCount::Free,
                ReferenceCount::Count(n) => ReferenceCount::Count(n - 1),
                // Once shared, a counter no longer tracks decrements.
                ReferenceCount::Shared => ReferenceCount::Shared,
            },
        };
        self.set(sbn, new);
        Ok(new)
    }

    /// Applies a slab-journal entry during replay, skipping entries the
    /// saved counters already reflect.
    pub fn replay_reference_count_change(
        &mut self,
        entry_point: JournalPoint,
        sbn: u64,
        operation: JournalOperation,
    ) -> Result<()> {
        if entry_point <= self.slab_journal_point {
            // Already applied before the counters were last saved.
            return Ok(());
        }
        self.adjust(sbn, operation)?;
        self.slab_journal_point = entry_point;
        Ok(())
    }

    /// Records that entries up to `point` are reflected in the counters.
    pub fn advance_slab_journal_point(&mut self, point: JournalPoint) {
        if self.slab_journal_point < point {
            self.slab_journal_point = point;
        }
    }

    /// Resets the watermark for a fresh slab-journal epoch (the journal
    /// region has been zeroed and sequence numbers restart at one).
    pub fn reset_slab_journal_point(&mut self) {
        self.slab_journal_point = JournalPoint::default();
    }

    /// Finds a free block, searching from the rotating cursor.
    pub fn find_free_block(&mut self) -> Option<u64> {
        if self.free_count == 0 {
            return None;
        }
        let index = self
            .free_map
            .first_one(self.search_cursor)
            .or_else(|| self.free_map.first_one(0))?;
        self.search_cursor = (index + 1) % self.counts.len();
        Some(index as u64)
    }

    /// The number of blocks needed to persist counters for `block_count`
    /// data blocks.
    pub fn saved_blocks(block_count: u64) -> u64 {
        block_count.div_ceil(BLOCK_SIZE as u64).max(1)
    }

    /// Persists the counters and the journal watermark to `storage`.
    ///
    /// Block 0 of the region holds the packed watermark; counter bytes
    /// follow from block 1.
    pub fn save<D: BlockSet>(&self, storage: &D) -> Result<()> {
        let mut header = Buf::alloc(1)?;
        header.as_mut_slice()[0..8].copy_from_slice(&self.slab_journal_point.to_le_bytes());
        header.as_mut_slice()[8..16].copy_from_slice(&(self.counts.len() as u64).to_le_bytes());
        storage.write(0, header.as_ref())?;

        for (index, chunk) in self.counts.chunks(BLOCK_SIZE).enumerate() {
            let mut block = Buf::alloc(1)?;
            block.as_mut_slice()[..chunk.len()].copy_from_slice(chunk);
            storage.write(1 + index as u64, block.as_ref())?;
        }
        storage.flush()
    }

    /// Loads counters previously written by [`RefCounts::save`].
    pub fn load<D: BlockSet>(storage: &D, block_count: u64) -> Result<Self> {
        let mut header = Buf::alloc(1)?;
        storage.read(0, header.as_mut())?;
        let point =
            JournalPoint::from_le_bytes(header.as_slice()[0..8].try_into().unwrap());
        let saved_len = u64::from_le_bytes(header.as_slice()[8..16].try_into().unwrap());
        if saved_len != block_count {
            return_errno_with_msg!(BadState, "saved ref count length mismatch");
        }

        let mut counts = vec![0u8; block_count as usize];
        let mut block = Buf::alloc(1)?;
        for (index, chunk) in counts.chunks_mut(BLOCK_SIZE).enumerate() {
            storage.read(1 + index as u64, block.as_mut())?;
            chunk.copy_from_slice(&block.as_slice()[..chunk.len()]);
        }

        let mut free_map = BitMap::repeat(false, block_count as usize);
        for (index, &byte) in counts.iter().enumerate() {
            if byte == 0 {
                free_map.set(index, true);
            }
        }
        let free_count = free_map.count_ones() as u64;
        Ok(Self {
            counts,
            free_map,
            free_count,
            slab_journal_point: point,
            search_cursor: 0,
        })
    }
}
