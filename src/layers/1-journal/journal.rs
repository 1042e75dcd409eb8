// SPDX-License-Identifier: MPL-2.0

use core::mem;

use super::{
    block::{encode_journal_block, RecoveryBlockHeader, RECOVERY_JOURNAL_ENTRIES_PER_BLOCK},
    entry::{JournalOperation, RecoveryJournalEntry},
    point::JournalPoint,
    RECOVERY_METADATA_TYPE,
};
use crate::{
    layers::bio::{BlockSet, Buf},
    prelude::*,
    util::{WaitQueue, Waiter},
};

/// The persisted state of the recovery journal (component state 7.0 in the
/// super block), packed little-endian as
/// `[journal_start: u64][logical_blocks_used: u64][block_map_data_blocks: u64]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryJournalState {
    /// The sequence number at which the journal resumes appending.
    pub journal_start: u64,
    /// The number of logical blocks currently mapped.
    pub logical_blocks_used: u64,
    /// The number of physical blocks holding block-map tree pages.
    pub block_map_data_blocks: u64,
}

impl RecoveryJournalState {
    pub const ENCODED_SIZE: usize = 24;

    /// Encodes the state to its packed form.
    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut out = [0u8; Self::ENCODED_SIZE];
        out[0..8].copy_from_slice(&self.journal_start.to_le_bytes());
        out[8..16].copy_from_slice(&self.logical_blocks_used.to_le_bytes());
        out[16..24].copy_from_slice(&self.block_map_data_blocks.to_le_bytes());
        out
    }

    /// Decodes a state packed by [`RecoveryJournalState::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::ENCODED_SIZE {
            return_errno_with_msg!(InvalidArgs, "short recovery journal state");
        }
        Ok(Self {
            journal_start: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            logical_blocks_used: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            block_map_data_blocks: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
        })
    }
}

/// The continuation run when a batch of journal entries has become
/// durable (or has failed). Receives the points assigned to the batch,
/// in admission order. Runs on the journal zone; it is expected to hop
/// back to the zone that owns the next pipeline step.
pub type JournalEntryCompletion = Box<dyn FnOnce(Result<Vec<JournalPoint>>) + Send>;

/// A batch admitted to the journal but not yet covered by a block write.
struct PendingBatch {
    /// The newest point in the batch; the batch is durable once a commit
    /// covers it.
    last: JournalPoint,
    points: Vec<JournalPoint>,
    completion: JournalEntryCompletion,
}

/// The system-wide write-ahead journal of mapping changes.
///
/// Owned by the journal zone; all methods require `&mut self` and must
/// be called on that zone's thread. Entries are buffered into the open
/// block and a write is dispatched only when the block fills or a batch
/// arrives with the flush/FUA flag; callers amortize the remaining
/// partial-block commits through [`RecoveryJournal::commit_pending`].
/// Batch completions are deferred until the write covering their entries
/// completes, so a completion implies durability in strict sequence
/// order.
pub struct RecoveryJournal<D> {
    storage: D,
    size: u64,
    nonce: u64,
    recovery_count: u8,
    /// Sequence number of the open (appending) block.
    tail: u64,
    /// Entries admitted to the open block.
    entries: Vec<RecoveryJournalEntry>,
    /// Batches whose covering write has not happened yet.
    pending: Vec<PendingBatch>,
    /// The newest durable position: every point before it is on stable
    /// storage.
    durable: JournalPoint,
    /// Lowest sequence number the block map still requires.
    block_map_head: u64,
    /// Lowest sequence number the slab journals still require.
    slab_journal_head: u64,
    logical_blocks_used: u64,
    block_map_data_blocks: u64,
    /// Batch appends stalled on journal space.
    space_waiters: WaitQueue<Self>,
    /// Set once a journal write has failed; all further appends fail fast.
    write_error: Option<Error>,
    committed_entries: u64,
    block_writes: u64,
}

impl<D: BlockSet> RecoveryJournal<D> {
    /// Formats the journal region: every block is zeroed so that no stale
    /// header can pass validation against the device nonce.
    pub fn format(storage: &D) -> Result<()> {
        let zero = Buf::alloc(1)?;
        for pbn in 0..storage.nblocks() {
            storage.write(pbn, zero.as_ref())?;
        }
        storage.flush()
    }

    /// Opens the journal for appending.
    ///
    /// `state.journal_start` names the first sequence number that has never
    /// been committed; after recovery the caller passes one past the found
    /// tail and a bumped `recovery_count`.
    pub fn open(storage: D, nonce: u64, state: RecoveryJournalState, recovery_count: u8) -> Self {
        let size = storage.nblocks();
        debug_assert!(size.is_power_of_two());
        let start = state.journal_start.max(1);
        Self {
            storage,
            size,
            nonce,
            recovery_count,
            tail: start,
            entries: Vec::new(),
            pending: Vec::new(),
            durable: JournalPoint {
                sequence_number: start,
                entry_count: 0,
            },
            block_map_head: start,
            slab_journal_head: start,
            logical_blocks_used: state.logical_blocks_used,
            block_map_data_blocks: state.block_map_data_blocks,
            space_waiters: WaitQueue::new(),
            write_error: None,
            committed_entries: 0,
            block_writes: 0,
        }
    }

    /// Returns the persisted component state for a clean save.
    pub fn state(&self) -> RecoveryJournalState {
        RecoveryJournalState {
            journal_start: self.tail,
            logical_blocks_used: self.logical_blocks_used,
            block_map_data_blocks: self.block_map_data_blocks,
        }
    }

    /// Returns the sequence number of the open block.
    pub fn tail_sequence(&self) -> u64 {
        self.tail
    }

    /// Returns the number of logical blocks currently mapped.
    pub fn logical_blocks_used(&self) -> u64 {
        self.logical_blocks_used
    }

    /// Returns the number of durable entries, for statistics.
    pub fn committed_entries(&self) -> u64 {
        self.committed_entries
    }

    /// Returns the number of journal block writes, for statistics.
    pub fn block_writes(&self) -> u64 {
        self.block_writes
    }

    /// Returns whether admitted batches are awaiting a covering write.
    pub fn has_uncommitted(&self) -> bool {
        !self.pending.is_empty()
    }

    fn head(&self) -> u64 {
        self.block_map_head.min(self.slab_journal_head)
    }

    fn has_space_for(&self, new_entries: usize) -> bool {
        let total = self.entries.len() + new_entries;
        let blocks_needed = total.div_ceil(RECOVERY_JOURNAL_ENTRIES_PER_BLOCK as usize).max(1);
        self.tail - self.head() + blocks_needed as u64 <= self.size
    }

    /// Appends a batch of entries. The batch's points are assigned
    /// immediately, but `completion` runs only once the block(s) holding
    /// the batch are durable: right away when the batch fills a block or
    /// carries the flush/FUA flag, otherwise at the next
    /// [`RecoveryJournal::commit_pending`].
    ///
    /// When the ring is out of space the whole batch suspends until
    /// reaping frees a block.
    pub fn append(
        &mut self,
        batch: Vec<RecoveryJournalEntry>,
        needs_flush: bool,
        completion: JournalEntryCompletion,
    ) {
        debug_assert!(!batch.is_empty());
        debug_assert!(batch.len() <= RECOVERY_JOURNAL_ENTRIES_PER_BLOCK as usize);
        if let Some(error) = &self.write_error {
            completion(Err(error.clone()));
            return;
        }
        if !self.has_space_for(batch.len()) {
            self.space_waiters
                .enqueue(Waiter::new(move |journal: &mut Self| {
                    journal.append(batch, needs_flush, completion)
                }));
            return;
        }

        let mut points = Vec::with_capacity(batch.len());
        for entry in batch {
            self.entries.push(entry);
            points.push(JournalPoint {
                sequence_number: self.tail,
                entry_count: (self.entries.len() - 1) as u16,
            });
            self.apply_usage_delta(&entry);

            // Trigger one: the open block is full.
            if self.entries.len() == RECOVERY_JOURNAL_ENTRIES_PER_BLOCK as usize {
                if let Err(error) = self.commit_open_block() {
                    self.fail_everything(error.clone());
                    completion(Err(error));
                    return;
                }
                self.tail += 1;
                self.entries.clear();
            }
        }

        let last = *points.last().expect("the batch is non-empty");
        self.pending.push(PendingBatch {
            last,
            points,
            completion,
        });

        // Trigger two: a flush or FUA entry forces the write out now.
        // A commit failure has already failed every pending batch.
        if needs_flush {
            let _ = self.commit_pending();
        } else {
            self.fire_durable();
        }
    }

    fn apply_usage_delta(&mut self, entry: &RecoveryJournalEntry) {
        match entry.operation {
            // An increment recording the unmapped state (a discard's new
            // mapping) does not occupy a logical block.
            JournalOperation::DataIncrement => {
                if entry.mapping.is_mapped() {
                    self.logical_blocks_used += 1;
                }
            }
            JournalOperation::DataDecrement => {
                self.logical_blocks_used = self.logical_blocks_used.saturating_sub(1)
            }
            JournalOperation::BlockMapIncrement => self.block_map_data_blocks += 1,
        }
    }

    /// Writes the open block in place with its current entry count and
    /// records the new durable position.
    fn commit_open_block(&mut self) -> Result<()> {
        let header = RecoveryBlockHeader {
            sequence_number: self.tail,
            block_map_head: self.block_map_head,
            slab_journal_head: self.slab_journal_head,
            nonce: self.nonce,
            logical_blocks_used: self.logical_blocks_used,
            block_map_data_blocks: self.block_map_data_blocks,
            check_byte: RecoveryBlockHeader::compute_check_byte(self.tail),
            recovery_count: self.recovery_count,
            metadata_type: RECOVERY_METADATA_TYPE,
            entry_count: self.entries.len() as u16,
        };
        let mut buf = Buf::alloc(1)?;
        encode_journal_block(&header, &self.entries, buf.as_mut_slice());
        self.storage.write(self.tail % self.size, buf.as_ref())?;
        self.storage.flush()?;
        self.block_writes += 1;
        self.durable = JournalPoint {
            sequence_number: self.tail,
            entry_count: self.entries.len() as u16,
        };
        Ok(())
    }

    /// Fires the completions of every pending batch the durable position
    /// now covers, in admission order.
    fn fire_durable(&mut self) {
        let durable = self.durable;
        let covered = |last: &JournalPoint| {
            last.sequence_number < durable.sequence_number
                || (last.sequence_number == durable.sequence_number
                    && last.entry_count < durable.entry_count)
        };
        let mut ready = Vec::new();
        self.pending.retain_mut(|batch| {
            if covered(&batch.last) {
                let completion = mem::replace(
                    &mut batch.completion,
                    Box::new(|_result| ()),
                );
                ready.push((mem::take(&mut batch.points), completion));
                false
            } else {
                true
            }
        });
        for (points, completion) in ready {
            self.committed_entries += points.len() as u64;
            completion(Ok(points));
        }
    }

    /// Commits the open block if any admitted batch still awaits it; the
    /// amortization point for partial blocks. The journal zone schedules
    /// a call after appends so bursts share one write.
    pub fn commit_pending(&mut self) -> Result<()> {
        if let Some(error) = &self.write_error {
            return Err(error.clone());
        }
        if self.pending.is_empty() {
            return Ok(());
        }
        if self
            .pending
            .iter()
            .any(|batch| batch.last.sequence_number == self.tail)
        {
            if let Err(error) = self.commit_open_block() {
                self.fail_everything(error.clone());
                return Err(error);
            }
        }
        self.fire_durable();
        Ok(())
    }

    fn fail_everything(&mut self, error: Error) {
        error!(
            "recovery journal write failed at sequence {}: {:?}",
            self.tail, error
        );
        self.write_error = Some(error.clone());
        for batch in mem::take(&mut self.pending) {
            (batch.completion)(Err(error.clone()));
        }
        // Each space waiter re-runs `append`, which now fails fast.
        let mut waiters = mem::take(&mut self.space_waiters);
        waiters.notify_all(self);
    }

    /// Records that the block map no longer needs sequence numbers below
    /// `sequence`, possibly unblocking stalled appends.
    pub fn advance_block_map_head(&mut self, sequence: u64) {
        if sequence > self.block_map_head {
            self.block_map_head = sequence;
            self.release_space_waiters();
        }
    }

    /// Records that the slab journals no longer need sequence numbers
    /// below `sequence`, possibly unblocking stalled appends.
    pub fn advance_slab_journal_head(&mut self, sequence: u64) {
        if sequence > self.slab_journal_head {
            self.slab_journal_head = sequence;
            self.release_space_waiters();
        }
    }

    fn release_space_waiters(&mut self) {
        if self.space_waiters.is_empty() || !self.has_space_for(1) {
            return;
        }
        let mut waiters = mem::take(&mut self.space_waiters);
        waiters.notify_all(self);
    }

    /// Returns the sticky write error, if any.
    pub fn write_error(&self) -> Option<&Error> {
        self.write_error.as_ref()
    }

    /// Commits everything admitted and flushes the storage below; used by
    /// suspend and by flush descriptors.
    pub fn drain(&mut self) -> Result<()> {
        if let Some(error) = &self.write_error {
            return Err(error.clone());
        }
        self.commit_pending()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc as StdArc,
    };

    use super::{
        JournalPoint, RecoveryJournal, RecoveryJournalState, RECOVERY_JOURNAL_ENTRIES_PER_BLOCK,
    };
    use crate::layers::{
        bio::{BlockSet, MemDisk},
        journal::{
            BlockMapEntry, JournalEntrySlot, JournalOperation, RecoveryBlockHeader,
            RecoveryJournalEntry,
        },
    };

    fn entry(i: u64) -> RecoveryJournalEntry {
        RecoveryJournalEntry {
            operation: JournalOperation::DataIncrement,
            slot: JournalEntrySlot {
                pbn: 8 + i,
                slot_index: 0,
            },
            mapping: BlockMapEntry::uncompressed(100 + i),
        }
    }

    fn count_appends(journal: &mut RecoveryJournal<MemDisk>, entries: Vec<RecoveryJournalEntry>, flush: bool) -> StdArc<AtomicU64> {
        let fired = StdArc::new(AtomicU64::new(0));
        let fired_clone = fired.clone();
        journal.append(
            entries,
            flush,
            Box::new(move |result| {
                result.unwrap();
                fired_clone.fetch_add(1, Ordering::Relaxed);
            }),
        );
        fired
    }

    #[test]
    fn state_roundtrip() {
        let state = RecoveryJournalState {
            journal_start: 17,
            logical_blocks_used: 1234,
            block_map_data_blocks: 5,
        };
        assert_eq!(
            RecoveryJournalState::decode(&state.encode()).unwrap(),
            state
        );
    }

    #[test]
    fn partial_block_buffers_until_commit_pending() {
        let disk = MemDisk::create(16).unwrap();
        RecoveryJournal::format(&disk).unwrap();
        let mut journal = RecoveryJournal::open(disk.clone(), 0xabcd, Default::default(), 0);

        let seen = StdArc::new(AtomicU64::new(0));
        for i in 0..3u64 {
            let seen = seen.clone();
            journal.append(
                vec![entry(i)],
                false,
                Box::new(move |result| {
                    let points = result.unwrap();
                    assert_eq!(points[0].sequence_number, 1);
                    assert_eq!(points[0].entry_count, i as u16);
                    seen.fetch_add(1, Ordering::Relaxed);
                }),
            );
        }
        // Nothing is durable and nothing was written yet.
        assert_eq!(seen.load(Ordering::Relaxed), 0);
        assert!(journal.has_uncommitted());
        assert_eq!(journal.block_writes(), 0);

        // One amortized commit covers all three batches.
        journal.commit_pending().unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 3);
        assert!(!journal.has_uncommitted());
        assert_eq!(journal.block_writes(), 1);
        assert_eq!(journal.logical_blocks_used(), 3);
    }

    #[test]
    fn flush_entry_dispatches_immediately() {
        let disk = MemDisk::create(16).unwrap();
        RecoveryJournal::format(&disk).unwrap();
        let mut journal = RecoveryJournal::open(disk.clone(), 7, Default::default(), 0);

        let plain = count_appends(&mut journal, vec![entry(0)], false);
        assert_eq!(plain.load(Ordering::Relaxed), 0);

        // The FUA batch forces the block out, covering the earlier batch
        // in the same write.
        let forced = count_appends(&mut journal, vec![entry(1)], true);
        assert_eq!(forced.load(Ordering::Relaxed), 1);
        assert_eq!(plain.load(Ordering::Relaxed), 1);
        assert_eq!(journal.block_writes(), 1);
    }

    #[test]
    fn paired_entries_share_one_batch() {
        let disk = MemDisk::create(16).unwrap();
        RecoveryJournal::format(&disk).unwrap();
        let mut journal = RecoveryJournal::open(disk, 7, Default::default(), 0);

        journal.append(
            vec![entry(0), entry(1)],
            true,
            Box::new(|result| {
                let points = result.unwrap();
                assert_eq!(points.len(), 2);
                assert_eq!(points[0].entry_count, 0);
                assert_eq!(points[1].entry_count, 1);
            }),
        );
    }

    #[test]
    fn full_block_commits_and_rolls_over() {
        let disk = MemDisk::create(16).unwrap();
        RecoveryJournal::format(&disk).unwrap();
        let mut journal = RecoveryJournal::open(disk, 7, Default::default(), 0);
        let fired = StdArc::new(AtomicU64::new(0));
        for i in 0..u64::from(RECOVERY_JOURNAL_ENTRIES_PER_BLOCK) {
            let fired = fired.clone();
            journal.append(
                vec![entry(i)],
                false,
                Box::new(move |result| {
                    result.unwrap();
                    fired.fetch_add(1, Ordering::Relaxed);
                }),
            );
        }
        // Filling the block dispatched its write without any flush.
        assert_eq!(
            fired.load(Ordering::Relaxed),
            u64::from(RECOVERY_JOURNAL_ENTRIES_PER_BLOCK)
        );
        assert_eq!(journal.tail_sequence(), 2);
        assert_eq!(journal.block_writes(), 1);
    }

    #[test]
    fn full_ring_suspends_until_head_advances() {
        let disk = MemDisk::create(2).unwrap();
        RecoveryJournal::format(&disk).unwrap();
        let mut journal = RecoveryJournal::open(disk, 7, Default::default(), 0);

        // Fill two whole blocks: sequences 1 and 2.
        for i in 0..2 * u64::from(RECOVERY_JOURNAL_ENTRIES_PER_BLOCK) {
            journal.append(vec![entry(i)], false, Box::new(|result| {
                assert!(result.is_ok());
            }));
        }
        assert_eq!(journal.tail_sequence(), 3);

        // The ring (2 blocks) is exhausted; the next append must suspend.
        let committed = StdArc::new(AtomicU64::new(0));
        let committed_clone = committed.clone();
        journal.append(
            vec![entry(999)],
            true,
            Box::new(move |result| {
                result.unwrap();
                committed_clone.fetch_add(1, Ordering::Relaxed);
            }),
        );
        assert_eq!(committed.load(Ordering::Relaxed), 0);

        journal.advance_block_map_head(2);
        journal.advance_slab_journal_head(2);
        assert_eq!(committed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn committed_block_is_readable_and_valid() {
        let disk = MemDisk::create(16).unwrap();
        RecoveryJournal::format(&disk).unwrap();
        let mut journal = RecoveryJournal::open(disk.clone(), 7, Default::default(), 0);
        journal.append(vec![entry(0)], true, Box::new(|result| {
            assert!(result.is_ok());
        }));

        let mut buf = crate::layers::bio::Buf::alloc(1).unwrap();
        disk.read(1, buf.as_mut()).unwrap();
        let header = RecoveryBlockHeader::decode(buf.as_slice()).unwrap();
        assert!(header.is_valid(7));
        assert_eq!(header.sequence_number, 1);
        assert_eq!(header.entry_count, 1);
    }

    #[test]
    fn journal_point_of_first_entry() {
        let point = JournalPoint {
            sequence_number: 1,
            entry_count: 0,
        };
        assert!(point.is_valid());
    }
}
