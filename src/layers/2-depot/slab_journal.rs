// SPDX-License-Identifier: MPL-2.0

use crate::{
    layers::{
        bio::{BlockSet, Buf, BLOCK_SIZE},
        journal::{JournalOperation, JournalPoint},
    },
    os::HashSet,
    prelude::*,
};

/// The metadata-type byte carried by every slab journal block.
pub const SLAB_METADATA_TYPE: u8 = 2;

/// The size in bytes of the packed slab journal block header.
pub const SLAB_JOURNAL_BLOCK_HEADER_SIZE: usize = 40;

/// The size in bytes of one packed entry: the delta plus the
/// recovery-journal point covering it. Entries carry their own points
/// because deltas from different vios may reach a slab out of recovery
/// order; replay decides per entry whether the delta was mirrored.
pub const SLAB_JOURNAL_ENTRY_SIZE: usize = 16;

/// Packed entries per block when every entry is a data delta.
pub const SLAB_JOURNAL_ENTRIES_PER_BLOCK: u16 =
    ((BLOCK_SIZE - SLAB_JOURNAL_BLOCK_HEADER_SIZE) / SLAB_JOURNAL_ENTRY_SIZE) as u16;

/// Packed entries per block when block-map increments are present.
pub const SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK: u16 = SLAB_JOURNAL_ENTRIES_PER_BLOCK / 2;

/// One slab journal entry: a reference-count delta for a slab block,
/// packed into a little-endian u64 with the operation in bits 62..63 and
/// the slab block number in bits 0..47.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabJournalEntry {
    pub sbn: u64,
    pub operation: JournalOperation,
}

impl SlabJournalEntry {
    /// Packs the entry to its 64-bit form.
    pub fn pack(&self) -> u64 {
        let op = match self.operation {
            JournalOperation::DataIncrement => 0u64,
            JournalOperation::DataDecrement => 1,
            JournalOperation::BlockMapIncrement => 2,
        };
        (op << 62) | (self.sbn & ((1 << 48) - 1))
    }

    /// Unpacks an entry packed by [`SlabJournalEntry::pack`].
    pub fn unpack(packed: u64) -> Result<Self> {
        let operation = match packed >> 62 {
            0 => JournalOperation::DataIncrement,
            1 => JournalOperation::DataDecrement,
            2 => JournalOperation::BlockMapIncrement,
            _ => return_errno_with_msg!(CorruptJournal, "unknown slab journal operation"),
        };
        Ok(Self {
            sbn: packed & ((1 << 48) - 1),
            operation,
        })
    }
}

/// The header of one slab journal block, packed little-endian:
///
/// ```text
/// [sequence_number: u64][head: u64][nonce: u64][recovery_point: u64]
/// [entry_count: u16][metadata_type: u8][has_block_map_increments: u8]
/// [reserved: u32]
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabJournalBlockHeader {
    pub sequence_number: u64,
    /// The oldest sequence number in this journal still holding deltas
    /// that the saved reference counts do not reflect.
    pub head: u64,
    pub nonce: u64,
    /// The newest recovery-journal point among the block's entries.
    pub recovery_point: JournalPoint,
    pub entry_count: u16,
    pub metadata_type: u8,
    pub has_block_map_increments: bool,
}

impl SlabJournalBlockHeader {
    /// Encodes the header into the first bytes of `out`.
    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= SLAB_JOURNAL_BLOCK_HEADER_SIZE);
        out[0..8].copy_from_slice(&self.sequence_number.to_le_bytes());
        out[8..16].copy_from_slice(&self.head.to_le_bytes());
        out[16..24].copy_from_slice(&self.nonce.to_le_bytes());
        out[24..32].copy_from_slice(&self.recovery_point.to_le_bytes());
        out[32..34].copy_from_slice(&self.entry_count.to_le_bytes());
        out[34] = self.metadata_type;
        out[35] = self.has_block_map_increments as u8;
        out[36..40].fill(0);
    }

    /// Decodes a header encoded by [`SlabJournalBlockHeader::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SLAB_JOURNAL_BLOCK_HEADER_SIZE {
            return_errno_with_msg!(CorruptJournal, "short slab journal block");
        }
        Ok(Self {
            sequence_number: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            head: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            nonce: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            recovery_point: JournalPoint::from_le_bytes(bytes[24..32].try_into().unwrap()),
            entry_count: u16::from_le_bytes([bytes[32], bytes[33]]),
            metadata_type: bytes[34],
            has_block_map_increments: bytes[35] != 0,
        })
    }

    /// Validates the header against the allocator nonce and the sequence
    /// number the reader expects at this position.
    pub fn validate(&self, nonce: u64, expected_sequence: u64) -> Result<()> {
        if self.nonce != nonce {
            return_errno_with_msg!(CorruptJournal, "slab journal block has foreign nonce");
        }
        if self.metadata_type != SLAB_METADATA_TYPE {
            return_errno_with_msg!(CorruptJournal, "slab journal block has wrong metadata type");
        }
        if self.sequence_number != expected_sequence {
            return_errno_with_msg!(CorruptJournal, "slab journal block out of sequence");
        }
        let capacity = if self.has_block_map_increments {
            SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK
        } else {
            SLAB_JOURNAL_ENTRIES_PER_BLOCK
        };
        if self.entry_count > capacity {
            return_errno_with_msg!(CorruptJournal, "slab journal block overfull");
        }
        Ok(())
    }

    fn accept(&self, nonce: u64, size: u64, offset: u64) -> bool {
        self.nonce == nonce
            && self.metadata_type == SLAB_METADATA_TYPE
            && self.sequence_number % size == offset
    }
}

/// The per-slab circular journal of reference-count deltas.
///
/// Owned by the slab's physical zone. Every appended delta has already
/// been committed to the recovery journal; this journal exists so that
/// the slab's counters can be rebuilt without replaying the whole
/// recovery journal, and so the recovery journal can reap.
///
/// Deltas buffer in the open block; a write is dispatched only when the
/// block fills or the owner forces a commit (the zone's amortized commit
/// pass, or a counter save covering the buffered deltas). Until then the
/// buffered deltas pin the recovery journal's slab head through their
/// vios' commit locks.
pub struct SlabJournal<D> {
    storage: D,
    size: u64,
    nonce: u64,
    tail: u64,
    head: u64,
    entries: Vec<(SlabJournalEntry, JournalPoint)>,
    /// Entries admitted since the open block was last written.
    unwritten: bool,
    has_block_map_increments: bool,
    /// The recovery journal point covering the newest admitted delta.
    tail_recovery_point: JournalPoint,
}

impl<D: BlockSet> SlabJournal<D> {
    /// Formats the slab journal region with zeroed blocks.
    pub fn format(storage: &D) -> Result<()> {
        let zero = Buf::alloc(1)?;
        for pbn in 0..storage.nblocks() {
            storage.write(pbn, zero.as_ref())?;
        }
        storage.flush()
    }

    /// Opens the journal for appending after a clean load; the saved
    /// reference counts reflect every prior entry, so the journal
    /// restarts empty.
    pub fn open(storage: D, nonce: u64) -> Self {
        let size = storage.nblocks();
        Self {
            storage,
            size,
            nonce,
            tail: 1,
            head: 1,
            entries: Vec::new(),
            unwritten: false,
            has_block_map_increments: false,
            tail_recovery_point: JournalPoint::default(),
        }
    }

    /// Returns the capacity (in blocks) of the journal region.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the journal's storage region.
    pub fn storage(&self) -> &D {
        &self.storage
    }

    /// Returns the recovery journal point of the newest admitted delta.
    pub fn tail_recovery_point(&self) -> JournalPoint {
        self.tail_recovery_point
    }

    fn block_capacity(&self) -> u16 {
        if self.has_block_map_increments {
            SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK
        } else {
            SLAB_JOURNAL_ENTRIES_PER_BLOCK
        }
    }

    /// Appends one delta, returning its slab-journal point and whether
    /// the append dispatched a write (the open block filled).
    /// `recovery_point` is the recovery-journal position that already
    /// covers this delta.
    pub fn append(
        &mut self,
        entry: SlabJournalEntry,
        recovery_point: JournalPoint,
    ) -> Result<(JournalPoint, bool)> {
        if self.tail - self.head >= self.size {
            // The ring is full: the counters must be saved before more
            // deltas can be admitted. The depot triggers the save; rolling
            // over here would lose deltas.
            return_errno_with_msg!(OutOfSpace, "slab journal is full");
        }
        if entry.operation == JournalOperation::BlockMapIncrement {
            self.has_block_map_increments = true;
        }
        self.entries.push((entry, recovery_point));
        self.unwritten = true;
        let point = JournalPoint {
            sequence_number: self.tail,
            entry_count: (self.entries.len() - 1) as u16,
        };
        self.tail_recovery_point = self.tail_recovery_point.max(recovery_point);

        if self.entries.len() >= self.block_capacity() as usize {
            self.commit_open_block()?;
            self.tail += 1;
            self.entries.clear();
            self.unwritten = false;
            self.has_block_map_increments = false;
            return Ok((point, true));
        }
        Ok((point, false))
    }

    /// Returns whether the open block holds deltas not yet on disk.
    pub fn has_unwritten(&self) -> bool {
        self.unwritten
    }

    /// Writes the open block if any admitted delta is not yet on disk.
    /// Returns whether a write happened.
    pub fn commit(&mut self) -> Result<bool> {
        if !self.unwritten {
            return Ok(false);
        }
        self.commit_open_block()?;
        self.unwritten = false;
        Ok(true)
    }

    fn commit_open_block(&mut self) -> Result<()> {
        let header = SlabJournalBlockHeader {
            sequence_number: self.tail,
            head: self.head,
            nonce: self.nonce,
            recovery_point: self.tail_recovery_point,
            entry_count: self.entries.len() as u16,
            metadata_type: SLAB_METADATA_TYPE,
            has_block_map_increments: self.has_block_map_increments,
        };
        let mut buf = Buf::alloc(1)?;
        header.encode(buf.as_mut_slice());
        let mut offset = SLAB_JOURNAL_BLOCK_HEADER_SIZE;
        for (entry, recovery_point) in &self.entries {
            buf.as_mut_slice()[offset..offset + 8].copy_from_slice(&entry.pack().to_le_bytes());
            buf.as_mut_slice()[offset + 8..offset + 16]
                .copy_from_slice(&recovery_point.to_le_bytes());
            offset += SLAB_JOURNAL_ENTRY_SIZE;
        }
        self.storage.write(self.tail % self.size, buf.as_ref())?;
        self.storage.flush()
    }

    /// Marks every admitted delta as reflected by saved counters; the
    /// whole ring becomes reusable. The sequence moves past the open
    /// block so later appends never collide with the saved counter
    /// watermark.
    pub fn reap_all(&mut self) {
        if !self.entries.is_empty() {
            self.tail += 1;
            self.entries.clear();
            self.has_block_map_increments = false;
        }
        self.unwritten = false;
        self.head = self.tail;
    }

    /// Returns whether the ring has room for another delta.
    pub fn has_space(&self) -> bool {
        self.tail - self.head < self.size
    }

    /// Scans the journal region for the newest recovery-journal point any
    /// committed block covers; the summary's tail hint.
    pub fn scan_tail_recovery_point(storage: &D, nonce: u64) -> Result<JournalPoint> {
        let size = storage.nblocks();
        let mut buf = Buf::alloc(1)?;
        let mut newest = JournalPoint::default();
        for offset in 0..size {
            storage.read(offset, buf.as_mut())?;
            let Ok(header) = SlabJournalBlockHeader::decode(buf.as_slice()) else {
                continue;
            };
            if header.accept(nonce, size, offset) {
                newest = newest.max(header.recovery_point);
            }
        }
        Ok(newest)
    }

    /// Collects every recovery-journal point that a committed block
    /// mirrors, packed. Used when opening an unrecovered slab so that
    /// recovery-journal replay can skip exactly the deltas this journal
    /// already holds on disk.
    pub fn scan_mirrored_recovery_points(storage: &D, nonce: u64) -> Result<HashSet<u64>> {
        let size = storage.nblocks();
        let mut buf = Buf::alloc(1)?;
        let mut mirrored = HashSet::new();
        for offset in 0..size {
            storage.read(offset, buf.as_mut())?;
            let Ok(header) = SlabJournalBlockHeader::decode(buf.as_slice()) else {
                continue;
            };
            if !header.accept(nonce, size, offset) {
                continue;
            }
            let mut at = SLAB_JOURNAL_BLOCK_HEADER_SIZE;
            for _ in 0..header.entry_count {
                let point =
                    u64::from_le_bytes(buf.as_slice()[at + 8..at + 16].try_into().unwrap());
                mirrored.insert(point);
                at += SLAB_JOURNAL_ENTRY_SIZE;
            }
        }
        Ok(mirrored)
    }

    /// Overrides the recovery-point watermark (used when re-opening an
    /// unrecovered slab from its on-disk journal).
    pub fn set_tail_recovery_point(&mut self, point: JournalPoint) {
        self.tail_recovery_point = point;
    }

    /// Replays the journal into `apply`, which receives each entry and
    /// the synthetic journal point identifying it.
    ///
    /// Scrubbing starts at the valid block with the lowest `head` field
    /// and walks forward through the tail. Entries naming a slab block
    /// at or beyond `data_blocks` fail the scrub with `CorruptJournal`.
    pub fn scrub(
        storage: &D,
        nonce: u64,
        data_blocks: u64,
        mut apply: impl FnMut(JournalPoint, SlabJournalEntry) -> Result<()>,
    ) -> Result<()> {
        let size = storage.nblocks();
        let mut buf = Buf::alloc(1)?;

        // Find the replay range: the lowest head field among valid blocks
        // and the highest sequence number present.
        let mut head: Option<u64> = None;
        let mut tail: Option<u64> = None;
        for offset in 0..size {
            storage.read(offset, buf.as_mut())?;
            let Ok(header) = SlabJournalBlockHeader::decode(buf.as_slice()) else {
                continue;
            };
            if !header.accept(nonce, size, offset) {
                continue;
            }
            head = Some(head.map_or(header.head, |h: u64| h.min(header.head)));
            tail = Some(tail.map_or(header.sequence_number, |t: u64| {
                t.max(header.sequence_number)
            }));
        }
        let (Some(head), Some(tail)) = (head, tail) else {
            return Ok(());
        };

        for sequence in head..=tail {
            storage.read(sequence % size, buf.as_mut())?;
            let header = SlabJournalBlockHeader::decode(buf.as_slice())?;
            header.validate(nonce, sequence)?;
            let mut offset = SLAB_JOURNAL_BLOCK_HEADER_SIZE;
            for index in 0..header.entry_count {
                let packed =
                    u64::from_le_bytes(buf.as_slice()[offset..offset + 8].try_into().unwrap());
                offset += SLAB_JOURNAL_ENTRY_SIZE;
                let entry = SlabJournalEntry::unpack(packed)?;
                if entry.sbn >= data_blocks {
                    return_errno_with_msg!(CorruptJournal, "slab journal entry out of bounds");
                }
                let point = JournalPoint {
                    sequence_number: sequence,
                    entry_count: index,
                };
                apply(point, entry)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        SlabJournal, SlabJournalBlockHeader, SlabJournalEntry, SLAB_JOURNAL_ENTRIES_PER_BLOCK,
        SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK, SLAB_METADATA_TYPE,
    };
    use crate::layers::{
        bio::MemDisk,
        journal::{JournalOperation, JournalPoint},
    };

    fn delta(sbn: u64) -> SlabJournalEntry {
        SlabJournalEntry {
            sbn,
            operation: JournalOperation::DataIncrement,
        }
    }

    fn point(sequence_number: u64, entry_count: u16) -> JournalPoint {
        JournalPoint {
            sequence_number,
            entry_count,
        }
    }

    #[test]
    fn entry_pack_roundtrip() {
        for entry in [
            delta(0),
            delta((1 << 48) - 1),
            SlabJournalEntry {
                sbn: 77,
                operation: JournalOperation::DataDecrement,
            },
            SlabJournalEntry {
                sbn: 78,
                operation: JournalOperation::BlockMapIncrement,
            },
        ] {
            assert_eq!(SlabJournalEntry::unpack(entry.pack()).unwrap(), entry);
        }
        assert!(SlabJournalEntry::unpack(3 << 62).is_err());
    }

    #[test]
    fn header_validation() {
        let header = SlabJournalBlockHeader {
            sequence_number: 4,
            head: 2,
            nonce: 99,
            recovery_point: point(6, 1),
            entry_count: 10,
            metadata_type: SLAB_METADATA_TYPE,
            has_block_map_increments: false,
        };
        assert!(header.validate(99, 4).is_ok());
        assert!(header.validate(98, 4).is_err());
        assert!(header.validate(99, 5).is_err());

        let overfull = SlabJournalBlockHeader {
            entry_count: SLAB_JOURNAL_ENTRIES_PER_BLOCK + 1,
            ..header
        };
        assert!(overfull.validate(99, 4).is_err());

        let full_entries = SlabJournalBlockHeader {
            has_block_map_increments: true,
            entry_count: SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK + 1,
            ..header
        };
        assert!(full_entries.validate(99, 4).is_err());
    }

    #[test]
    fn appends_buffer_until_committed() {
        let disk = MemDisk::create(4).unwrap();
        SlabJournal::format(&disk).unwrap();
        let mut journal = SlabJournal::open(disk.clone(), 42);

        let (first, wrote) = journal.append(delta(1), point(5, 3)).unwrap();
        assert_eq!(first, point(1, 0));
        assert!(!wrote);
        assert!(journal.has_unwritten());

        // Nothing on disk yet: a scrub sees an empty journal.
        SlabJournal::scrub(&disk, 42, 100, |_point, _entry| {
            panic!("no committed entries expected");
        })
        .unwrap();

        assert!(journal.commit().unwrap());
        assert!(!journal.has_unwritten());
        assert!(!journal.commit().unwrap());

        let mut replayed = Vec::new();
        SlabJournal::scrub(&disk, 42, 100, |point, entry| {
            replayed.push((point, entry));
            Ok(())
        })
        .unwrap();
        assert_eq!(replayed, [(point(1, 0), delta(1))]);
    }

    #[test]
    fn mirrored_point_scan() {
        let disk = MemDisk::create(4).unwrap();
        SlabJournal::format(&disk).unwrap();
        let mut journal = SlabJournal::open(disk.clone(), 42);
        journal.append(delta(1), point(7, 0)).unwrap();
        // Out-of-recovery-order admission within one block.
        journal.append(delta(2), point(5, 3)).unwrap();
        journal.commit().unwrap();
        journal.append(delta(3), point(9, 0)).unwrap();
        // The third delta stays buffered and must not look mirrored.

        let mirrored = SlabJournal::scan_mirrored_recovery_points(&disk, 42).unwrap();
        assert!(mirrored.contains(&point(7, 0).pack()));
        assert!(mirrored.contains(&point(5, 3).pack()));
        assert!(!mirrored.contains(&point(9, 0).pack()));

        assert_eq!(
            SlabJournal::scan_tail_recovery_point(&disk, 42).unwrap(),
            point(7, 0)
        );
        // A foreign nonce sees nothing.
        assert!(SlabJournal::scan_mirrored_recovery_points(&disk, 43)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn append_and_scrub_roundtrip() {
        let disk = MemDisk::create(4).unwrap();
        SlabJournal::format(&disk).unwrap();
        let mut journal = SlabJournal::open(disk.clone(), 42);
        for sbn in 0..5 {
            journal.append(delta(sbn), point(1, sbn as u16)).unwrap();
        }
        journal.commit().unwrap();

        let mut replayed = Vec::new();
        SlabJournal::scrub(&disk, 42, 100, |point, entry| {
            replayed.push((point, entry));
            Ok(())
        })
        .unwrap();
        assert_eq!(replayed.len(), 5);
        assert_eq!(replayed[3].1, delta(3));
        assert_eq!(replayed[3].0, point(1, 3));
    }

    #[test]
    fn scrub_rejects_out_of_bounds_entry() {
        let disk = MemDisk::create(4).unwrap();
        SlabJournal::format(&disk).unwrap();
        let mut journal = SlabJournal::open(disk.clone(), 42);
        journal.append(delta(80), point(1, 0)).unwrap();
        journal.commit().unwrap();

        let result = SlabJournal::scrub(&disk, 42, 64, |_point, _entry| Ok(()));
        assert!(result.is_err());
    }

    #[test]
    fn scrub_of_formatted_journal_is_empty() {
        let disk = MemDisk::create(4).unwrap();
        SlabJournal::format(&disk).unwrap();
        SlabJournal::scrub(&disk, 42, 64, |_point, _entry| {
            panic!("no entries expected");
        })
        .unwrap();
    }

    #[test]
    fn full_block_commits_itself_and_full_ring_rejects() {
        let disk = MemDisk::create(1).unwrap();
        SlabJournal::format(&disk).unwrap();
        let mut journal = SlabJournal::open(disk, 42);
        for sbn in 0..u64::from(SLAB_JOURNAL_ENTRIES_PER_BLOCK) {
            let (_point, wrote) = journal.append(delta(sbn), point(1, 0)).unwrap();
            let last = sbn == u64::from(SLAB_JOURNAL_ENTRIES_PER_BLOCK) - 1;
            assert_eq!(wrote, last);
        }
        assert!(!journal.has_space());
        assert!(journal.append(delta(0), point(1, 0)).is_err());

        journal.reap_all();
        assert!(journal.has_space());
        journal.append(delta(0), point(2, 0)).unwrap();
    }
}
