// SPDX-License-Identifier: MPL-2.0

//! Scanning and validation of a recovery journal after unclean shutdown.

use super::{
    block::{decode_journal_entries, RecoveryBlockHeader},
    entry::{JournalOperation, RecoveryJournalEntry},
    point::JournalPoint,
};
use crate::{
    layers::bio::{BlockSet, Buf, BLOCK_SIZE},
    prelude::*,
};

/// What a journal scan found: the live range of the journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeadAndTail {
    /// The highest valid sequence number found.
    pub tail: u64,
    /// The highest block-map head recorded in any valid block.
    pub block_map_head: u64,
    /// The highest slab-journal head recorded in any valid block.
    pub slab_journal_head: u64,
    /// The usage counts recorded in the tail block.
    pub logical_blocks_used: u64,
    pub block_map_data_blocks: u64,
}

/// A journal region loaded into memory for replay.
pub struct ScannedJournal {
    size: u64,
    nonce: u64,
    blocks: Buf,
}

impl ScannedJournal {
    /// Reads the whole journal region from storage.
    pub fn load<D: BlockSet>(storage: &D, nonce: u64) -> Result<Self> {
        let size = storage.nblocks();
        let mut blocks = Buf::alloc(size as usize)?;
        storage.read(0, blocks.as_mut())?;
        Ok(Self {
            size,
            nonce,
            blocks,
        })
    }

    fn block_at_offset(&self, offset: u64) -> &[u8] {
        let start = offset as usize * BLOCK_SIZE;
        &self.blocks.as_slice()[start..start + BLOCK_SIZE]
    }

    fn decode_valid_header(&self, sequence: u64) -> Option<RecoveryBlockHeader> {
        let offset = sequence % self.size;
        let header = RecoveryBlockHeader::decode(self.block_at_offset(offset)).ok()?;
        // A block only belongs to this journal incarnation if the sequence
        // it claims actually lands at the offset it was read from.
        if header.sequence_number % self.size != offset {
            return None;
        }
        if !header.is_valid(self.nonce) {
            return None;
        }
        if header.sequence_number != sequence {
            return None;
        }
        Some(header)
    }

    /// Scans every block and determines the journal's live range, or
    /// `None` when no valid block exists (a freshly formatted journal).
    pub fn find_head_and_tail(&self) -> Option<HeadAndTail> {
        let mut found: Option<HeadAndTail> = None;
        for offset in 0..self.size {
            let Ok(header) = RecoveryBlockHeader::decode(self.block_at_offset(offset)) else {
                continue;
            };
            if header.sequence_number % self.size != offset || !header.is_valid(self.nonce) {
                continue;
            }
            let entry = found.get_or_insert(HeadAndTail {
                tail: header.sequence_number,
                block_map_head: header.block_map_head,
                slab_journal_head: header.slab_journal_head,
                logical_blocks_used: header.logical_blocks_used,
                block_map_data_blocks: header.block_map_data_blocks,
            });
            entry.block_map_head = entry.block_map_head.max(header.block_map_head);
            entry.slab_journal_head = entry.slab_journal_head.max(header.slab_journal_head);
            if header.sequence_number >= entry.tail {
                entry.tail = header.sequence_number;
                entry.logical_blocks_used = header.logical_blocks_used;
                entry.block_map_data_blocks = header.block_map_data_blocks;
            }
        }
        found
    }

    /// Iterates the entries of the contiguous valid range `[head, tail]`
    /// in sequence order, stopping early at the first missing block.
    ///
    /// The journal guarantees commit in strict sequence order, so a gap
    /// means every later block predates the gap and must not be replayed.
    pub fn entries_in_order(
        &self,
        head: u64,
        tail: u64,
    ) -> Result<Vec<(JournalPoint, RecoveryJournalEntry)>> {
        let mut out = Vec::new();
        for sequence in head.max(1)..=tail {
            let Some(header) = self.decode_valid_header(sequence) else {
                break;
            };
            let offset = sequence % self.size;
            let entries = decode_journal_entries(&header, self.block_at_offset(offset))?;
            for (index, entry) in entries.into_iter().enumerate() {
                let point = JournalPoint {
                    sequence_number: sequence,
                    entry_count: index as u16,
                };
                out.push((point, entry));
            }
        }
        Ok(out)
    }
}

/// Convenience wrapper: load and scan a journal region.
pub fn find_head_and_tail<D: BlockSet>(storage: &D, nonce: u64) -> Result<Option<HeadAndTail>> {
    Ok(ScannedJournal::load(storage, nonce)?.find_head_and_tail())
}

/// Validates a replayed entry against the device geometry.
///
/// Fails with `CorruptJournal` when the slot page is out of bounds, the
/// slot index exceeds the entries per page, the mapped block is out of
/// bounds, or a block-map increment targets a compressed or zero mapping.
pub fn validate_entry(
    entry: &RecoveryJournalEntry,
    physical_blocks: u64,
    entries_per_page: u16,
) -> Result<()> {
    if entry.slot.pbn >= physical_blocks {
        return_errno_with_msg!(CorruptJournal, "journal entry slot pbn out of bounds");
    }
    if entry.slot.slot_index >= entries_per_page {
        return_errno_with_msg!(CorruptJournal, "journal entry slot index out of bounds");
    }
    if entry.mapping.pbn >= physical_blocks {
        return_errno_with_msg!(CorruptJournal, "journal entry mapping out of bounds");
    }
    if entry.operation == JournalOperation::BlockMapIncrement {
        if entry.mapping.state.is_compressed() {
            return_errno_with_msg!(CorruptJournal, "block map increment with compressed mapping");
        }
        if entry.mapping.state == super::mapping::MappingState::ZeroBlock {
            return_errno_with_msg!(CorruptJournal, "block map increment of the zero block");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{find_head_and_tail, validate_entry, ScannedJournal};
    use crate::layers::{
        bio::MemDisk,
        journal::{
            BlockMapEntry, JournalEntrySlot, JournalOperation, RecoveryJournal,
            RecoveryJournalEntry,
        },
    };

    fn entry(i: u64) -> RecoveryJournalEntry {
        RecoveryJournalEntry {
            operation: JournalOperation::DataIncrement,
            slot: JournalEntrySlot {
                pbn: 8,
                slot_index: i as u16,
            },
            mapping: BlockMapEntry::uncompressed(100 + i),
        }
    }

    #[test]
    fn empty_journal_scans_to_none() {
        let disk = MemDisk::create(8).unwrap();
        RecoveryJournal::format(&disk).unwrap();
        assert_eq!(find_head_and_tail(&disk, 5).unwrap(), None);
    }

    #[test]
    fn scan_finds_committed_range() {
        let disk = MemDisk::create(8).unwrap();
        RecoveryJournal::format(&disk).unwrap();
        let mut journal = RecoveryJournal::open(disk.clone(), 5, Default::default(), 0);
        journal.append(
            vec![entry(0), entry(1), entry(2)],
            false,
            Box::new(|result| assert!(result.is_ok())),
        );
        journal.commit_pending().unwrap();

        let found = find_head_and_tail(&disk, 5).unwrap().unwrap();
        assert_eq!(found.tail, 1);
        assert_eq!(found.block_map_head, 1);
        assert_eq!(found.slab_journal_head, 1);

        // A different nonce sees nothing.
        assert_eq!(find_head_and_tail(&disk, 6).unwrap(), None);

        let scanned = ScannedJournal::load(&disk, 5).unwrap();
        let entries = scanned.entries_in_order(found.block_map_head, found.tail).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].0.sequence_number, 1);
        assert_eq!(entries[2].0.entry_count, 2);
        assert_eq!(entries[1].1, entry(1));
    }

    #[test]
    fn validate_entry_bounds() {
        assert!(validate_entry(&entry(0), 1000, 512).is_ok());
        assert!(validate_entry(&entry(0), 8, 512).is_err());
        assert!(validate_entry(&entry(600), 1000, 512).is_err());

        let bad_mapping = RecoveryJournalEntry {
            mapping: BlockMapEntry::uncompressed(5000),
            ..entry(0)
        };
        assert!(validate_entry(&bad_mapping, 1000, 512).is_err());

        let compressed_tree_page = RecoveryJournalEntry {
            operation: JournalOperation::BlockMapIncrement,
            mapping: BlockMapEntry::compressed(99, 3),
            ..entry(0)
        };
        assert!(validate_entry(&compressed_tree_page, 1000, 512).is_err());

        let zero_tree_page = RecoveryJournalEntry {
            operation: JournalOperation::BlockMapIncrement,
            mapping: BlockMapEntry::ZERO,
            ..entry(0)
        };
        assert!(validate_entry(&zero_tree_page, 1000, 512).is_err());
    }
}
