// SPDX-License-Identifier: MPL-2.0

use static_assertions::const_assert;

use super::entry::{RecoveryJournalEntry, JOURNAL_ENTRY_SIZE};
use crate::{layers::bio::BLOCK_SIZE, prelude::*};

/// The metadata-type byte carried by every recovery journal block.
pub const RECOVERY_METADATA_TYPE: u8 = 1;

/// The size in bytes of the packed recovery journal block header.
pub const JOURNAL_BLOCK_HEADER_SIZE: usize = 56;

/// The number of packed entries that fit after the header of one block.
pub const RECOVERY_JOURNAL_ENTRIES_PER_BLOCK: u16 =
    ((BLOCK_SIZE - JOURNAL_BLOCK_HEADER_SIZE) / JOURNAL_ENTRY_SIZE) as u16;

const_assert!(RECOVERY_JOURNAL_ENTRIES_PER_BLOCK > 0);

/// The header of one recovery journal block, packed little-endian:
///
/// ```text
/// [sequence_number: u64][block_map_head: u64][slab_journal_head: u64]
/// [nonce: u64][logical_blocks_used: u64][block_map_data_blocks: u64]
/// [check_byte: u8][recovery_count: u8][metadata_type: u8][reserved: u8]
/// [entry_count: u16][reserved: u16]
/// ```
///
/// Carrying the usage counts in every block lets recovery restore them
/// exactly from the tail block instead of recounting the whole device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryBlockHeader {
    pub sequence_number: u64,
    /// The lowest journal sequence number the block map still requires.
    pub block_map_head: u64,
    /// The lowest journal sequence number the slab journals still require.
    pub slab_journal_head: u64,
    pub nonce: u64,
    /// Logical blocks mapped as of this block's last entry.
    pub logical_blocks_used: u64,
    /// Physical blocks holding block-map tree pages as of this block.
    pub block_map_data_blocks: u64,
    pub check_byte: u8,
    pub recovery_count: u8,
    pub metadata_type: u8,
    pub entry_count: u16,
}

impl RecoveryBlockHeader {
    /// Computes the check byte expected for the given sequence number.
    pub fn compute_check_byte(sequence_number: u64) -> u8 {
        (sequence_number & 0x7f) as u8 | 0x80
    }

    /// Encodes the header into the first [`JOURNAL_BLOCK_HEADER_SIZE`]
    /// bytes of `out`.
    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= JOURNAL_BLOCK_HEADER_SIZE);
        out[0..8].copy_from_slice(&self.sequence_number.to_le_bytes());
        out[8..16].copy_from_slice(&self.block_map_head.to_le_bytes());
        out[16..24].copy_from_slice(&self.slab_journal_head.to_le_bytes());
        out[24..32].copy_from_slice(&self.nonce.to_le_bytes());
        out[32..40].copy_from_slice(&self.logical_blocks_used.to_le_bytes());
        out[40..48].copy_from_slice(&self.block_map_data_blocks.to_le_bytes());
        out[48] = self.check_byte;
        out[49] = self.recovery_count;
        out[50] = self.metadata_type;
        out[51] = 0;
        out[52..54].copy_from_slice(&self.entry_count.to_le_bytes());
        out[54..56].copy_from_slice(&[0, 0]);
    }

    /// Decodes a header encoded by [`RecoveryBlockHeader::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < JOURNAL_BLOCK_HEADER_SIZE {
            return_errno_with_msg!(CorruptJournal, "short recovery journal block");
        }
        Ok(Self {
            sequence_number: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            block_map_head: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            slab_journal_head: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            nonce: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
            logical_blocks_used: u64::from_le_bytes(bytes[32..40].try_into().unwrap()),
            block_map_data_blocks: u64::from_le_bytes(bytes[40..48].try_into().unwrap()),
            check_byte: bytes[48],
            recovery_count: bytes[49],
            metadata_type: bytes[50],
            entry_count: u16::from_le_bytes([bytes[52], bytes[53]]),
        })
    }

    /// Returns whether the header could belong to this journal: matching
    /// nonce and metadata type, a consistent check byte, and an entry
    /// count within the per-block capacity.
    pub fn is_valid(&self, nonce: u64) -> bool {
        self.nonce == nonce
            && self.metadata_type == RECOVERY_METADATA_TYPE
            && self.check_byte == Self::compute_check_byte(self.sequence_number)
            && self.entry_count <= RECOVERY_JOURNAL_ENTRIES_PER_BLOCK
    }
}

/// Encodes a full journal block (header plus `entries`) into `out`.
pub fn encode_journal_block(
    header: &RecoveryBlockHeader,
    entries: &[RecoveryJournalEntry],
    out: &mut [u8],
) {
    debug_assert_eq!(out.len(), BLOCK_SIZE);
    debug_assert_eq!(header.entry_count as usize, entries.len());
    header.encode(out);
    let mut offset = JOURNAL_BLOCK_HEADER_SIZE;
    for entry in entries {
        entry.encode(&mut out[offset..offset + JOURNAL_ENTRY_SIZE]);
        offset += JOURNAL_ENTRY_SIZE;
    }
    out[offset..].fill(0);
}

/// Decodes the `entry_count` entries following a block's header.
pub fn decode_journal_entries(
    header: &RecoveryBlockHeader,
    block: &[u8],
) -> Result<Vec<RecoveryJournalEntry>> {
    let mut entries = Vec::with_capacity(header.entry_count as usize);
    let mut offset = JOURNAL_BLOCK_HEADER_SIZE;
    for _ in 0..header.entry_count {
        entries.push(RecoveryJournalEntry::decode(
            &block[offset..offset + JOURNAL_ENTRY_SIZE],
        )?);
        offset += JOURNAL_ENTRY_SIZE;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::{
        decode_journal_entries, encode_journal_block, RecoveryBlockHeader,
        RECOVERY_JOURNAL_ENTRIES_PER_BLOCK, RECOVERY_METADATA_TYPE,
    };
    use crate::layers::{
        bio::BLOCK_SIZE,
        journal::{BlockMapEntry, JournalEntrySlot, JournalOperation, RecoveryJournalEntry},
    };

    fn header(sequence_number: u64, entry_count: u16) -> RecoveryBlockHeader {
        RecoveryBlockHeader {
            sequence_number,
            block_map_head: 1,
            slab_journal_head: 1,
            nonce: 0xfeed,
            logical_blocks_used: 3,
            block_map_data_blocks: 1,
            check_byte: RecoveryBlockHeader::compute_check_byte(sequence_number),
            recovery_count: 0,
            metadata_type: RECOVERY_METADATA_TYPE,
            entry_count,
        }
    }

    #[test]
    fn header_roundtrip() {
        let original = header(44, 7);
        let mut block = [0u8; BLOCK_SIZE];
        original.encode(&mut block);
        let decoded = RecoveryBlockHeader::decode(&block).unwrap();
        assert_eq!(decoded, original);
        assert!(decoded.is_valid(0xfeed));
        assert!(!decoded.is_valid(0xbeef));
    }

    #[test]
    fn check_byte_mismatch_is_invalid() {
        let mut bad = header(44, 0);
        bad.check_byte = RecoveryBlockHeader::compute_check_byte(45);
        assert!(!bad.is_valid(0xfeed));
    }

    #[test]
    fn overfull_header_is_invalid() {
        let bad = header(3, RECOVERY_JOURNAL_ENTRIES_PER_BLOCK + 1);
        assert!(!bad.is_valid(0xfeed));
    }

    #[test]
    fn block_roundtrip() {
        let entries: Vec<_> = (0..5u64)
            .map(|i| RecoveryJournalEntry {
                operation: JournalOperation::DataIncrement,
                slot: JournalEntrySlot {
                    pbn: 100 + i,
                    slot_index: i as u16,
                },
                mapping: BlockMapEntry::uncompressed(2000 + i),
            })
            .collect();
        let header = header(9, entries.len() as u16);

        let mut block = [0u8; BLOCK_SIZE];
        encode_journal_block(&header, &entries, &mut block);
        let decoded_header = RecoveryBlockHeader::decode(&block).unwrap();
        let decoded = decode_journal_entries(&decoded_header, &block).unwrap();
        assert_eq!(decoded, entries);
    }
}
