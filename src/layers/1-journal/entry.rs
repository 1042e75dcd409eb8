// SPDX-License-Identifier: MPL-2.0

use super::mapping::BlockMapEntry;
use crate::{
    layers::bio::{Pbn, MAX_BLOCK_ID},
    prelude::*,
};

/// The size in bytes of a packed recovery journal entry.
pub const JOURNAL_ENTRY_SIZE: usize = 20;

/// The kind of reference-count change a journal entry describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum JournalOperation {
    /// A new data mapping: increment the target's reference count.
    DataIncrement = 0,
    /// A dropped data mapping: decrement the target's reference count.
    DataDecrement = 1,
    /// A newly allocated block-map tree page.
    BlockMapIncrement = 2,
}

impl JournalOperation {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(JournalOperation::DataIncrement),
            1 => Ok(JournalOperation::DataDecrement),
            2 => Ok(JournalOperation::BlockMapIncrement),
            _ => Err(Error::with_msg(CorruptJournal, "unknown journal operation")),
        }
    }

    /// Returns whether the operation adds a reference.
    pub fn is_increment(self) -> bool {
        !matches!(self, JournalOperation::DataDecrement)
    }
}

/// The block-map slot an entry applies to: the tree page holding the
/// mapping and the entry index within that page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JournalEntrySlot {
    pub pbn: Pbn,
    pub slot_index: u16,
}

/// One recovery journal entry: a mapping change at a block-map slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryJournalEntry {
    pub operation: JournalOperation,
    pub slot: JournalEntrySlot,
    pub mapping: BlockMapEntry,
}

impl RecoveryJournalEntry {
    /// Encodes the entry into its packed little-endian form:
    /// `[operation: u8][reserved: u8][slot_index: u16][slot_pbn: u64][mapping: u64]`.
    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= JOURNAL_ENTRY_SIZE);
        debug_assert!(self.slot.pbn <= MAX_BLOCK_ID);
        out[0] = self.operation as u8;
        out[1] = 0;
        out[2..4].copy_from_slice(&self.slot.slot_index.to_le_bytes());
        out[4..12].copy_from_slice(&self.slot.pbn.to_le_bytes());
        out[12..20].copy_from_slice(&self.mapping.pack().to_le_bytes());
    }

    /// Decodes an entry packed by [`RecoveryJournalEntry::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < JOURNAL_ENTRY_SIZE {
            return_errno_with_msg!(CorruptJournal, "short recovery journal entry");
        }
        let operation = JournalOperation::from_u8(bytes[0])?;
        let slot_index = u16::from_le_bytes([bytes[2], bytes[3]]);
        let slot_pbn = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
        if slot_pbn > MAX_BLOCK_ID {
            return_errno_with_msg!(CorruptJournal, "journal entry slot pbn out of range");
        }
        let mapping = BlockMapEntry::unpack(u64::from_le_bytes(bytes[12..20].try_into().unwrap()))
            .map_err(|_| Error::with_msg(CorruptJournal, "journal entry mapping is invalid"))?;
        Ok(Self {
            operation,
            slot: JournalEntrySlot {
                pbn: slot_pbn,
                slot_index,
            },
            mapping,
        })
    }
}
