// SPDX-License-Identifier: MPL-2.0

//! The recovery journal layer.
//!
//! A single circular, sequenced write-ahead journal records every
//! logical-to-physical mapping change before the block map or any slab
//! journal is allowed to observe it. This layer owns the packed wire
//! formats (journal points, mapping entries, block headers) shared with
//! the depot and block-map layers, the runtime journal itself, and the
//! scan/validation half of crash recovery.

mod block;
mod entry;
mod journal;
mod mapping;
mod point;
mod recovery;

pub use self::{
    block::{
        RecoveryBlockHeader, JOURNAL_BLOCK_HEADER_SIZE, RECOVERY_JOURNAL_ENTRIES_PER_BLOCK,
        RECOVERY_METADATA_TYPE,
    },
    entry::{JournalEntrySlot, JournalOperation, RecoveryJournalEntry, JOURNAL_ENTRY_SIZE},
    journal::{JournalEntryCompletion, RecoveryJournal, RecoveryJournalState},
    mapping::{BlockMapEntry, MappingState, COMPRESSED_SLOTS_PER_BLOCK},
    point::JournalPoint,
    recovery::{find_head_and_tail, validate_entry, HeadAndTail, ScannedJournal},
};
