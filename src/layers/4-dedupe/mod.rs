// SPDX-License-Identifier: MPL-2.0

//! The deduplication index layer.
//!
//! A content-addressable advice service: given a 16-byte chunk name, it
//! answers with the probable prior physical location of that content.
//! The index is sharded across hash zones by name; each shard buffers
//! the newest records in its slice of the *open chapter* and ages closed
//! chapters through a dense region, a sparse region behind a chapter
//! cache, and finally expiry.
//!
//! Advice is a hint, never ground truth: the write path verifies the
//! advised block's bytes before sharing it.

mod chunk_name;
mod index;
mod open_chapter;
mod volume;

pub use self::{
    chunk_name::{ChunkName, CHUNK_NAME_SIZE},
    index::{
        IndexAction, IndexConfig, IndexControl, IndexOutcome, IndexRequest, IndexStats, IndexZone,
    },
    open_chapter::OpenChapterZone,
    volume::{cache_probe_type, CacheProbeType, ChapterVolume, ClosedChapter, VolumeStats},
};
use crate::layers::{
    bio::Pbn,
    journal::{BlockMapEntry, MappingState},
};

/// The (pbn, state) hint the index returns for a chunk name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DedupeAdvice {
    pub pbn: Pbn,
    pub state: MappingState,
}

impl DedupeAdvice {
    /// Advice naming a whole (uncompressed) physical block.
    pub fn uncompressed(pbn: Pbn) -> Self {
        Self {
            pbn,
            state: MappingState::Uncompressed,
        }
    }

    /// Converts a block-map entry into advice, when it names a counted
    /// physical block.
    pub fn from_entry(entry: &BlockMapEntry) -> Option<Self> {
        entry.state.is_counted().then_some(Self {
            pbn: entry.pbn,
            state: entry.state,
        })
    }

    /// The mapping this advice suggests.
    pub fn to_entry(self) -> BlockMapEntry {
        BlockMapEntry {
            pbn: self.pbn,
            state: self.state,
        }
    }
}
