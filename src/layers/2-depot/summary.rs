// SPDX-License-Identifier: MPL-2.0

use crate::{
    layers::bio::{BlockSet, Buf, BLOCK_SIZE},
    prelude::*,
};

/// One slab's summary entry: two packed bytes,
/// `[tail_block_offset: u8][fullness_hint: 7 bits | is_clean: 1 bit]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlabSummaryEntry {
    /// The offset of the slab journal's tail block within its ring.
    pub tail_block_offset: u8,
    /// A quantized count of the slab's free blocks.
    pub fullness_hint: u8,
    /// Whether the slab's counters were saved after its last journal entry.
    pub is_clean: bool,
}

const FULLNESS_BITS: u32 = 7;

impl SlabSummaryEntry {
    fn pack(&self) -> [u8; 2] {
        debug_assert!(self.fullness_hint < (1 << FULLNESS_BITS));
        [
            self.tail_block_offset,
            (self.fullness_hint << 1) | self.is_clean as u8,
        ]
    }

    fn unpack(bytes: [u8; 2]) -> Self {
        Self {
            tail_block_offset: bytes[0],
            fullness_hint: bytes[1] >> 1,
            is_clean: bytes[1] & 1 != 0,
        }
    }
}

/// The compact per-slab cleanliness and free-space table.
///
/// The summary is what load consults to decide which slabs must be
/// scrubbed and which slabs are promising allocation targets; it is small
/// enough to rewrite wholesale on every update without hurting anything.
pub struct SlabSummary<D> {
    storage: D,
    entries: Vec<SlabSummaryEntry>,
    hint_shift: u32,
}

impl<D: BlockSet> SlabSummary<D> {
    /// Computes the shift quantizing free-block counts for a slab with
    /// `slab_data_blocks` data blocks into the 7-bit hint.
    fn compute_hint_shift(slab_data_blocks: u64) -> u32 {
        (64 - u64::leading_zeros(slab_data_blocks)).saturating_sub(FULLNESS_BITS)
    }

    /// The number of blocks needed to persist `slab_count` entries.
    pub fn saved_blocks(slab_count: u64) -> u64 {
        (slab_count * 2).div_ceil(BLOCK_SIZE as u64).max(1)
    }

    /// Creates an all-clean, all-empty summary for `slab_count` slabs.
    pub fn format(storage: D, slab_count: u64, slab_data_blocks: u64) -> Result<Self> {
        let hint_shift = Self::compute_hint_shift(slab_data_blocks);
        let mut summary = Self {
            storage,
            entries: vec![SlabSummaryEntry::default(); slab_count as usize],
            hint_shift,
        };
        for index in 0..slab_count {
            summary.entries[index as usize] = SlabSummaryEntry {
                tail_block_offset: 0,
                fullness_hint: (slab_data_blocks >> hint_shift) as u8,
                is_clean: true,
            };
        }
        summary.save()?;
        Ok(summary)
    }

    /// Loads a summary previously written by [`SlabSummary::save`].
    pub fn load(storage: D, slab_count: u64, slab_data_blocks: u64) -> Result<Self> {
        let blocks = Self::saved_blocks(slab_count);
        let mut buf = Buf::alloc(blocks as usize)?;
        storage.read(0, buf.as_mut())?;

        let mut entries = Vec::with_capacity(slab_count as usize);
        for index in 0..slab_count as usize {
            let bytes = [buf.as_slice()[index * 2], buf.as_slice()[index * 2 + 1]];
            entries.push(SlabSummaryEntry::unpack(bytes));
        }
        Ok(Self {
            storage,
            entries,
            hint_shift: Self::compute_hint_shift(slab_data_blocks),
        })
    }

    /// Persists the whole table.
    pub fn save(&mut self) -> Result<()> {
        let blocks = Self::saved_blocks(self.entries.len() as u64);
        let mut buf = Buf::alloc(blocks as usize)?;
        for (index, entry) in self.entries.iter().enumerate() {
            buf.as_mut_slice()[index * 2..index * 2 + 2].copy_from_slice(&entry.pack());
        }
        self.storage.write(0, buf.as_ref())?;
        self.storage.flush()
    }

    /// Returns the entry for `slab_index`.
    pub fn get(&self, slab_index: u64) -> SlabSummaryEntry {
        self.entries[slab_index as usize]
    }

    /// Quantizes a free-block count into the stored hint.
    pub fn fullness_hint(&self, free_blocks: u64) -> u8 {
        (free_blocks >> self.hint_shift) as u8
    }

    /// Updates and persists the entry for `slab_index`.
    pub fn update(
        &mut self,
        slab_index: u64,
        tail_block_offset: u8,
        is_clean: bool,
        free_blocks: u64,
    ) -> Result<()> {
        self.entries[slab_index as usize] = SlabSummaryEntry {
            tail_block_offset,
            fullness_hint: self.fullness_hint(free_blocks),
            is_clean,
        };
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::{SlabSummary, SlabSummaryEntry};
    use crate::layers::bio::MemDisk;

    #[test]
    fn entry_pack_roundtrip() {
        let entry = SlabSummaryEntry {
            tail_block_offset: 7,
            fullness_hint: 0x55,
            is_clean: true,
        };
        assert_eq!(SlabSummaryEntry::unpack(entry.pack()), entry);
    }

    #[test]
    fn format_load_update() {
        let disk = MemDisk::create(2).unwrap();
        let mut summary = SlabSummary::format(disk.clone(), 3, 1 << 20).unwrap();
        assert!(summary.get(0).is_clean);

        summary.update(1, 5, false, 1000).unwrap();

        let reloaded = SlabSummary::load(disk, 3, 1 << 20).unwrap();
        let entry = reloaded.get(1);
        assert_eq!(entry.tail_block_offset, 5);
        assert!(!entry.is_clean);
        assert_eq!(entry.fullness_hint, reloaded.fullness_hint(1000));
        assert!(reloaded.get(2).is_clean);
    }
}
