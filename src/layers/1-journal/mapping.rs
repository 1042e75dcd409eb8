// SPDX-License-Identifier: MPL-2.0

use crate::{
    layers::bio::{Pbn, MAX_BLOCK_ID, ZERO_BLOCK},
    prelude::*,
};

/// The number of compressed fragments that fit in one physical block.
pub const COMPRESSED_SLOTS_PER_BLOCK: u8 = 14;

/// How a logical block is mapped, as stored in a block-map leaf.
///
/// The on-disk encoding is a 4-bit state nibble: 0 is unmapped, 1 is an
/// uncompressed mapping, and 2..=15 are the 14 compressed-fragment slots.
/// A zero block is an uncompressed mapping to the reserved [`ZERO_BLOCK`]
/// address; it is decoded as its own variant so callers never treat it as
/// a real physical location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingState {
    /// No mapping exists.
    Unmapped,
    /// The logical block is all zeros; no physical block is referenced.
    ZeroBlock,
    /// Mapped to a whole physical block.
    Uncompressed,
    /// Mapped to compressed fragment `slot` (0..14) of a physical block.
    Compressed(u8),
}

impl MappingState {
    /// Encodes the state as its 4-bit nibble.
    pub fn to_nibble(self) -> u8 {
        match self {
            MappingState::Unmapped => 0,
            MappingState::ZeroBlock | MappingState::Uncompressed => 1,
            MappingState::Compressed(slot) => 2 + slot,
        }
    }

    fn from_nibble(nibble: u8, pbn: Pbn) -> Result<Self> {
        match nibble {
            0 => Ok(MappingState::Unmapped),
            1 if pbn == ZERO_BLOCK => Ok(MappingState::ZeroBlock),
            1 => Ok(MappingState::Uncompressed),
            2..=15 => Ok(MappingState::Compressed(nibble - 2)),
            _ => Err(Error::with_msg(InvalidArgs, "mapping state out of range")),
        }
    }

    /// Returns whether the state maps to a real physical block that holds
    /// a reference count.
    pub fn is_counted(self) -> bool {
        matches!(
            self,
            MappingState::Uncompressed | MappingState::Compressed(_)
        )
    }

    /// Returns whether the state carries compressed data.
    pub fn is_compressed(self) -> bool {
        matches!(self, MappingState::Compressed(_))
    }
}

/// A (physical block, state) pair: one entry of a block-map leaf.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockMapEntry {
    pub pbn: Pbn,
    pub state: MappingState,
}

impl BlockMapEntry {
    /// The absent mapping.
    pub const UNMAPPED: BlockMapEntry = BlockMapEntry {
        pbn: ZERO_BLOCK,
        state: MappingState::Unmapped,
    };

    /// The all-zeros mapping.
    pub const ZERO: BlockMapEntry = BlockMapEntry {
        pbn: ZERO_BLOCK,
        state: MappingState::ZeroBlock,
    };

    /// Creates an uncompressed mapping to `pbn`.
    pub fn uncompressed(pbn: Pbn) -> Self {
        Self {
            pbn,
            state: MappingState::Uncompressed,
        }
    }

    /// Creates a compressed mapping to fragment `slot` of `pbn`.
    pub fn compressed(pbn: Pbn, slot: u8) -> Self {
        debug_assert!(slot < COMPRESSED_SLOTS_PER_BLOCK);
        Self {
            pbn,
            state: MappingState::Compressed(slot),
        }
    }

    /// Returns whether any mapping exists (including the zero block).
    pub fn is_mapped(&self) -> bool {
        self.state != MappingState::Unmapped
    }

    /// Packs the entry into a little-endian u64: the physical block number
    /// in bits 0..47 and the state nibble in bits 48..51.
    pub fn pack(&self) -> u64 {
        debug_assert!(self.pbn <= MAX_BLOCK_ID);
        (self.pbn & MAX_BLOCK_ID) | (u64::from(self.state.to_nibble()) << 48)
    }

    /// Unpacks an entry packed by [`BlockMapEntry::pack`], rejecting
    /// encodings with bits set beyond the state nibble.
    pub fn unpack(packed: u64) -> Result<Self> {
        if packed >> 52 != 0 {
            return_errno_with_msg!(InvalidArgs, "block map entry has nonzero reserved bits");
        }
        let pbn = packed & MAX_BLOCK_ID;
        let state = MappingState::from_nibble((packed >> 48) as u8, pbn)?;
        Ok(Self { pbn, state })
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockMapEntry, MappingState, COMPRESSED_SLOTS_PER_BLOCK};
    use crate::layers::bio::ZERO_BLOCK;

    #[test]
    fn nibble_encoding_covers_all_states() {
        assert_eq!(MappingState::Unmapped.to_nibble(), 0);
        assert_eq!(MappingState::Uncompressed.to_nibble(), 1);
        assert_eq!(MappingState::ZeroBlock.to_nibble(), 1);
        for slot in 0..COMPRESSED_SLOTS_PER_BLOCK {
            assert_eq!(MappingState::Compressed(slot).to_nibble(), 2 + slot);
        }
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let entries = [
            BlockMapEntry::UNMAPPED,
            BlockMapEntry::ZERO,
            BlockMapEntry::uncompressed(0x0000_4afe_dead_beef),
            BlockMapEntry::compressed(42, 0),
            BlockMapEntry::compressed(42, COMPRESSED_SLOTS_PER_BLOCK - 1),
        ];
        for entry in entries {
            assert_eq!(BlockMapEntry::unpack(entry.pack()).unwrap(), entry);
        }
    }

    #[test]
    fn zero_block_decodes_as_zero() {
        let packed = BlockMapEntry::uncompressed(ZERO_BLOCK).pack();
        let entry = BlockMapEntry::unpack(packed).unwrap();
        assert_eq!(entry.state, MappingState::ZeroBlock);
        assert!(entry.is_mapped());
        assert!(!entry.state.is_counted());
    }

    #[test]
    fn reserved_bits_rejected() {
        assert!(BlockMapEntry::unpack(1 << 52).is_err());
        assert!(BlockMapEntry::unpack(u64::MAX).is_err());
    }
}
