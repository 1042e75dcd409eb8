// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::{
    layers::{
        bio::{BlockSet, Buf, Pbn},
        bmap::BlockMapState,
        depot::DepotState,
        journal::RecoveryJournalState,
    },
    prelude::*,
};

/// The oldest super-block version this build can read.
pub const SUPER_VERSION_MINIMUM: u32 = 1;
/// The version this build writes. Versions 3 and later use native-endian
/// chapter index headers in the dedupe region.
pub const SUPER_VERSION_CURRENT: u32 = 3;
/// The newest super-block version this build can read.
pub const SUPER_VERSION_MAXIMUM: u32 = 7;

const SUPER_BLOCK_MAGIC: u32 = 0x5644_4f30; // "VDO0"

/// The layout of the backing device, fixed at format time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGeometry {
    pub physical_blocks: u64,
    pub logical_blocks: u64,
    /// First block of the recovery journal region.
    pub journal_origin: Pbn,
    pub journal_blocks: u64,
    /// First block of the slab summary region.
    pub summary_origin: Pbn,
    pub summary_blocks: u64,
    /// First block of the block-map root region.
    pub root_origin: Pbn,
    pub root_count: u32,
}

/// Everything the super block persists besides its fixed header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperBlockPayload {
    pub nonce: u64,
    pub geometry: DeviceGeometry,
    /// Set by a clean shutdown, cleared while the device is in use. An
    /// unclean payload sends the next load through recovery.
    pub clean_shutdown: bool,
    pub recovery_count: u8,
    /// Recovery-journal component state 7.0, in its packed form.
    pub journal_state: [u8; RecoveryJournalState::ENCODED_SIZE],
    pub depot_state: DepotState,
    pub block_map_state: BlockMapState,
}

impl SuperBlockPayload {
    pub fn journal_state(&self) -> Result<RecoveryJournalState> {
        RecoveryJournalState::decode(&self.journal_state)
    }

    pub fn set_journal_state(&mut self, state: &RecoveryJournalState) {
        self.journal_state = state.encode();
    }
}

/// Reads and writes the super block at block zero.
///
/// The fixed header is packed little-endian:
/// `[magic: u32][version: u32][payload_len: u32][reserved: u32]`,
/// followed by the postcard-serialized payload.
pub struct SuperBlock;

impl SuperBlock {
    /// Persists `payload` with the current version.
    pub fn save<D: BlockSet>(storage: &D, payload: &SuperBlockPayload) -> Result<()> {
        Self::save_version(storage, payload, SUPER_VERSION_CURRENT)
    }

    /// Persists `payload` with an explicit version (tests exercise the
    /// acceptance boundaries).
    pub fn save_version<D: BlockSet>(
        storage: &D,
        payload: &SuperBlockPayload,
        version: u32,
    ) -> Result<()> {
        let mut buf = Buf::alloc(1)?;
        let block = buf.as_mut_slice();
        block[0..4].copy_from_slice(&SUPER_BLOCK_MAGIC.to_le_bytes());
        block[4..8].copy_from_slice(&version.to_le_bytes());

        let serialized = postcard::to_allocvec(payload)
            .map_err(|_| Error::with_msg(IoFailed, "serialize super block payload failed"))?;
        if serialized.len() > block.len() - 16 {
            return_errno_with_msg!(IoFailed, "super block payload too large");
        }
        block[8..12].copy_from_slice(&(serialized.len() as u32).to_le_bytes());
        block[16..16 + serialized.len()].copy_from_slice(&serialized);

        storage.write(0, buf.as_ref())?;
        storage.flush()
    }

    /// Loads and validates the super block.
    pub fn load<D: BlockSet>(storage: &D) -> Result<SuperBlockPayload> {
        let mut buf = Buf::alloc(1)?;
        storage.read(0, buf.as_mut())?;
        let block = buf.as_slice();

        let magic = u32::from_le_bytes(block[0..4].try_into().unwrap());
        if magic != SUPER_BLOCK_MAGIC {
            return_errno_with_msg!(BadState, "super block magic mismatch");
        }
        let version = u32::from_le_bytes(block[4..8].try_into().unwrap());
        if !(SUPER_VERSION_MINIMUM..=SUPER_VERSION_MAXIMUM).contains(&version) {
            return_errno_with_msg!(Unsupported, "unsupported super block version");
        }
        let payload_len = u32::from_le_bytes(block[8..12].try_into().unwrap()) as usize;
        if payload_len > block.len() - 16 {
            return_errno_with_msg!(BadState, "super block payload length corrupt");
        }

        postcard::from_bytes(&block[16..16 + payload_len])
            .map_err(|_| Error::with_msg(BadState, "super block payload corrupt"))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DeviceGeometry, SuperBlock, SuperBlockPayload, SUPER_VERSION_CURRENT,
        SUPER_VERSION_MAXIMUM, SUPER_VERSION_MINIMUM,
    };
    use crate::layers::{
        bio::MemDisk, bmap::BlockMapState, depot::DepotState, journal::RecoveryJournalState,
    };

    fn payload() -> SuperBlockPayload {
        let mut payload = SuperBlockPayload {
            nonce: 0x1122_3344,
            geometry: DeviceGeometry {
                physical_blocks: 1000,
                logical_blocks: 5000,
                journal_origin: 1,
                journal_blocks: 16,
                summary_origin: 17,
                summary_blocks: 1,
                root_origin: 18,
                root_count: 2,
            },
            clean_shutdown: true,
            recovery_count: 0,
            journal_state: [0; RecoveryJournalState::ENCODED_SIZE],
            depot_state: DepotState {
                origin: 20,
                slab_blocks: 64,
                slab_count: 15,
            },
            block_map_state: BlockMapState {
                root_origin: 18,
                root_count: 2,
                height: 2,
            },
        };
        payload.set_journal_state(&RecoveryJournalState {
            journal_start: 7,
            logical_blocks_used: 3,
            block_map_data_blocks: 1,
        });
        payload
    }

    #[test]
    fn save_load_roundtrip() {
        let disk = MemDisk::create(4).unwrap();
        let original = payload();
        SuperBlock::save(&disk, &original).unwrap();
        let loaded = SuperBlock::load(&disk).unwrap();
        assert_eq!(loaded, original);
        assert_eq!(loaded.journal_state().unwrap().journal_start, 7);
    }

    #[test]
    fn version_boundaries() {
        let disk = MemDisk::create(4).unwrap();
        for version in [SUPER_VERSION_MINIMUM, SUPER_VERSION_CURRENT, SUPER_VERSION_MAXIMUM] {
            SuperBlock::save_version(&disk, &payload(), version).unwrap();
            assert!(SuperBlock::load(&disk).is_ok());
        }
        for version in [0, SUPER_VERSION_MAXIMUM + 1] {
            SuperBlock::save_version(&disk, &payload(), version).unwrap();
            assert!(SuperBlock::load(&disk).is_err());
        }
    }

    #[test]
    fn garbage_is_rejected() {
        let disk = MemDisk::create(4).unwrap();
        assert!(SuperBlock::load(&disk).is_err());
    }
}
