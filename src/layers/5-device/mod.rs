// SPDX-License-Identifier: MPL-2.0

//! The device layer: data-vio state machines, the packer, admin
//! orchestration, and the `Vdo` device itself.

mod admin;
mod config;
mod data_vio;
mod packer;
mod read_only;
mod super_block;
mod vdo;

pub use self::{
    admin::{AdminState, AdminStateMachine, SuspendPhase},
    config::{DeviceConfig, ThreadCountConfig},
    data_vio::{DataVio, DataVioPool, DeviceStats, IoCompletion, IoDescriptor, IoFlags, VioOp},
    packer::{
        compress_block, decompress_fragment, extract_fragment, PackedFragment, Packer, SealedBin,
        COMPRESSED_BLOCK_HEADER_SIZE, MAX_COMPRESSED_FRAGMENT,
    },
    read_only::{ReadOnlyNotifier, RecordOutcome},
    super_block::{
        DeviceGeometry, SuperBlock, SuperBlockPayload, SUPER_VERSION_CURRENT,
        SUPER_VERSION_MAXIMUM, SUPER_VERSION_MINIMUM,
    },
    vdo::{Disk, Vdo},
};
