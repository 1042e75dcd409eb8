// SPDX-License-Identifier: MPL-2.0

//! A block-virtualization engine providing inline deduplication and thin
//! provisioning at 4 KiB block granularity.
//!
//! The host reads and writes *logical* blocks; the engine maps them to
//! *physical* blocks on an injected [`BlockSet`], sharing physical blocks
//! whose content is identical and reference-counting each physical block
//! so sharing and reclamation stay safe across crashes.

#![allow(dead_code, unused_imports)]

mod error;
mod layers;
mod os;
mod prelude;
mod util;
mod zone;

pub use self::{
    error::{Errno, Error},
    layers::{
        bio::{BlockId, BlockSet, Buf, BufMut, BufRef, Lbn, MemDisk, Pbn, BLOCK_SIZE, ZERO_BLOCK},
        dedupe::{ChunkName, DedupeAdvice, IndexAction, IndexOutcome, IndexRequest},
        device::{
            DeviceConfig, DeviceStats, Disk, IoDescriptor, IoFlags, ThreadCountConfig, Vdo, VioOp,
        },
    },
};
