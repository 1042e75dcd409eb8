// SPDX-License-Identifier: MPL-2.0

//! The layer of untrusted block I/O.

mod block_buf;
mod block_set;

use static_assertions::const_assert;

pub use self::{
    block_buf::{Buf, BufMut, BufRef},
    block_set::{BlockSet, MemDisk},
};

/// An index of a block on a block device.
pub type BlockId = u64;

/// A physical block number: an index into the backing device.
///
/// Only the low 48 bits are representable in the on-disk formats.
pub type Pbn = BlockId;

/// A logical block number: an index into the virtual device the host sees.
pub type Lbn = u64;

pub const BLOCK_SIZE: usize = 0x1000;

/// The reserved physical block number standing for "a block of zeros".
///
/// No data block is ever allocated at this address and it carries no
/// reference count.
pub const ZERO_BLOCK: Pbn = 0;

/// The highest block number representable in the packed on-disk formats.
pub const MAX_BLOCK_ID: BlockId = (1 << 48) - 1;

// The packed formats assume block numbers fit 48 bits.
const_assert!(MAX_BLOCK_ID < u64::MAX);
