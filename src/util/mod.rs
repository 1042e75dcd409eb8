// SPDX-License-Identifier: MPL-2.0

//! Utility types.

mod bitmap;
mod wait_queue;

pub use self::{
    bitmap::BitMap,
    wait_queue::{WaitQueue, Waiter},
};
