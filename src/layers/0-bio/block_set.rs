// SPDX-License-Identifier: MPL-2.0

use core::ops::Range;

use super::{BlockId, BufMut, BufRef, BLOCK_SIZE};
use crate::{os::Mutex, prelude::*};

/// A fixed set of data blocks that can support random reads and writes.
///
/// This is the storage provider injected into the engine: all metadata and
/// data I/O lands on a `BlockSet`.
///
/// # Thread safety
///
/// `BlockSet` is a data structure of interior mutability. It is ok to
/// perform I/O on a `BlockSet` concurrently in multiple threads.
/// `BlockSet` promises the atomicity of reading and writing individual
/// blocks.
pub trait BlockSet: Sync + Send {
    /// Reads one or multiple blocks at a specified position.
    fn read(&self, pos: BlockId, buf: BufMut) -> Result<()>;

    /// Writes one or multiple blocks at a specified position.
    fn write(&self, pos: BlockId, buf: BufRef) -> Result<()>;

    /// Gets a subset of the blocks in the block set.
    fn subset(&self, range: Range<BlockId>) -> Result<Self>
    where
        Self: Sized;

    /// Ensures that blocks are persisted to the disk.
    fn flush(&self) -> Result<()>;

    /// Returns the number of blocks.
    fn nblocks(&self) -> u64;
}

impl<T: BlockSet> BlockSet for Arc<T> {
    fn read(&self, pos: BlockId, buf: BufMut) -> Result<()> {
        (**self).read(pos, buf)
    }

    fn write(&self, pos: BlockId, buf: BufRef) -> Result<()> {
        (**self).write(pos, buf)
    }

    fn subset(&self, range: Range<BlockId>) -> Result<Self> {
        (**self).subset(range).map(Arc::new)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }

    fn nblocks(&self) -> u64 {
        (**self).nblocks()
    }
}

/// A RAM-backed `BlockSet` for tests.
///
/// A handle is a window `[first, first + limit)` onto one shared byte
/// vector; `subset` narrows the window and `clone` aliases it, which is
/// what lets tests "pull the plug" on a device and reopen the same
/// blocks from a fresh engine instance.
#[derive(Clone)]
pub struct MemDisk {
    bytes: Arc<Mutex<Vec<u8>>>,
    first: BlockId,
    limit: u64,
}

impl MemDisk {
    /// Creates a disk of `num_blocks` zeroed blocks.
    pub fn create(num_blocks: u64) -> Result<Self> {
        if num_blocks == 0 {
            return_errno_with_msg!(InvalidArgs, "a disk needs at least one block");
        }
        let bytes = vec![0u8; num_blocks as usize * BLOCK_SIZE];
        Ok(Self {
            bytes: Arc::new(Mutex::new(bytes)),
            first: 0,
            limit: num_blocks,
        })
    }

    /// Maps a block span inside this window to its byte range in the
    /// shared vector, refusing anything past the window's end.
    fn span(&self, pos: BlockId, nblocks: usize) -> Result<Range<usize>> {
        let in_range = pos
            .checked_add(nblocks as u64)
            .is_some_and(|end| end <= self.limit);
        if !in_range {
            return_errno_with_msg!(InvalidArgs, "I/O beyond the addressable window");
        }
        let begin = (self.first + pos) as usize * BLOCK_SIZE;
        Ok(begin..begin + nblocks * BLOCK_SIZE)
    }
}

impl BlockSet for MemDisk {
    fn read(&self, pos: BlockId, mut buf: BufMut) -> Result<()> {
        let span = self.span(pos, buf.nblocks())?;
        buf.as_mut_slice().copy_from_slice(&self.bytes.lock()[span]);
        Ok(())
    }

    fn write(&self, pos: BlockId, buf: BufRef) -> Result<()> {
        let span = self.span(pos, buf.nblocks())?;
        self.bytes.lock()[span].copy_from_slice(buf.as_slice());
        Ok(())
    }

    fn subset(&self, range: Range<BlockId>) -> Result<Self> {
        if range.start > range.end || range.end > self.limit {
            return_errno_with_msg!(InvalidArgs, "subset window out of bounds");
        }
        Ok(Self {
            bytes: self.bytes.clone(),
            first: self.first + range.start,
            limit: range.end - range.start,
        })
    }

    fn flush(&self) -> Result<()> {
        // Memory is as durable as this disk ever gets.
        Ok(())
    }

    fn nblocks(&self) -> u64 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockSet, MemDisk};
    use crate::layers::bio::{Buf, BLOCK_SIZE};

    fn counting_buf(nblocks: usize) -> Buf {
        let mut buf = Buf::alloc(nblocks).unwrap();
        for (offset, byte) in buf.as_mut_slice().iter_mut().enumerate() {
            *byte = (offset % 251) as u8;
        }
        buf
    }

    #[test]
    fn whole_and_windowed_io() {
        let disk = MemDisk::create(10).unwrap();
        assert_eq!(disk.nblocks(), 10);

        let written = counting_buf(2);
        disk.write(7, written.as_ref()).unwrap();

        // A window over the written span reads the same bytes at its
        // own origin.
        let window = disk.subset(7..9).unwrap();
        assert_eq!(window.nblocks(), 2);
        let mut back = Buf::alloc(2).unwrap();
        window.read(0, back.as_mut()).unwrap();
        assert_eq!(back.as_slice(), written.as_slice());

        // Writes through the window land on the parent.
        let mut one = Buf::alloc(1).unwrap();
        one.as_mut_slice().fill(0xc3);
        window.write(1, one.as_ref()).unwrap();
        let mut parent_view = Buf::alloc(1).unwrap();
        disk.read(8, parent_view.as_mut()).unwrap();
        assert_eq!(parent_view.as_slice(), [0xc3; BLOCK_SIZE]);
    }

    #[test]
    fn out_of_window_io_is_refused() {
        let disk = MemDisk::create(4).unwrap();
        let mut buf = Buf::alloc(2).unwrap();
        assert!(disk.read(3, buf.as_mut()).is_err());
        assert!(disk.write(4, buf.as_ref()).is_err());
        assert!(disk.subset(2..5).is_err());
        assert!(MemDisk::create(0).is_err());

        let window = disk.subset(1..3).unwrap();
        assert!(window.read(1, buf.as_mut()).is_err());
        assert!(window.subset(0..3).is_err());
    }

    #[test]
    fn clones_share_storage() {
        let disk = MemDisk::create(6).unwrap();
        let alias = disk.clone();

        let mut stamp = Buf::alloc(1).unwrap();
        stamp.as_mut_slice().fill(0x5a);
        alias.write(2, stamp.as_ref()).unwrap();

        let mut seen = Buf::alloc(1).unwrap();
        disk.read(2, seen.as_mut()).unwrap();
        assert_eq!(seen.as_slice(), stamp.as_slice());
    }
}
