// SPDX-License-Identifier: MPL-2.0

use std::io::{Read, Write};

use libflate::deflate::{Decoder, Encoder};

use super::data_vio::DataVio;
use crate::{
    layers::{
        bio::{Buf, BLOCK_SIZE},
        journal::COMPRESSED_SLOTS_PER_BLOCK,
    },
    prelude::*,
};

/// The compressed block header: one little-endian u16 size per slot.
pub const COMPRESSED_BLOCK_HEADER_SIZE: usize = 2 * COMPRESSED_SLOTS_PER_BLOCK as usize;

/// The payload bytes available to fragments in one compressed block.
pub const COMPRESSED_BLOCK_PAYLOAD: usize = BLOCK_SIZE - COMPRESSED_BLOCK_HEADER_SIZE;

/// A fragment is only worth packing if at least two of its size share a
/// block.
pub const MAX_COMPRESSED_FRAGMENT: usize = COMPRESSED_BLOCK_PAYLOAD / 2;

/// Deflates a data block; `None` when the result is too large to pack.
pub fn compress_block(data: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut encoder = Encoder::new(Vec::new());
    encoder
        .write_all(data)
        .map_err(|_| Error::with_msg(IoFailed, "deflate failed"))?;
    let compressed = encoder
        .finish()
        .into_result()
        .map_err(|_| Error::with_msg(IoFailed, "deflate failed"))?;
    Ok((compressed.len() <= MAX_COMPRESSED_FRAGMENT).then_some(compressed))
}

/// Inflates one fragment back into a full data block.
pub fn decompress_fragment(fragment: &[u8]) -> Result<Buf> {
    let mut decoder = Decoder::new(fragment);
    let mut data = Vec::with_capacity(BLOCK_SIZE);
    decoder
        .read_to_end(&mut data)
        .map_err(|_| Error::with_msg(IoFailed, "inflate failed"))?;
    if data.len() != BLOCK_SIZE {
        return_errno_with_msg!(IoFailed, "compressed fragment inflated to the wrong size");
    }
    let mut buf = Buf::alloc(1)?;
    buf.as_mut_slice().copy_from_slice(&data);
    Ok(buf)
}

/// One write waiting in the packer with its deflated payload.
pub struct PackedFragment {
    pub vio: DataVio,
    pub compressed: Vec<u8>,
}

/// A bin sealed for writing: up to 14 fragments bound for one physical
/// block.
pub struct SealedBin {
    pub fragments: Vec<PackedFragment>,
}

impl SealedBin {
    pub fn fragment_count(&self) -> u8 {
        self.fragments.len() as u8
    }

    /// Lays the bin out as one block: the per-slot size table followed by
    /// the concatenated fragments.
    pub fn encode_block(&self) -> Result<Buf> {
        let mut buf = Buf::alloc(1)?;
        let block = buf.as_mut_slice();
        let mut offset = COMPRESSED_BLOCK_HEADER_SIZE;
        for (slot, fragment) in self.fragments.iter().enumerate() {
            let size = fragment.compressed.len();
            block[slot * 2..slot * 2 + 2].copy_from_slice(&(size as u16).to_le_bytes());
            block[offset..offset + size].copy_from_slice(&fragment.compressed);
            offset += size;
        }
        Ok(buf)
    }
}

/// Extracts fragment `slot` from an encoded compressed block.
pub fn extract_fragment(block: &[u8], slot: u8) -> Result<&[u8]> {
    if slot >= COMPRESSED_SLOTS_PER_BLOCK {
        return_errno_with_msg!(InvalidArgs, "compressed slot out of range");
    }
    let size_at = |index: usize| -> usize {
        u16::from_le_bytes([block[index * 2], block[index * 2 + 1]]) as usize
    };
    let mut offset = COMPRESSED_BLOCK_HEADER_SIZE;
    for index in 0..usize::from(slot) {
        offset += size_at(index);
    }
    let size = size_at(usize::from(slot));
    if size == 0 || offset + size > BLOCK_SIZE {
        return_errno_with_msg!(BadState, "compressed block slot table corrupt");
    }
    Ok(&block[offset..offset + size])
}

/// The packer: coalesces compressible writes into shared physical
/// blocks. Owned by the packer zone.
pub struct Packer {
    bin: Vec<PackedFragment>,
    bin_bytes: usize,
    fragments_packed: u64,
    bins_written: u64,
}

impl Packer {
    pub fn new() -> Self {
        Self {
            bin: Vec::new(),
            bin_bytes: 0,
            fragments_packed: 0,
            bins_written: 0,
        }
    }

    /// The number of fragments waiting in the open bin.
    pub fn pending(&self) -> usize {
        self.bin.len()
    }

    pub fn fragments_packed(&self) -> u64 {
        self.fragments_packed
    }

    pub fn bins_written(&self) -> u64 {
        self.bins_written
    }

    fn seal(&mut self) -> Option<SealedBin> {
        if self.bin.is_empty() {
            return None;
        }
        self.bin_bytes = 0;
        self.bins_written += 1;
        Some(SealedBin {
            fragments: core::mem::take(&mut self.bin),
        })
    }

    /// Adds a fragment to the open bin. Returns a sealed bin when this
    /// fragment forced the previous bin shut (it no longer fit) or
    /// filled the bin to its last slot.
    pub fn add(&mut self, vio: DataVio, compressed: Vec<u8>) -> Option<SealedBin> {
        debug_assert!(compressed.len() <= MAX_COMPRESSED_FRAGMENT);
        let sealed = if self.bin_bytes + compressed.len() > COMPRESSED_BLOCK_PAYLOAD {
            self.seal()
        } else {
            None
        };

        self.bin_bytes += compressed.len();
        self.fragments_packed += 1;
        self.bin.push(PackedFragment { vio, compressed });

        if self.bin.len() == usize::from(COMPRESSED_SLOTS_PER_BLOCK) {
            return self.seal().or(sealed);
        }
        sealed
    }

    /// Seals the open bin regardless of fullness (flush, suspend).
    pub fn flush(&mut self) -> Option<SealedBin> {
        self.seal()
    }
}

impl Default for Packer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        compress_block, decompress_fragment, extract_fragment, Packer, COMPRESSED_SLOTS_PER_BLOCK,
    };
    use crate::layers::{
        bio::{Buf, BLOCK_SIZE},
        device::{DataVio, IoDescriptor, IoFlags, VioOp},
    };

    fn vio_stub(lbn: u64) -> DataVio {
        let mut data = Buf::alloc(1).unwrap();
        data.as_mut_slice().fill(lbn as u8);
        DataVio::new(IoDescriptor {
            op: VioOp::Write,
            lbn,
            data: Some(data),
            flags: IoFlags::empty(),
            completion: Box::new(|_result| ()),
        })
    }

    #[test]
    fn compress_decompress_roundtrip() {
        // Repetitive data deflates well.
        let data = vec![0x55u8; BLOCK_SIZE];
        let compressed = compress_block(&data).unwrap().expect("must compress");
        assert!(compressed.len() < BLOCK_SIZE / 2);

        let inflated = decompress_fragment(&compressed).unwrap();
        assert_eq!(inflated.as_slice(), &data[..]);
    }

    #[test]
    fn bin_seals_at_slot_limit() {
        let mut packer = Packer::new();
        let fragment = compress_block(&vec![7u8; BLOCK_SIZE]).unwrap().unwrap();

        let mut sealed = None;
        for lbn in 0..u64::from(COMPRESSED_SLOTS_PER_BLOCK) {
            assert!(sealed.is_none());
            sealed = packer.add(vio_stub(lbn), fragment.clone());
        }
        let bin = sealed.expect("the 14th fragment seals the bin");
        assert_eq!(bin.fragment_count(), COMPRESSED_SLOTS_PER_BLOCK);
        assert_eq!(packer.pending(), 0);
    }

    #[test]
    fn sealed_block_roundtrips_fragments() {
        let mut packer = Packer::new();
        for lbn in 0..3u64 {
            let data = vec![lbn as u8 + 1; BLOCK_SIZE];
            let fragment = compress_block(&data).unwrap().unwrap();
            assert!(packer.add(vio_stub(lbn), fragment).is_none());
        }
        let bin = packer.flush().expect("a partial bin flushes");
        assert_eq!(bin.fragment_count(), 3);

        let block = bin.encode_block().unwrap();
        for slot in 0..3u8 {
            let fragment = extract_fragment(block.as_slice(), slot).unwrap();
            let inflated = decompress_fragment(fragment).unwrap();
            assert!(inflated.as_slice().iter().all(|&byte| byte == slot + 1));
        }
        assert!(extract_fragment(block.as_slice(), 3).is_err());
        assert!(extract_fragment(block.as_slice(), 14).is_err());
    }
}
