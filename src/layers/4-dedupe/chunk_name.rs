// SPDX-License-Identifier: MPL-2.0

use core::fmt;

use serde::{Deserialize, Serialize};

/// The size in bytes of a chunk name (content fingerprint).
pub const CHUNK_NAME_SIZE: usize = 16;

/// A 16-byte content fingerprint of one 4 KiB block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkName(pub [u8; CHUNK_NAME_SIZE]);

impl ChunkName {
    /// Computes the fingerprint of a data block.
    pub fn of(data: &[u8]) -> Self {
        let (h1, h2) = murmur3_x64_128(data, 0x6c62_6f6b_6465_6475);
        let mut bytes = [0u8; CHUNK_NAME_SIZE];
        bytes[0..8].copy_from_slice(&h1.to_le_bytes());
        bytes[8..16].copy_from_slice(&h2.to_le_bytes());
        Self(bytes)
    }

    /// Routes the name to one of `zone_count` hash zones by its low bits.
    pub fn zone_of(&self, zone_count: u32) -> u32 {
        debug_assert!(zone_count > 0);
        u32::from(self.0[0]) % zone_count
    }

    /// The probe start position in a hash table of `slot_count` slots.
    pub fn hash_slot(&self, slot_count: usize) -> usize {
        debug_assert!(slot_count.is_power_of_two());
        (u64::from_le_bytes(self.0[8..16].try_into().unwrap()) as usize) & (slot_count - 1)
    }
}

impl fmt::Debug for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// MurmurHash3 for the x64 platform, 128-bit variant.
fn murmur3_x64_128(data: &[u8], seed: u64) -> (u64, u64) {
    const C1: u64 = 0x87c3_7b91_1142_53d5;
    const C2: u64 = 0x4cf5_ad43_2745_937f;

    let mut h1 = seed;
    let mut h2 = seed;
    let nblocks = data.len() / 16;

    for block in 0..nblocks {
        let offset = block * 16;
        let mut k1 = u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap());
        let mut k2 = u64::from_le_bytes(data[offset + 8..offset + 16].try_into().unwrap());

        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1
            .rotate_left(27)
            .wrapping_add(h2)
            .wrapping_mul(5)
            .wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2
            .rotate_left(31)
            .wrapping_add(h1)
            .wrapping_mul(5)
            .wrapping_add(0x3849_5ab5);
    }

    let tail = &data[nblocks * 16..];
    let mut k1 = 0u64;
    let mut k2 = 0u64;
    for (index, &byte) in tail.iter().enumerate() {
        if index < 8 {
            k1 |= u64::from(byte) << (8 * index);
        } else {
            k2 |= u64::from(byte) << (8 * (index - 8));
        }
    }
    if !tail.is_empty() {
        if tail.len() > 8 {
            k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
            h2 ^= k2;
        }
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u64;
    h2 ^= data.len() as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    (h1, h2)
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}
