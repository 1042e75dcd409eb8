// SPDX-License-Identifier: MPL-2.0

use bittle::{Bits, BitsMut};
use serde::{Deserialize, Serialize};

use crate::os::Vec;

/// A compact array of bits.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BitMap {
    bits: Vec<u64>,
    nbits: usize,
}

impl BitMap {
    /// Creates a new `BitMap` by repeating the `value` for the desired length.
    pub fn repeat(value: bool, nbits: usize) -> Self {
        let vec_len = nbits.div_ceil(64);
        let mut bits = Vec::with_capacity(vec_len);
        if value {
            bits.resize(vec_len, !0u64);
        } else {
            bits.resize(vec_len, 0u64);
        }

        // Clear the unused bits in the last u64.
        if value && nbits % 64 != 0 {
            for index in (nbits % 64)..64 {
                bits[vec_len - 1].clear_bit(index as u32);
            }
        }

        Self { bits, nbits }
    }

    /// Returns the total number of bits.
    pub fn len(&self) -> usize {
        self.nbits
    }

    /// Returns whether the map holds no bits.
    pub fn is_empty(&self) -> bool {
        self.nbits == 0
    }

    fn check_index(&self, index: usize) {
        if index >= self.len() {
            panic!(
                "bitmap index {} is out of range, total bits {}",
                index, self.nbits,
            );
        }
    }

    /// Tests if the given bit is set.
    ///
    /// # Panics
    ///
    /// The `index` must be within the total number of bits. Otherwise, this
    /// method panics.
    pub fn test_bit(&self, index: usize) -> bool {
        self.check_index(index);
        self.bits.test_bit(index as u32)
    }

    /// Sets the given bit to the given value.
    ///
    /// # Panics
    ///
    /// The `index` must be within the total number of bits. Otherwise, this
    /// method panics.
    pub fn set(&mut self, index: usize, value: bool) {
        self.check_index(index);
        if value {
            self.bits.set_bit(index as u32);
        } else {
            self.bits.clear_bit(index as u32);
        }
    }

    /// Finds the index of the first one bit at or after `from`.
    pub fn first_one(&self, from: usize) -> Option<usize> {
        if from >= self.nbits {
            return None;
        }
        self.bits
            .iter_ones()
            .map(|index| index as usize)
            .find(|&index| index >= from)
    }

    /// Finds the index of the first zero bit at or after `from`.
    pub fn first_zero(&self, from: usize) -> Option<usize> {
        if from >= self.nbits {
            return None;
        }
        self.bits
            .iter_zeros()
            .map(|index| index as usize)
            .find(|&index| index >= from && index < self.nbits)
    }

    /// Returns the total number of one bits.
    pub fn count_ones(&self) -> usize {
        self.bits.count_ones() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::BitMap;

    #[test]
    fn repeat_and_count() {
        let map = BitMap::repeat(true, 70);
        assert_eq!(map.len(), 70);
        assert_eq!(map.count_ones(), 70);

        let map = BitMap::repeat(false, 70);
        assert_eq!(map.count_ones(), 0);
    }

    #[test]
    fn search() {
        let mut map = BitMap::repeat(false, 130);
        map.set(3, true);
        map.set(68, true);

        assert_eq!(map.first_one(0), Some(3));
        assert_eq!(map.first_one(4), Some(68));
        assert_eq!(map.first_one(69), None);
        assert_eq!(map.first_zero(3), Some(4));
        assert!(map.test_bit(68));

        map.set(68, false);
        assert_eq!(map.first_one(4), None);
    }
}
