// SPDX-License-Identifier: MPL-2.0

use core::cmp::Ordering;

/// A total-ordered position within a journal: the sequence number of a
/// journal block and the index of an entry within it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct JournalPoint {
    pub sequence_number: u64,
    pub entry_count: u16,
}

impl JournalPoint {
    /// The packed representation is a little-endian u64 with the sequence
    /// number in bits 16..63 and the entry count in bits 0..15.
    pub fn pack(&self) -> u64 {
        (self.sequence_number << 16) | u64::from(self.entry_count)
    }

    /// Unpacks a point packed by [`JournalPoint::pack`].
    pub fn unpack(packed: u64) -> Self {
        Self {
            sequence_number: packed >> 16,
            entry_count: (packed & 0xffff) as u16,
        }
    }

    /// Encodes the point as 8 little-endian bytes.
    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.pack().to_le_bytes()
    }

    /// Decodes a point from 8 little-endian bytes.
    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self::unpack(u64::from_le_bytes(bytes))
    }

    /// Advances to the next entry slot within the same block.
    pub fn advance(&mut self) {
        self.entry_count += 1;
    }

    /// Returns whether the point addresses a real entry (sequence 0 is
    /// reserved and never journaled).
    pub fn is_valid(&self) -> bool {
        self.sequence_number > 0
    }

    /// Returns whether `self` strictly precedes `other`.
    pub fn before(&self, other: &JournalPoint) -> bool {
        self < other
    }
}

impl PartialOrd for JournalPoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for JournalPoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence_number
            .cmp(&other.sequence_number)
            .then(self.entry_count.cmp(&other.entry_count))
    }
}

#[cfg(test)]
mod tests {
    use super::JournalPoint;

    #[test]
    fn pack_unpack_roundtrip() {
        let points = [
            JournalPoint {
                sequence_number: 0,
                entry_count: 0,
            },
            JournalPoint {
                sequence_number: 1,
                entry_count: 0xffff,
            },
            JournalPoint {
                sequence_number: 0x0000_7fff_ffff_ffff,
                entry_count: 311,
            },
        ];
        for point in points {
            assert_eq!(JournalPoint::unpack(point.pack()), point);
            assert_eq!(JournalPoint::from_le_bytes(point.to_le_bytes()), point);
        }
    }

    #[test]
    fn packed_layout() {
        let point = JournalPoint {
            sequence_number: 2,
            entry_count: 3,
        };
        assert_eq!(point.pack(), (2 << 16) | 3);
        assert_eq!(point.to_le_bytes()[0], 3);
    }

    #[test]
    fn strict_total_order() {
        let a = JournalPoint {
            sequence_number: 1,
            entry_count: 5,
        };
        let b = JournalPoint {
            sequence_number: 2,
            entry_count: 0,
        };
        let mut c = a;
        c.advance();

        assert!(a.before(&b));
        assert!(a.before(&c));
        assert!(c.before(&b));
        assert!(!a.before(&a));
    }
}
