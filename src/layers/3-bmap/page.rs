// SPDX-License-Identifier: MPL-2.0

use static_assertions::const_assert;

use crate::{
    layers::{
        bio::{Buf, Pbn, BLOCK_SIZE},
        journal::BlockMapEntry,
    },
    prelude::*,
};

/// The size in bytes of a tree page header:
/// `[nonce: u64][pbn: u64][reserved: u64 x2]`.
pub const TREE_PAGE_HEADER_SIZE: usize = 32;

/// The number of packed mapping entries per tree page.
pub const ENTRIES_PER_PAGE: u16 = ((BLOCK_SIZE - TREE_PAGE_HEADER_SIZE) / 8) as u16;

const_assert!(ENTRIES_PER_PAGE > 0);

/// One page of a block-map tree, interior or leaf.
///
/// Interior pages store child page pointers encoded as uncompressed
/// mappings (`Unmapped` meaning "all descendants unmapped"); leaf pages
/// store the actual logical-to-physical mappings. The header pins the
/// page to its device (nonce) and its own location (pbn) so a misdirected
/// read cannot masquerade as the requested page.
pub struct TreePage {
    buf: Buf,
}

impl TreePage {
    /// Creates a zeroed page claiming the given location.
    pub fn new_zeroed(nonce: u64, pbn: Pbn) -> Result<Self> {
        let mut buf = Buf::alloc(1)?;
        buf.as_mut_slice()[0..8].copy_from_slice(&nonce.to_le_bytes());
        buf.as_mut_slice()[8..16].copy_from_slice(&pbn.to_le_bytes());
        Ok(Self { buf })
    }

    /// Adopts a loaded block, validating its header.
    pub fn from_loaded(buf: Buf, nonce: u64, pbn: Pbn) -> Result<Self> {
        let page = Self { buf };
        if page.nonce() != nonce {
            return_errno_with_msg!(BadState, "tree page has foreign nonce");
        }
        if page.pbn() != pbn {
            return_errno_with_msg!(BadState, "tree page read from the wrong location");
        }
        Ok(page)
    }

    pub fn nonce(&self) -> u64 {
        u64::from_le_bytes(self.buf.as_slice()[0..8].try_into().unwrap())
    }

    pub fn pbn(&self) -> Pbn {
        u64::from_le_bytes(self.buf.as_slice()[8..16].try_into().unwrap())
    }

    /// Reads the entry at `index`.
    pub fn get_entry(&self, index: u16) -> Result<BlockMapEntry> {
        debug_assert!(index < ENTRIES_PER_PAGE);
        let offset = TREE_PAGE_HEADER_SIZE + usize::from(index) * 8;
        BlockMapEntry::unpack(u64::from_le_bytes(
            self.buf.as_slice()[offset..offset + 8].try_into().unwrap(),
        ))
    }

    /// Writes the entry at `index`.
    pub fn set_entry(&mut self, index: u16, entry: BlockMapEntry) {
        debug_assert!(index < ENTRIES_PER_PAGE);
        let offset = TREE_PAGE_HEADER_SIZE + usize::from(index) * 8;
        self.buf.as_mut_slice()[offset..offset + 8].copy_from_slice(&entry.pack().to_le_bytes());
    }

    /// The page's backing buffer, for writeback.
    pub fn buf(&self) -> &Buf {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::{TreePage, ENTRIES_PER_PAGE};
    use crate::layers::journal::BlockMapEntry;

    #[test]
    fn header_and_entries() {
        let mut page = TreePage::new_zeroed(5, 77).unwrap();
        assert_eq!(page.nonce(), 5);
        assert_eq!(page.pbn(), 77);

        // A fresh page is all-unmapped.
        for index in [0, 1, ENTRIES_PER_PAGE - 1] {
            assert_eq!(page.get_entry(index).unwrap(), BlockMapEntry::UNMAPPED);
        }

        let entry = BlockMapEntry::uncompressed(1234);
        page.set_entry(3, entry);
        assert_eq!(page.get_entry(3).unwrap(), entry);
        assert_eq!(page.get_entry(2).unwrap(), BlockMapEntry::UNMAPPED);
    }

    #[test]
    fn loaded_page_is_validated() {
        let page = TreePage::new_zeroed(5, 77).unwrap();
        let buf = page.buf().clone();
        assert!(TreePage::from_loaded(buf.clone(), 5, 77).is_ok());
        assert!(TreePage::from_loaded(buf.clone(), 6, 77).is_err());
        assert!(TreePage::from_loaded(buf, 5, 78).is_err());
    }
}
