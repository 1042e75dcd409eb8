// SPDX-License-Identifier: MPL-2.0

//! The block map layer.
//!
//! A forest of fixed-height trees maps 48-bit logical block numbers to
//! packed `(pbn, state)` entries. Root pages live in a dedicated region;
//! interior and leaf pages are ordinary depot blocks, allocated lazily on
//! the write path and journaled as block-map increments. Each logical
//! zone owns the trees whose index hashes to it and caches their pages
//! with era-based writeback.

mod cache;
mod page;

use serde::{Deserialize, Serialize};

pub use self::{
    cache::{PageCache, PageState},
    page::{TreePage, ENTRIES_PER_PAGE, TREE_PAGE_HEADER_SIZE},
};
use crate::{
    layers::{
        bio::{BlockSet, Lbn, Pbn},
        journal::{BlockMapEntry, JournalOperation, MappingState, RecoveryJournalEntry},
    },
    prelude::*,
};

/// The persisted state of the block map, stored in the super block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMapState {
    /// The first block of the root-page region.
    pub root_origin: Pbn,
    /// The number of trees in the forest.
    pub root_count: u32,
    /// The number of page levels, including the leaves. A height of one
    /// means the roots are themselves leaves.
    pub height: u32,
}

impl BlockMapState {
    pub fn entries_per_page(&self) -> u64 {
        u64::from(ENTRIES_PER_PAGE)
    }

    pub fn page_number(&self, lbn: Lbn) -> u64 {
        lbn / self.entries_per_page()
    }

    pub fn leaf_slot(&self, lbn: Lbn) -> u16 {
        (lbn % self.entries_per_page()) as u16
    }

    /// The tree covering `lbn`: the low bits of its page number.
    pub fn tree_of(&self, lbn: Lbn) -> u32 {
        (self.page_number(lbn) % u64::from(self.root_count)) as u32
    }

    /// The page index within its tree: the high bits of the page number.
    pub fn page_in_tree(&self, lbn: Lbn) -> u64 {
        self.page_number(lbn) / u64::from(self.root_count)
    }

    pub fn root_pbn(&self, tree: u32) -> Pbn {
        self.root_origin + u64::from(tree)
    }

    /// The child indices selecting the path from a tree's root down to
    /// the leaf holding `page_in_tree`, most significant digit first.
    pub fn path_indices(&self, page_in_tree: u64) -> Vec<u16> {
        let epp = self.entries_per_page();
        let steps = self.height.saturating_sub(1);
        let mut digits = Vec::with_capacity(steps as usize);
        for level in (0..steps).rev() {
            let divisor = epp.pow(level);
            digits.push(((page_in_tree / divisor) % epp) as u16);
        }
        digits
    }

    /// The number of logical blocks addressable by this forest.
    pub fn addressable_blocks(&self) -> u64 {
        let epp = self.entries_per_page();
        u64::from(self.root_count) * epp.pow(self.height)
    }
}

/// Returns a slight over-estimate of the number of tree pages (including
/// leaves and roots) needed to map `logical_blocks` with `root_count`
/// trees.
pub fn compute_forest_size(logical_blocks: u64, root_count: u32) -> u64 {
    let epp = u64::from(ENTRIES_PER_PAGE);
    let leaves = logical_blocks.div_ceil(epp).max(1);
    let per_tree = leaves.div_ceil(u64::from(root_count));
    let mut total = u64::from(root_count);
    let mut level = per_tree;
    while level > 1 {
        total += level * u64::from(root_count);
        level = level.div_ceil(epp);
    }
    // Rounding slack for trees of uneven size.
    total + u64::from(root_count)
}

/// Computes the forest height needed to map `logical_blocks`.
pub fn compute_forest_height(logical_blocks: u64, root_count: u32) -> u32 {
    let epp = u64::from(ENTRIES_PER_PAGE);
    let leaves = logical_blocks.div_ceil(epp).max(1);
    let per_tree = leaves.div_ceil(u64::from(root_count));
    let mut height = 1;
    let mut coverage = 1;
    while coverage < per_tree {
        coverage *= epp;
        height += 1;
    }
    height
}

/// Formats the root-page region: one zeroed page per tree.
pub fn format_roots<D: BlockSet>(storage: &D, nonce: u64, state: &BlockMapState) -> Result<()> {
    for tree in 0..state.root_count {
        let pbn = state.root_pbn(tree);
        let page = TreePage::new_zeroed(nonce, pbn)?;
        storage.write(pbn, page.buf().as_ref())?;
    }
    storage.flush()
}

/// The outcome of preparing a leaf for a mapping update.
#[derive(Debug, PartialEq, Eq)]
pub enum PreparePut {
    /// Every page on the path is present; `put_mapping` will succeed.
    Ready,
    /// A page is missing: the caller must allocate a block, journal the
    /// block-map increment `{slot: (parent_pbn, index), mapping: child}`,
    /// and install the page before retrying.
    NeedsPage { parent_pbn: Pbn, index: u16 },
}

enum Descent {
    Leaf(Pbn),
    Missing { parent_pbn: Pbn, index: u16 },
}

/// One logical zone's slice of the block map.
pub struct BlockMapZone<D> {
    zone_index: u32,
    zone_count: u32,
    state: BlockMapState,
    nonce: u64,
    cache: PageCache<D>,
}

impl<D: BlockSet> BlockMapZone<D> {
    /// Creates the zone over device-wide `storage` (tree pages are
    /// addressed by absolute PBN).
    pub fn new(
        storage: D,
        nonce: u64,
        state: BlockMapState,
        zone_index: u32,
        zone_count: u32,
        cache_pages: usize,
    ) -> Self {
        Self {
            zone_index,
            zone_count,
            state,
            nonce,
            cache: PageCache::new(storage, nonce, cache_pages),
        }
    }

    /// Returns whether this zone owns the tree covering `lbn`.
    pub fn owns_lbn(&self, lbn: Lbn) -> bool {
        self.state.tree_of(lbn) % self.zone_count == self.zone_index
    }

    pub fn state(&self) -> &BlockMapState {
        &self.state
    }

    /// Grows the addressable range check; the forest itself grows lazily.
    pub fn set_state(&mut self, state: BlockMapState) {
        self.state = state;
    }

    fn descend(&mut self, lbn: Lbn) -> Result<Descent> {
        debug_assert!(self.owns_lbn(lbn));
        let tree = self.state.tree_of(lbn);
        let mut pbn = self.state.root_pbn(tree);
        for index in self.state.path_indices(self.state.page_in_tree(lbn)) {
            let entry = self.cache.get_page(pbn)?.get_entry(index)?;
            match entry.state {
                MappingState::Unmapped => return Ok(Descent::Missing {
                    parent_pbn: pbn,
                    index,
                }),
                MappingState::Uncompressed => pbn = entry.pbn,
                _ => {
                    return_errno_with_msg!(BadState, "interior tree entry is not a page pointer")
                }
            }
        }
        Ok(Descent::Leaf(pbn))
    }

    /// Looks up the mapping for `lbn`. A missing page on the path means
    /// every descendant is unmapped.
    pub fn get_mapping(&mut self, lbn: Lbn) -> Result<BlockMapEntry> {
        match self.descend(lbn)? {
            Descent::Missing { .. } => Ok(BlockMapEntry::UNMAPPED),
            Descent::Leaf(leaf_pbn) => self
                .cache
                .get_page(leaf_pbn)?
                .get_entry(self.state.leaf_slot(lbn)),
        }
    }

    /// Returns the block-map slot holding `lbn`'s mapping, if the leaf
    /// exists.
    pub fn get_slot(&mut self, lbn: Lbn) -> Result<Option<(Pbn, u16)>> {
        match self.descend(lbn)? {
            Descent::Missing { .. } => Ok(None),
            Descent::Leaf(leaf_pbn) => Ok(Some((leaf_pbn, self.state.leaf_slot(lbn)))),
        }
    }

    /// Checks whether the path to `lbn`'s leaf is complete.
    pub fn prepare_put(&mut self, lbn: Lbn) -> Result<PreparePut> {
        match self.descend(lbn)? {
            Descent::Leaf(_) => Ok(PreparePut::Ready),
            Descent::Missing { parent_pbn, index } => {
                Ok(PreparePut::NeedsPage { parent_pbn, index })
            }
        }
    }

    /// Installs a freshly allocated tree page: points the parent slot at
    /// it and caches the zeroed page dirty. The caller has already
    /// journaled the block-map increment.
    pub fn install_tree_page(
        &mut self,
        parent_pbn: Pbn,
        index: u16,
        child_pbn: Pbn,
        era: u64,
    ) -> Result<()> {
        let child = TreePage::new_zeroed(self.nonce, child_pbn)?;
        self.cache.install_page(child, era)?;
        let parent = self.cache.get_page(parent_pbn)?;
        parent.set_entry(index, BlockMapEntry::uncompressed(child_pbn));
        self.cache.mark_dirty(parent_pbn, era);
        Ok(())
    }

    /// Updates the mapping for `lbn`, returning the old mapping. The
    /// whole path must exist (see [`BlockMapZone::prepare_put`]).
    pub fn put_mapping(
        &mut self,
        lbn: Lbn,
        entry: BlockMapEntry,
        era: u64,
    ) -> Result<BlockMapEntry> {
        let Descent::Leaf(leaf_pbn) = self.descend(lbn)? else {
            return_errno_with_msg!(BadState, "put_mapping with an incomplete tree path");
        };
        let slot = self.state.leaf_slot(lbn);
        let page = self.cache.get_page(leaf_pbn)?;
        let old = page.get_entry(slot)?;
        page.set_entry(slot, entry);
        self.cache.mark_dirty(leaf_pbn, era);
        Ok(old)
    }

    /// Applies one recovery-journal entry during replay.
    ///
    /// Increments rewrite the named slot with the entry's mapping;
    /// decrements touch only reference counts and are ignored here. A
    /// block-map increment re-installs the page only when its on-disk
    /// copy never made it out of the cache before the crash.
    pub fn apply_replay_entry(&mut self, entry: &RecoveryJournalEntry) -> Result<()> {
        match entry.operation {
            JournalOperation::BlockMapIncrement => {
                let child_pbn = entry.mapping.pbn;
                if self.cache.get_page(child_pbn).is_err() {
                    let child = TreePage::new_zeroed(self.nonce, child_pbn)?;
                    self.cache.install_page(child, 0)?;
                }
                let parent = self.cache.get_page(entry.slot.pbn)?;
                parent.set_entry(entry.slot.slot_index, BlockMapEntry::uncompressed(child_pbn));
                self.cache.mark_dirty(entry.slot.pbn, 0);
                Ok(())
            }
            JournalOperation::DataIncrement => {
                let page = self.cache.get_page(entry.slot.pbn)?;
                page.set_entry(entry.slot.slot_index, entry.mapping);
                self.cache.mark_dirty(entry.slot.pbn, 0);
                Ok(())
            }
            JournalOperation::DataDecrement => Ok(()),
        }
    }

    /// Expels dirty pages older than `journal_tail - max_age` eras.
    pub fn advance_era(&mut self, journal_tail: u64, max_age: u64) -> Result<()> {
        self.cache.flush_before(journal_tail.saturating_sub(max_age))
    }

    /// The era of the oldest dirty page, bounding the journal head.
    pub fn oldest_dirty_era(&self) -> Option<u64> {
        self.cache.oldest_dirty_era()
    }

    /// Writes back every dirty page; used by suspend.
    pub fn flush(&mut self) -> Result<()> {
        self.cache.flush_all()
    }

    /// Visits every depot-allocated tree page of this zone's trees
    /// exactly once (roots live in their own region and are skipped).
    /// Used by grow-physical to seed the new depot's reference counts.
    pub fn traverse_forest(&mut self, visit: &mut dyn FnMut(Pbn) -> Result<()>) -> Result<()> {
        let epp = ENTRIES_PER_PAGE;
        for tree in 0..self.state.root_count {
            if tree % self.zone_count != self.zone_index {
                continue;
            }
            // (page, levels of children below it)
            let mut stack = vec![(self.state.root_pbn(tree), self.state.height - 1)];
            while let Some((pbn, levels_below)) = stack.pop() {
                if levels_below == 0 {
                    continue;
                }
                for index in 0..epp {
                    let entry = self.cache.get_page(pbn)?.get_entry(index)?;
                    if entry.state == MappingState::Uncompressed {
                        visit(entry.pbn)?;
                        stack.push((entry.pbn, levels_below - 1));
                    }
                }
            }
        }
        Ok(())
    }

    /// Page-cache statistics: (loads, writebacks).
    pub fn cache_stats(&self) -> (u64, u64) {
        (self.cache.loads(), self.cache.writebacks())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        compute_forest_height, compute_forest_size, format_roots, BlockMapState, BlockMapZone,
        PreparePut, ENTRIES_PER_PAGE,
    };
    use crate::layers::{bio::MemDisk, journal::BlockMapEntry};

    fn state(height: u32) -> BlockMapState {
        BlockMapState {
            root_origin: 1,
            root_count: 2,
            height,
        }
    }

    fn zone_fixture(height: u32) -> BlockMapZone<MemDisk> {
        let disk = MemDisk::create(64).unwrap();
        let state = state(height);
        format_roots(&disk, 7, &state).unwrap();
        BlockMapZone::new(disk, 7, state, 0, 1, 8)
    }

    #[test]
    fn geometry_decomposition() {
        let state = state(2);
        let epp = u64::from(ENTRIES_PER_PAGE);
        // Consecutive pages alternate trees.
        assert_eq!(state.tree_of(0), 0);
        assert_eq!(state.tree_of(epp), 1);
        assert_eq!(state.tree_of(2 * epp), 0);
        assert_eq!(state.page_in_tree(2 * epp), 1);
        assert_eq!(state.leaf_slot(epp + 3), 3);
        assert_eq!(state.path_indices(0), [0]);
        assert_eq!(state.path_indices(5), [5]);

        let tall = BlockMapState {
            root_origin: 1,
            root_count: 2,
            height: 3,
        };
        assert_eq!(tall.path_indices(epp + 5), [1, 5]);
    }

    #[test]
    fn forest_size_and_height() {
        let epp = u64::from(ENTRIES_PER_PAGE);
        assert_eq!(compute_forest_height(100, 1), 1);
        assert_eq!(compute_forest_height(epp + 1, 1), 2);
        assert_eq!(compute_forest_height(epp * epp + 1, 1), 3);

        // The estimate must cover at least the leaves.
        let size = compute_forest_size(epp * 10, 2);
        assert!(size >= 10 + 2);
    }

    #[test]
    fn height_one_roots_are_leaves() {
        let mut zone = zone_fixture(1);
        assert_eq!(
            zone.get_mapping(5).unwrap(),
            BlockMapEntry::UNMAPPED
        );
        assert_eq!(zone.prepare_put(5).unwrap(), PreparePut::Ready);

        let entry = BlockMapEntry::uncompressed(900);
        let old = zone.put_mapping(5, entry, 1).unwrap();
        assert_eq!(old, BlockMapEntry::UNMAPPED);
        assert_eq!(zone.get_mapping(5).unwrap(), entry);
        assert_eq!(zone.oldest_dirty_era(), Some(1));
    }

    #[test]
    fn missing_page_reads_unmapped_and_blocks_put() {
        let mut zone = zone_fixture(2);
        assert_eq!(zone.get_mapping(0).unwrap(), BlockMapEntry::UNMAPPED);

        let prepared = zone.prepare_put(0).unwrap();
        let PreparePut::NeedsPage { parent_pbn, index } = prepared else {
            panic!("the leaf under the root must be missing");
        };
        assert_eq!(parent_pbn, 1);
        assert_eq!(index, 0);
        assert!(zone.put_mapping(0, BlockMapEntry::uncompressed(900), 1).is_err());

        // Install the leaf at pbn 40 and retry.
        zone.install_tree_page(parent_pbn, index, 40, 1).unwrap();
        assert_eq!(zone.prepare_put(0).unwrap(), PreparePut::Ready);
        let entry = BlockMapEntry::uncompressed(900);
        zone.put_mapping(0, entry, 1).unwrap();
        assert_eq!(zone.get_mapping(0).unwrap(), entry);
        assert_eq!(zone.get_slot(0).unwrap(), Some((40, 0)));
    }

    #[test]
    fn era_writeback_persists_pages() {
        let disk = MemDisk::create(64).unwrap();
        let map_state = state(2);
        format_roots(&disk, 7, &map_state).unwrap();
        let entry = BlockMapEntry::uncompressed(900);
        {
            let mut zone = BlockMapZone::new(disk.clone(), 7, map_state, 0, 1, 8);
            zone.install_tree_page(1, 0, 40, 3).unwrap();
            zone.put_mapping(0, entry, 3).unwrap();
            // Era 3 pages are not yet expired at cutoff 2.
            zone.advance_era(5, 3).unwrap();
            assert_eq!(zone.oldest_dirty_era(), Some(3));
            // At cutoff 4 they are.
            zone.advance_era(7, 3).unwrap();
            assert_eq!(zone.oldest_dirty_era(), None);
        }

        let mut reopened = BlockMapZone::new(disk, 7, map_state, 0, 1, 8);
        assert_eq!(reopened.get_mapping(0).unwrap(), entry);
    }

    #[test]
    fn traverse_visits_each_allocated_page_once() {
        let mut zone = zone_fixture(2);
        zone.install_tree_page(1, 0, 40, 1).unwrap();
        zone.install_tree_page(2, 0, 41, 1).unwrap();
        zone.flush().unwrap();

        let mut visited = Vec::new();
        zone.traverse_forest(&mut |pbn| {
            visited.push(pbn);
            Ok(())
        })
        .unwrap();
        visited.sort_unstable();
        assert_eq!(visited, [40, 41]);
    }
}
