// SPDX-License-Identifier: MPL-2.0

//! The slab depot layer.
//!
//! The physical space of the device is carved into fixed-size slabs, each
//! carrying the reference counters and the journal for its own data
//! blocks. Slabs are partitioned round-robin across physical zones; each
//! zone's block allocator owns its slabs outright.

mod pbn_lock;
mod ref_counts;
mod scrubber;
mod slab;
mod slab_journal;
mod summary;

use serde::{Deserialize, Serialize};

pub use self::{
    pbn_lock::{PbnLock, PbnLockIndex, PbnLockPool, PbnLockType},
    ref_counts::{RefCounts, ReferenceCount},
    scrubber::{Scrubber, ScrubberState},
    slab::{Slab, SlabConfig, SlabState},
    slab_journal::{
        SlabJournal, SlabJournalBlockHeader, SlabJournalEntry, SLAB_JOURNAL_ENTRIES_PER_BLOCK,
        SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK, SLAB_METADATA_TYPE,
    },
    summary::{SlabSummary, SlabSummaryEntry},
};
use crate::{
    layers::{
        bio::{BlockSet, Pbn},
        journal::{JournalOperation, JournalPoint},
    },
    prelude::*,
};

/// The persisted state of the slab depot, stored in the super block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepotState {
    /// The first physical block of the slab region.
    pub origin: Pbn,
    /// The size in blocks of every slab.
    pub slab_blocks: u64,
    /// The number of slabs.
    pub slab_count: u64,
}

impl DepotState {
    /// Derives the shared slab geometry.
    pub fn slab_config(&self) -> Result<SlabConfig> {
        SlabConfig::derive(self.slab_blocks)
    }

    /// Returns the index of the slab containing `pbn`, if any.
    pub fn slab_index_of(&self, pbn: Pbn) -> Option<u64> {
        if pbn < self.origin {
            return None;
        }
        let index = (pbn - self.origin) / self.slab_blocks;
        (index < self.slab_count).then_some(index)
    }

    /// Returns the first block of slab `index`.
    pub fn slab_origin(&self, index: u64) -> Pbn {
        self.origin + index * self.slab_blocks
    }
}

/// A pending update to the slab summary, routed to the summary's owning
/// zone as a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SummaryUpdate {
    pub slab_index: u64,
    pub tail_block_offset: u8,
    pub is_clean: bool,
    pub free_blocks: u64,
}

/// The result of an allocation attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum AllocResult {
    /// A block was allocated and provisionally referenced.
    Allocated(Pbn),
    /// Nothing is free now, but scrubbing may still produce clean slabs;
    /// the caller should wait for the scrubber.
    WaitForScrub,
    /// The zone is genuinely out of space.
    NoSpace,
}

/// The slab depot: geometry plus the format/open entry points that carve
/// the slab region and hand each physical zone its allocator.
pub struct SlabDepot;

impl SlabDepot {
    /// Formats every slab and partitions them across `zone_count` zones.
    pub fn format<D: BlockSet>(
        region: &D,
        state: &DepotState,
        nonce: u64,
        zone_count: u32,
    ) -> Result<Vec<BlockAllocator<D>>> {
        let config = state.slab_config()?;
        let mut partitions: Vec<Vec<Slab<D>>> = (0..zone_count).map(|_| Vec::new()).collect();
        for index in 0..state.slab_count {
            let start = index * state.slab_blocks;
            let storage = region.subset(start..start + state.slab_blocks)?;
            let slab = Slab::format(&storage, index, state.slab_origin(index), config, nonce)?;
            partitions[(index % u64::from(zone_count)) as usize].push(slab);
        }
        Ok(partitions
            .into_iter()
            .enumerate()
            .map(|(zone, slabs)| BlockAllocator::new(zone as u32, slabs, false))
            .collect())
    }

    /// Opens every slab and partitions them across `zone_count` zones.
    ///
    /// After a clean shutdown every slab's counters are authoritative
    /// (`assume_clean`); after a crash no summary bit can be trusted, so
    /// every slab comes up unrecovered and is queued for scrubbing in
    /// its allocator.
    pub fn open<D: BlockSet>(
        region: &D,
        state: &DepotState,
        nonce: u64,
        zone_count: u32,
        assume_clean: bool,
        high_priority_only: bool,
    ) -> Result<Vec<BlockAllocator<D>>> {
        let config = state.slab_config()?;
        let mut partitions: Vec<Vec<Slab<D>>> = (0..zone_count).map(|_| Vec::new()).collect();
        for index in 0..state.slab_count {
            let start = index * state.slab_blocks;
            let storage = region.subset(start..start + state.slab_blocks)?;
            let slab = Slab::open(
                &storage,
                index,
                state.slab_origin(index),
                config,
                nonce,
                assume_clean,
            )?;
            partitions[(index % u64::from(zone_count)) as usize].push(slab);
        }
        Ok(partitions
            .into_iter()
            .enumerate()
            .map(|(zone, slabs)| BlockAllocator::new(zone as u32, slabs, high_priority_only))
            .collect())
    }
}

/// One physical zone's allocator: admission control over its slabs, the
/// scrubbing schedule for the dirty ones, and the reference-count
/// mutation path.
pub struct BlockAllocator<D> {
    zone_index: u32,
    slabs: Vec<Slab<D>>,
    scrubber: Scrubber,
    open_slab: Option<usize>,
    summary_updates: Vec<SummaryUpdate>,
    /// Commit locks released since the last drain: their slab-journal
    /// deltas became durable (block written or counters saved).
    released_commit_locks: Vec<u64>,
    allocations: u64,
}

impl<D: BlockSet> BlockAllocator<D> {
    fn new(zone_index: u32, slabs: Vec<Slab<D>>, high_priority_only: bool) -> Self {
        let mut scrubber = Scrubber::new();
        scrubber.set_high_priority_only(high_priority_only);
        for slab in &slabs {
            if slab.state() == SlabState::Unrecovered {
                scrubber.register_slab(slab.slab_index(), false);
            }
        }
        Self {
            zone_index,
            slabs,
            scrubber,
            open_slab: None,
            summary_updates: Vec::new(),
            released_commit_locks: Vec::new(),
            allocations: 0,
        }
    }

    pub fn zone_index(&self) -> u32 {
        self.zone_index
    }

    /// Exposes the scrubber for admin control.
    pub fn scrubber_mut(&mut self) -> &mut Scrubber {
        &mut self.scrubber
    }

    /// Returns whether any slab still needs scrubbing.
    pub fn has_unrecovered_slabs(&self) -> bool {
        self.slabs
            .iter()
            .any(|slab| matches!(slab.state(), SlabState::Unrecovered | SlabState::Scrubbing))
    }

    /// The total free data blocks across this zone's clean slabs.
    pub fn free_block_count(&self) -> u64 {
        self.slabs
            .iter()
            .filter(|slab| !matches!(slab.state(), SlabState::Unrecovered | SlabState::Scrubbing))
            .map(Slab::free_block_count)
            .sum()
    }

    /// The number of allocations served, for statistics.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    fn local_index_of(&self, pbn: Pbn) -> Option<usize> {
        self.slabs.iter().position(|slab| slab.contains(pbn))
    }

    /// Allocates one data block, leaving it provisionally referenced.
    pub fn allocate(&mut self) -> Result<AllocResult> {
        // Stick with the open slab while it has room.
        if let Some(open) = self.open_slab {
            if self.slabs[open].free_block_count() == 0 {
                self.slabs[open].set_state(SlabState::Full);
                self.open_slab = None;
            }
        }

        if self.open_slab.is_none() {
            // Admit the clean slab with the most room.
            let candidate = self
                .slabs
                .iter()
                .enumerate()
                .filter(|(_, slab)| {
                    matches!(slab.state(), SlabState::Clean | SlabState::Active)
                        && slab.free_block_count() > 0
                })
                .max_by_key(|(_, slab)| slab.free_block_count())
                .map(|(index, _)| index);
            match candidate {
                Some(index) => {
                    self.slabs[index].set_state(SlabState::Active);
                    self.open_slab = Some(index);
                }
                None => {
                    return Ok(if self.has_unrecovered_slabs() {
                        for slab in &self.slabs {
                            if slab.state() == SlabState::Unrecovered {
                                self.scrubber.promote_slab(slab.slab_index());
                            }
                        }
                        AllocResult::WaitForScrub
                    } else {
                        AllocResult::NoSpace
                    });
                }
            }
        }

        let open = self.open_slab.expect("an open slab was just admitted");
        let slab = &mut self.slabs[open];
        let sbn = slab
            .ref_counts_mut()
            .find_free_block()
            .expect("the open slab was selected for having free blocks");
        slab.ref_counts_mut().provisionally_reference(sbn)?;
        self.allocations += 1;
        Ok(AllocResult::Allocated(slab.pbn_of(sbn)))
    }

    /// Releases a provisional reference that will not be committed.
    pub fn release_provisional(&mut self, pbn: Pbn) {
        if let Some(index) = self.local_index_of(pbn) {
            let slab = &mut self.slabs[index];
            let sbn = slab.sbn_of(pbn);
            slab.ref_counts_mut().release_provisional(sbn);
        }
    }

    /// Returns the reference-count class of `pbn`, if this zone owns it.
    pub fn reference_status(&self, pbn: Pbn) -> Option<ReferenceCount> {
        let index = self.local_index_of(pbn)?;
        let slab = &self.slabs[index];
        Some(slab.ref_counts().get(slab.sbn_of(pbn)))
    }

    /// Applies a committed reference-count delta for `pbn`, buffering it
    /// in the slab's journal. `commit_lock` is the vio token pinning the
    /// recovery journal's slab head until the delta is durable.
    pub fn adjust_reference_count(
        &mut self,
        pbn: Pbn,
        operation: JournalOperation,
        recovery_point: JournalPoint,
        commit_lock: u64,
    ) -> Result<ReferenceCount> {
        let index = self
            .local_index_of(pbn)
            .ok_or(Error::with_msg(InvalidArgs, "pbn not owned by this zone"))?;
        let slab = &mut self.slabs[index];
        let sbn = slab.sbn_of(pbn);
        slab.apply_delta(
            sbn,
            operation,
            recovery_point,
            commit_lock,
            &mut self.released_commit_locks,
        )?;
        let new_count = slab.ref_counts().get(sbn);
        self.push_summary_update(index, false);
        Ok(new_count)
    }

    /// Writes every slab journal's open block that holds buffered
    /// deltas; the zone's amortized commit pass.
    pub fn commit_slab_journals(&mut self) -> Result<()> {
        for slab in self.slabs.iter_mut() {
            slab.commit_journal(&mut self.released_commit_locks)?;
        }
        Ok(())
    }

    /// Returns whether the commit pass has work: buffered (unwritten)
    /// deltas in some slab, or released locks not yet reported.
    pub fn has_uncommitted_deltas(&self) -> bool {
        !self.released_commit_locks.is_empty()
            || self.slabs.iter().any(Slab::has_buffered_deltas)
    }

    /// Drains the commit locks released since the last call, for
    /// reporting to the journal zone.
    pub fn take_released_commit_locks(&mut self) -> Vec<u64> {
        core::mem::take(&mut self.released_commit_locks)
    }

    fn push_summary_update(&mut self, local_index: usize, is_clean: bool) {
        let slab = &self.slabs[local_index];
        let update = SummaryUpdate {
            slab_index: slab.slab_index(),
            tail_block_offset: slab.journal_tail_offset(),
            is_clean,
            free_blocks: slab.free_block_count(),
        };
        // Collapse runs of updates for the same slab; only the last state
        // matters to the summary.
        if let Some(last) = self
            .summary_updates
            .iter_mut()
            .find(|u| u.slab_index == update.slab_index)
        {
            *last = update;
        } else {
            self.summary_updates.push(update);
        }
    }

    /// Drains the pending summary updates for routing to the summary's
    /// owning zone.
    pub fn take_summary_updates(&mut self) -> Vec<SummaryUpdate> {
        core::mem::take(&mut self.summary_updates)
    }

    /// Applies a reference-count delta found in the recovery journal
    /// during replay. Deltas the slab journal had already mirrored before
    /// the crash are skipped; returns whether the delta was applied.
    ///
    /// The slab must already be scrubbed (replay runs after scrubbing the
    /// dirty slabs it touches).
    pub fn replay_reference_delta(
        &mut self,
        pbn: Pbn,
        operation: JournalOperation,
        recovery_point: JournalPoint,
    ) -> Result<bool> {
        let index = self
            .local_index_of(pbn)
            .ok_or(Error::with_msg(InvalidArgs, "pbn not owned by this zone"))?;
        let slab = &mut self.slabs[index];
        if slab.is_recovery_point_mirrored(recovery_point) {
            return Ok(false);
        }
        let sbn = slab.sbn_of(pbn);
        slab.apply_delta(
            sbn,
            operation,
            recovery_point,
            0,
            &mut self.released_commit_locks,
        )?;
        self.push_summary_update(index, false);
        Ok(true)
    }

    /// Runs one scrubbing step. Returns whether a slab was scrubbed (so
    /// the caller can notify allocation waiters and reschedule).
    pub fn scrub_step(&mut self) -> Result<bool> {
        let Some(slab_index) = self.scrubber.next_slab() else {
            return Ok(false);
        };
        let local = self
            .slabs
            .iter()
            .position(|slab| slab.slab_index() == slab_index)
            .ok_or(Error::with_msg(BadState, "scrubber holds a foreign slab"))?;
        let result = self.slabs[local].scrub();
        match result {
            Ok(()) => {
                self.scrubber.finish_slab(slab_index);
                self.push_summary_update(local, true);
                Ok(true)
            }
            Err(error) => {
                error!(
                    "scrub of slab {} failed in zone {}: {:?}",
                    slab_index, self.zone_index, error
                );
                Err(error)
            }
        }
    }

    /// Adopts a freshly formatted slab (grow-physical).
    pub fn adopt_slab(&mut self, slab: Slab<D>) {
        let local = self.slabs.len();
        self.slabs.push(slab);
        self.push_summary_update(local, true);
    }

    /// Saves every slab's counters and marks them clean in the summary;
    /// used by suspend and clean shutdown. Buffered deltas are covered
    /// by the saves, so their commit locks release without journal
    /// writes.
    pub fn save_all(&mut self) -> Result<()> {
        for local in 0..self.slabs.len() {
            if matches!(
                self.slabs[local].state(),
                SlabState::Unrecovered | SlabState::Scrubbing
            ) {
                continue;
            }
            let released = &mut self.released_commit_locks;
            self.slabs[local].save_ref_counts(released)?;
            self.push_summary_update(local, true);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{AllocResult, DepotState, SlabDepot, SummaryUpdate};
    use crate::layers::{
        bio::{BlockSet, MemDisk},
        depot::ReferenceCount,
        journal::{JournalOperation, JournalPoint},
    };

    fn point(sequence_number: u64) -> JournalPoint {
        JournalPoint {
            sequence_number,
            entry_count: 0,
        }
    }

    fn depot_fixture() -> (MemDisk, DepotState) {
        let disk = MemDisk::create(80).unwrap();
        let state = DepotState {
            origin: 0,
            slab_blocks: 16,
            slab_count: 4,
        };
        (disk, state)
    }

    #[test]
    fn geometry_maps_pbns_to_slabs() {
        let state = DepotState {
            origin: 100,
            slab_blocks: 16,
            slab_count: 4,
        };
        assert_eq!(state.slab_index_of(99), None);
        assert_eq!(state.slab_index_of(100), Some(0));
        assert_eq!(state.slab_index_of(131), Some(1));
        assert_eq!(state.slab_index_of(164), None);
        assert_eq!(state.slab_origin(2), 132);
    }

    #[test]
    fn format_partitions_slabs_round_robin() {
        let (disk, state) = depot_fixture();
        let allocators = SlabDepot::format(&disk, &state, 1, 2).unwrap();
        assert_eq!(allocators.len(), 2);
        assert_eq!(allocators[0].zone_index(), 0);
        // Slabs 0 and 2 land in zone 0; slabs 1 and 3 in zone 1.
        assert!(allocators[0].free_block_count() > 0);
        assert_eq!(
            allocators[0].free_block_count(),
            allocators[1].free_block_count()
        );
    }

    #[test]
    fn allocate_commit_and_free() {
        let (disk, state) = depot_fixture();
        let mut allocators = SlabDepot::format(&disk, &state, 1, 1).unwrap();
        let allocator = &mut allocators[0];
        let before = allocator.free_block_count();

        let AllocResult::Allocated(pbn) = allocator.allocate().unwrap() else {
            panic!("allocation must succeed on a fresh depot");
        };
        assert_eq!(
            allocator.reference_status(pbn),
            Some(ReferenceCount::Provisional)
        );
        assert_eq!(allocator.free_block_count(), before - 1);

        allocator
            .adjust_reference_count(pbn, JournalOperation::DataIncrement, point(1), 0)
            .unwrap();
        assert_eq!(
            allocator.reference_status(pbn),
            Some(ReferenceCount::Count(1))
        );

        allocator
            .adjust_reference_count(pbn, JournalOperation::DataDecrement, point(2), 0)
            .unwrap();
        assert_eq!(allocator.reference_status(pbn), Some(ReferenceCount::Free));
        assert_eq!(allocator.free_block_count(), before);
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let (disk, state) = depot_fixture();
        let mut allocators = SlabDepot::format(&disk, &state, 1, 1).unwrap();
        let allocator = &mut allocators[0];

        let mut count = 0;
        loop {
            match allocator.allocate().unwrap() {
                AllocResult::Allocated(_) => count += 1,
                AllocResult::NoSpace => break,
                AllocResult::WaitForScrub => panic!("no slabs are dirty"),
            }
        }
        assert_eq!(allocator.free_block_count(), 0);
        assert!(count > 0);
    }

    #[test]
    fn amortized_commit_pass_releases_locks() {
        let (disk, state) = depot_fixture();
        let mut allocators = SlabDepot::format(&disk, &state, 1, 1).unwrap();
        let allocator = &mut allocators[0];

        let AllocResult::Allocated(pbn) = allocator.allocate().unwrap() else {
            panic!("allocation must succeed");
        };
        allocator
            .adjust_reference_count(pbn, JournalOperation::DataIncrement, point(1), 21)
            .unwrap();
        // The delta is buffered: no lock released, commit work pending.
        assert!(allocator.has_uncommitted_deltas());
        assert!(allocator.take_released_commit_locks().is_empty());

        allocator.commit_slab_journals().unwrap();
        assert_eq!(allocator.take_released_commit_locks(), [21]);
        assert!(!allocator.has_uncommitted_deltas());
    }

    #[test]
    fn summary_updates_collapse_per_slab() {
        let (disk, state) = depot_fixture();
        let mut allocators = SlabDepot::format(&disk, &state, 1, 1).unwrap();
        let allocator = &mut allocators[0];

        let AllocResult::Allocated(pbn) = allocator.allocate().unwrap() else {
            panic!("allocation must succeed");
        };
        allocator
            .adjust_reference_count(pbn, JournalOperation::DataIncrement, point(1), 7)
            .unwrap();
        allocator
            .adjust_reference_count(pbn, JournalOperation::DataIncrement, point(2), 8)
            .unwrap();

        let updates: Vec<SummaryUpdate> = allocator.take_summary_updates();
        assert_eq!(updates.len(), 1);
        assert!(!updates[0].is_clean);
        assert!(allocator.take_summary_updates().is_empty());
    }

    #[test]
    fn reopen_clean_and_unclean() {
        let (disk, state) = depot_fixture();
        let free_after_commit;
        {
            let mut allocators = SlabDepot::format(&disk, &state, 1, 1).unwrap();
            let allocator = &mut allocators[0];
            let AllocResult::Allocated(pbn) = allocator.allocate().unwrap() else {
                panic!("allocation must succeed");
            };
            allocator
                .adjust_reference_count(pbn, JournalOperation::DataIncrement, point(1), 9)
                .unwrap();
            allocator.save_all().unwrap();
            // The save made the buffered delta durable.
            assert_eq!(allocator.take_released_commit_locks(), [9]);
            free_after_commit = allocator.free_block_count();
        }

        // A clean shutdown trusts the saved counters outright.
        let clean = SlabDepot::open(&disk, &state, 1, 1, true, false).unwrap();
        assert!(!clean[0].has_unrecovered_slabs());
        assert_eq!(clean[0].free_block_count(), free_after_commit);

        // After a crash every slab scrubs before allocating.
        let mut unclean = SlabDepot::open(&disk, &state, 1, 1, false, false).unwrap();
        assert!(unclean[0].has_unrecovered_slabs());
        while unclean[0].scrub_step().unwrap() {}
        assert!(!unclean[0].has_unrecovered_slabs());
        assert_eq!(unclean[0].free_block_count(), free_after_commit);
        let _ = disk.nblocks();
    }
}
