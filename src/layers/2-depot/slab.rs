// SPDX-License-Identifier: MPL-2.0

use super::{
    ref_counts::RefCounts,
    slab_journal::{SlabJournal, SlabJournalEntry},
};
use crate::{
    layers::{
        bio::{BlockSet, Pbn, BLOCK_SIZE},
        journal::{JournalOperation, JournalPoint},
    },
    os::HashSet,
    prelude::*,
};

/// The life stage of a slab.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlabState {
    /// The slab's journal may hold deltas its saved counters lack.
    Unrecovered,
    /// The slab's journal is being replayed into its counters.
    Scrubbing,
    /// The counters are authoritative and the journal is reaped.
    Clean,
    /// The slab is the open allocation target of its zone.
    Active,
    /// No free blocks remain.
    Full,
}

/// The internal geometry of every slab, derived from the slab size.
///
/// A slab's blocks are laid out data-first:
/// `[data][reference counters][slab journal]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabConfig {
    pub slab_blocks: u64,
    pub data_blocks: u64,
    pub ref_count_blocks: u64,
    pub journal_blocks: u64,
}

impl SlabConfig {
    /// Derives the geometry for slabs of `slab_blocks` total blocks.
    pub fn derive(slab_blocks: u64) -> Result<Self> {
        let journal_blocks = (slab_blocks / 256).max(2);
        let ref_count_blocks = 1 + slab_blocks.div_ceil(BLOCK_SIZE as u64);
        let overhead = journal_blocks + ref_count_blocks;
        if slab_blocks <= overhead + 1 {
            return_errno_with_msg!(BadConfiguration, "slab size leaves no room for data");
        }
        Ok(Self {
            slab_blocks,
            data_blocks: slab_blocks - overhead,
            ref_count_blocks,
            journal_blocks,
        })
    }
}

/// One slab: a contiguous run of physical blocks owned by exactly one
/// physical zone, carrying its own reference counters and journal.
///
/// Slab journal sequence numbers restart at one whenever the slab comes
/// up clean; the journal region is zeroed at that moment so no block of
/// an earlier epoch can survive into the new one.
pub struct Slab<D> {
    slab_index: u64,
    /// The first data-block PBN of this slab.
    data_origin: Pbn,
    config: SlabConfig,
    state: SlabState,
    ref_counts: RefCounts,
    ref_count_storage: D,
    journal: SlabJournal<D>,
    /// Commit locks of the vios whose deltas are buffered in the open
    /// journal block; drained (released) once a write or a counter save
    /// makes those deltas durable.
    pending_commit_locks: Vec<u64>,
    /// For an unrecovered slab, the packed recovery points its on-disk
    /// journal mirrors; recovery-journal replay skips exactly these.
    mirrored_recovery_points: HashSet<u64>,
    nonce: u64,
}

impl<D: BlockSet> Slab<D> {
    fn carve(storage: &D, config: SlabConfig) -> Result<(D, D)> {
        let ref_start = config.data_blocks;
        let journal_start = ref_start + config.ref_count_blocks;
        let ref_region = storage.subset(ref_start..journal_start)?;
        let journal_region = storage.subset(journal_start..config.slab_blocks)?;
        Ok((ref_region, journal_region))
    }

    /// Formats a slab: zeroed journal, all-free counters.
    pub fn format(
        storage: &D,
        slab_index: u64,
        data_origin: Pbn,
        config: SlabConfig,
        nonce: u64,
    ) -> Result<Slab<D>> {
        let (ref_region, journal_region) = Self::carve(storage, config)?;
        let ref_counts = RefCounts::new(config.data_blocks);
        ref_counts.save(&ref_region)?;
        SlabJournal::format(&journal_region)?;
        Ok(Self {
            slab_index,
            data_origin,
            config,
            state: SlabState::Clean,
            ref_counts,
            ref_count_storage: ref_region,
            journal: SlabJournal::open(journal_region, nonce),
            pending_commit_locks: Vec::new(),
            mirrored_recovery_points: HashSet::new(),
            nonce,
        })
    }

    /// Opens a slab from disk. A slab whose summary entry is dirty comes
    /// up `Unrecovered` and must be scrubbed before it can allocate; a
    /// clean slab starts a fresh journal epoch immediately.
    pub fn open(
        storage: &D,
        slab_index: u64,
        data_origin: Pbn,
        config: SlabConfig,
        nonce: u64,
        summary_clean: bool,
    ) -> Result<Slab<D>> {
        let (ref_region, journal_region) = Self::carve(storage, config)?;
        let mut ref_counts = RefCounts::load(&ref_region, config.data_blocks)?;
        let mut recovery_watermark = JournalPoint::default();
        let mut mirrored_recovery_points = HashSet::new();
        let state = if summary_clean {
            // Zero the journal so stale blocks of the previous epoch can
            // never be replayed against the restarted sequence numbers.
            SlabJournal::format(&journal_region)?;
            ref_counts.reset_slab_journal_point();
            ref_counts.save(&ref_region)?;
            SlabState::Clean
        } else {
            // The on-disk journal remembers which recovery-journal
            // entries were mirrored into it before the crash.
            recovery_watermark = SlabJournal::scan_tail_recovery_point(&journal_region, nonce)?;
            mirrored_recovery_points =
                SlabJournal::scan_mirrored_recovery_points(&journal_region, nonce)?;
            SlabState::Unrecovered
        };
        let mut journal = SlabJournal::open(journal_region, nonce);
        journal.set_tail_recovery_point(recovery_watermark);
        Ok(Self {
            slab_index,
            data_origin,
            config,
            state,
            ref_counts,
            ref_count_storage: ref_region,
            journal,
            pending_commit_locks: Vec::new(),
            mirrored_recovery_points,
            nonce,
        })
    }

    pub fn slab_index(&self) -> u64 {
        self.slab_index
    }

    pub fn state(&self) -> SlabState {
        self.state
    }

    pub fn set_state(&mut self, state: SlabState) {
        self.state = state;
    }

    pub fn free_block_count(&self) -> u64 {
        self.ref_counts.free_block_count()
    }

    pub fn data_blocks(&self) -> u64 {
        self.config.data_blocks
    }

    /// Returns whether `pbn` falls in this slab's data region.
    pub fn contains(&self, pbn: Pbn) -> bool {
        pbn >= self.data_origin && pbn < self.data_origin + self.config.data_blocks
    }

    /// Converts a data PBN to its slab block number.
    pub fn sbn_of(&self, pbn: Pbn) -> u64 {
        debug_assert!(self.contains(pbn));
        pbn - self.data_origin
    }

    /// Converts a slab block number back to a PBN.
    pub fn pbn_of(&self, sbn: u64) -> Pbn {
        self.data_origin + sbn
    }

    /// Exposes the counters (for queries).
    pub fn ref_counts(&self) -> &RefCounts {
        &self.ref_counts
    }

    /// Mutably exposes the counters (for provisional references and
    /// free-block searches).
    pub fn ref_counts_mut(&mut self) -> &mut RefCounts {
        &mut self.ref_counts
    }

    /// Applies a committed reference-count delta: journals it (buffered
    /// in the open block), then adjusts the counter. `recovery_point` is
    /// the recovery-journal position already covering the change;
    /// `commit_lock` (zero for none, e.g. during load-time replay) is
    /// the vio token pinning the recovery journal's slab head until the
    /// delta is durable here.
    ///
    /// Any commit locks the call made durable, whether by filling the
    /// open block or through the counter save a full ring forces, are
    /// appended to `released`.
    pub fn apply_delta(
        &mut self,
        sbn: u64,
        operation: JournalOperation,
        recovery_point: JournalPoint,
        commit_lock: u64,
        released: &mut Vec<u64>,
    ) -> Result<()> {
        if !self.journal.has_space() {
            self.save_ref_counts(released)?;
        }
        let (point, wrote) = self
            .journal
            .append(SlabJournalEntry { sbn, operation }, recovery_point)?;
        if commit_lock != 0 {
            self.pending_commit_locks.push(commit_lock);
        }
        if wrote {
            released.append(&mut self.pending_commit_locks);
        }
        self.ref_counts.adjust(sbn, operation)?;
        self.ref_counts.advance_slab_journal_point(point);
        if self.ref_counts.free_block_count() == 0 && self.state == SlabState::Active {
            self.state = SlabState::Full;
        }
        Ok(())
    }

    /// Writes the open journal block if it holds buffered deltas,
    /// appending the commit locks it released to `released`. The
    /// physical zone's amortized commit pass drives this.
    pub fn commit_journal(&mut self, released: &mut Vec<u64>) -> Result<()> {
        if self.journal.commit()? {
            released.append(&mut self.pending_commit_locks);
        }
        Ok(())
    }

    /// Returns whether a recovery-journal entry at `point` is already
    /// mirrored in this slab's on-disk journal (unrecovered slabs only).
    pub fn is_recovery_point_mirrored(&self, point: JournalPoint) -> bool {
        self.mirrored_recovery_points.contains(&point.pack())
    }

    /// Saves the counters, then reaps the slab journal: every admitted
    /// delta is now reflected on disk and the buffered deltas' commit
    /// locks release. Buffered deltas reach the journal before the
    /// counters are written, keeping the invariant that a delta the
    /// saved counters claim is also mirrored in a committed journal
    /// block.
    pub fn save_ref_counts(&mut self, released: &mut Vec<u64>) -> Result<()> {
        self.journal.commit()?;
        self.ref_counts.save(&self.ref_count_storage)?;
        self.journal.reap_all();
        released.append(&mut self.pending_commit_locks);
        Ok(())
    }

    /// Replays the slab journal into the counters, saves them, and starts
    /// a fresh journal epoch. On success the slab is clean.
    pub fn scrub(&mut self) -> Result<()> {
        debug_assert!(matches!(
            self.state,
            SlabState::Unrecovered | SlabState::Scrubbing
        ));
        self.state = SlabState::Scrubbing;

        let data_blocks = self.config.data_blocks;
        let ref_counts = &mut self.ref_counts;
        SlabJournal::<D>::scrub(
            self.journal.storage(),
            self.nonce,
            data_blocks,
            |point, entry| {
                ref_counts.replay_reference_count_change(point, entry.sbn, entry.operation)
            },
        )?;

        // Discard any provisional references left by in-flight allocations
        // that never committed before the crash.
        for sbn in 0..data_blocks {
            self.ref_counts.release_provisional(sbn);
        }

        SlabJournal::format(self.journal.storage())?;
        self.ref_counts.reset_slab_journal_point();
        self.ref_counts.save(&self.ref_count_storage)?;
        self.journal.reap_all();
        self.state = SlabState::Clean;
        Ok(())
    }

    /// Returns whether the open journal block holds buffered deltas.
    pub fn has_buffered_deltas(&self) -> bool {
        self.journal.has_unwritten()
    }

    /// The recovery-journal point of the newest committed delta; used to
    /// let the recovery journal reap.
    pub fn tail_recovery_point(&self) -> JournalPoint {
        self.journal.tail_recovery_point()
    }

    /// The tail-block offset persisted in the slab summary.
    pub fn journal_tail_offset(&self) -> u8 {
        (self.tail_recovery_point().sequence_number % self.journal.size()) as u8
    }
}
