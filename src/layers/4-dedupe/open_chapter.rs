// SPDX-License-Identifier: MPL-2.0

use super::{chunk_name::ChunkName, DedupeAdvice};
use crate::prelude::*;

/// The hash table is sized to the next power of two at or above
/// `capacity * LOAD_RATIO` so quadratic probing terminates well before
/// the table fills.
const LOAD_RATIO: usize = 2;

#[derive(Clone, Copy, Debug)]
struct OpenChapterRecord {
    name: ChunkName,
    advice: DedupeAdvice,
    deleted: bool,
}

/// One zone's shard of the open chapter: the in-memory buffer of the most
/// recently posted records.
///
/// The records array reserves slot zero as the empty sentinel, so the
/// hash table can store bare u32 record numbers. Removal tombstones the
/// record: probe chains skip it, but the slot is not reused until the
/// chapter closes and the table is rebuilt empty.
pub struct OpenChapterZone {
    capacity: usize,
    slots: Vec<u32>,
    records: Vec<OpenChapterRecord>,
    deleted: usize,
}

impl OpenChapterZone {
    /// Creates a shard buffering at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        let slot_count = (capacity * LOAD_RATIO).next_power_of_two();
        Self {
            capacity,
            slots: vec![0; slot_count],
            records: Vec::with_capacity(capacity + 1),
            deleted: 0,
        }
    }

    /// Returns the number of live records.
    pub fn record_count(&self) -> usize {
        self.records.len().saturating_sub(self.deleted)
    }

    /// Returns the configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns whether no more records can be appended.
    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    /// Quadratic probe with step pattern 1, 2, 3, …; exact for
    /// power-of-two slot counts.
    fn probe(&self, name: &ChunkName, mut visit: impl FnMut(usize, u32) -> bool) {
        let mask = self.slots.len() - 1;
        let mut slot = name.hash_slot(self.slots.len());
        for step in 1..=self.slots.len() {
            if visit(slot, self.slots[slot]) {
                return;
            }
            slot = (slot + step) & mask;
        }
    }

    fn find_record(&self, name: &ChunkName) -> Option<u32> {
        let mut found = None;
        self.probe(name, |_slot, record_number| {
            if record_number == 0 {
                return true;
            }
            let record = &self.records[record_number as usize - 1];
            if record.name == *name {
                if !record.deleted {
                    found = Some(record_number);
                }
                return true;
            }
            false
        });
        found
    }

    /// Looks up the advice recorded for `name`.
    pub fn search(&self, name: &ChunkName) -> Option<DedupeAdvice> {
        self.find_record(name)
            .map(|number| self.records[number as usize - 1].advice)
    }

    /// Records `advice` for `name`: updates the existing record in place,
    /// or appends a new one. Fails with `VolumeOverflow` when the shard
    /// is at capacity and the name is new.
    pub fn put(&mut self, name: ChunkName, advice: DedupeAdvice) -> Result<()> {
        if let Some(number) = self.find_record(&name) {
            self.records[number as usize - 1].advice = advice;
            return Ok(());
        }
        if self.is_full() {
            return_errno_with_msg!(VolumeOverflow, "open chapter is at capacity");
        }

        self.records.push(OpenChapterRecord {
            name,
            advice,
            deleted: false,
        });
        let record_number = self.records.len() as u32;

        // Insertion does not reuse tombstoned slots: the records they
        // name are still in their probe chains.
        let mask = self.slots.len() - 1;
        let mut slot = name.hash_slot(self.slots.len());
        let mut placed = false;
        for step in 1..=self.slots.len() {
            if self.slots[slot] == 0 {
                self.slots[slot] = record_number;
                placed = true;
                break;
            }
            slot = (slot + step) & mask;
        }
        debug_assert!(placed, "a half-empty table must have a free slot");
        Ok(())
    }

    /// Tombstones the record for `name`. Returns whether it existed.
    pub fn remove(&mut self, name: &ChunkName) -> bool {
        match self.find_record(name) {
            Some(number) => {
                self.records[number as usize - 1].deleted = true;
                self.deleted += 1;
                true
            }
            None => false,
        }
    }

    /// Drains the live records, leaving the shard empty for the next
    /// chapter.
    pub fn close(&mut self) -> Vec<(ChunkName, DedupeAdvice)> {
        let records = core::mem::take(&mut self.records);
        self.slots.fill(0);
        self.deleted = 0;
        records
            .into_iter()
            .filter(|record| !record.deleted)
            .map(|record| (record.name, record.advice))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::OpenChapterZone;
    use crate::layers::dedupe::{ChunkName, DedupeAdvice};

    fn name(seed: u8) -> ChunkName {
        ChunkName::of(&[seed; 32])
    }

    fn advice(pbn: u64) -> DedupeAdvice {
        DedupeAdvice::uncompressed(pbn)
    }

    #[test]
    fn put_search_remove() {
        let mut chapter = OpenChapterZone::new(8);
        chapter.put(name(1), advice(100)).unwrap();
        assert_eq!(chapter.search(&name(1)), Some(advice(100)));
        assert_eq!(chapter.search(&name(2)), None);

        assert!(chapter.remove(&name(1)));
        assert_eq!(chapter.search(&name(1)), None);
        assert!(!chapter.remove(&name(1)));
        assert_eq!(chapter.record_count(), 0);
    }

    #[test]
    fn update_in_place_does_not_consume_capacity() {
        let mut chapter = OpenChapterZone::new(2);
        chapter.put(name(1), advice(100)).unwrap();
        chapter.put(name(2), advice(200)).unwrap();
        assert!(chapter.is_full());

        // Updating an existing name still succeeds at capacity.
        chapter.put(name(1), advice(101)).unwrap();
        assert_eq!(chapter.search(&name(1)), Some(advice(101)));

        // A new name overflows.
        assert!(chapter.put(name(3), advice(300)).is_err());
    }

    #[test]
    fn capacity_boundary_exact() {
        let mut chapter = OpenChapterZone::new(4);
        for seed in 0..4 {
            chapter.put(name(seed), advice(u64::from(seed))).unwrap();
        }
        assert_eq!(chapter.record_count(), 4);
        assert!(chapter.put(name(9), advice(9)).is_err());
    }

    #[test]
    fn probing_finds_all_records_under_load() {
        let mut chapter = OpenChapterZone::new(64);
        for seed in 0..64 {
            chapter.put(name(seed), advice(u64::from(seed))).unwrap();
        }
        for seed in 0..64 {
            assert_eq!(chapter.search(&name(seed)), Some(advice(u64::from(seed))));
        }
    }

    #[test]
    fn close_drains_live_records_and_resets() {
        let mut chapter = OpenChapterZone::new(4);
        chapter.put(name(1), advice(1)).unwrap();
        chapter.put(name(2), advice(2)).unwrap();
        chapter.remove(&name(1));

        let records = chapter.close();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, name(2));

        assert_eq!(chapter.record_count(), 0);
        assert_eq!(chapter.search(&name(2)), None);
        chapter.put(name(3), advice(3)).unwrap();
        assert_eq!(chapter.search(&name(3)), Some(advice(3)));
    }
}
