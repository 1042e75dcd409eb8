// SPDX-License-Identifier: MPL-2.0

use core::num::NonZeroUsize;

use lru::LruCache;

use super::{chunk_name::ChunkName, DedupeAdvice};
use crate::os::{Arc, HashMap, Vec};

/// One closed chapter: its records sorted by name for binary search, the
/// way a chapter's record pages are laid out on disk.
pub struct ClosedChapter {
    number: u64,
    records: Vec<(ChunkName, DedupeAdvice)>,
}

impl ClosedChapter {
    /// Seals a chapter from the records drained out of an open chapter.
    pub fn new(number: u64, mut records: Vec<(ChunkName, DedupeAdvice)>) -> Self {
        records.sort_unstable_by(|a, b| a.0 .0.cmp(&b.0 .0));
        Self { number, records }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Binary-searches the chapter for `name`.
    pub fn search(&self, name: &ChunkName) -> Option<DedupeAdvice> {
        self.records
            .binary_search_by(|(candidate, _)| candidate.0.cmp(&name.0))
            .ok()
            .map(|index| self.records[index].1)
    }

    fn names(&self) -> impl Iterator<Item = &ChunkName> {
        self.records.iter().map(|(name, _)| name)
    }
}

/// Classification of a chapter-cache probe, for hit-rate telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheProbeType {
    /// First look at an index page.
    IndexFirst,
    /// First look at a record page.
    RecordFirst,
    /// A retried look at an index page after a requeue.
    IndexRetry,
    /// A retried look at a record page after a requeue.
    RecordRetry,
}

/// Classifies a probe by what is being probed and whether the request
/// has been requeued before.
pub fn cache_probe_type(requeued: bool, is_index_page: bool) -> CacheProbeType {
    match (requeued, is_index_page) {
        (false, true) => CacheProbeType::IndexFirst,
        (false, false) => CacheProbeType::RecordFirst,
        (true, true) => CacheProbeType::IndexRetry,
        (true, false) => CacheProbeType::RecordRetry,
    }
}

/// Counters for the sparse chapter cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VolumeStats {
    pub dense_hits: u64,
    pub sparse_cache_hits: u64,
    pub sparse_faults: u64,
    pub expirations: u64,
}

/// One zone's shard of the chapter volume.
///
/// Closed chapters ring through two regions: the `dense_limit` newest are
/// *dense* (their records directly searchable), older ones are *sparse*
/// (searched only through the chapter cache, faulted in on demand).
/// Once `chapter_limit` chapters exist, the oldest expires and its names
/// leave the index entirely.
pub struct ChapterVolume {
    chapter_limit: usize,
    dense_limit: usize,
    /// All closed, unexpired chapters, newest last.
    chapters: Vec<Arc<ClosedChapter>>,
    /// name -> chapter number, for routing a search to its chapter.
    chapter_index: HashMap<ChunkName, u64>,
    /// Sparse chapters recently faulted in.
    cache: LruCache<u64, Arc<ClosedChapter>>,
    stats: VolumeStats,
}

impl ChapterVolume {
    /// Creates a shard retaining `chapter_limit` chapters, the newest
    /// `dense_limit` of them dense; `cache_chapters` sparse chapters fit
    /// in the cache.
    pub fn new(chapter_limit: usize, dense_limit: usize, cache_chapters: usize) -> Self {
        debug_assert!(dense_limit <= chapter_limit);
        Self {
            chapter_limit,
            dense_limit,
            chapters: Vec::new(),
            chapter_index: HashMap::new(),
            cache: LruCache::new(NonZeroUsize::new(cache_chapters.max(1)).unwrap()),
            stats: VolumeStats::default(),
        }
    }

    pub fn stats(&self) -> VolumeStats {
        self.stats
    }

    pub fn chapter_count(&self) -> usize {
        self.chapters.len()
    }

    /// Admits a freshly closed chapter, expiring the oldest one when the
    /// ring is full.
    pub fn add_chapter(&mut self, chapter: ClosedChapter) {
        for name in chapter.names() {
            self.chapter_index.insert(*name, chapter.number());
        }
        self.chapters.push(Arc::new(chapter));

        if self.chapters.len() > self.chapter_limit {
            let expired = self.chapters.remove(0);
            self.cache.pop(&expired.number());
            for name in expired.names() {
                // Only forget names the expired chapter still owns.
                if self.chapter_index.get(name) == Some(&expired.number()) {
                    self.chapter_index.remove(name);
                }
            }
            self.stats.expirations += 1;
        }
    }

    fn is_dense(&self, number: u64) -> bool {
        self.chapters
            .iter()
            .rev()
            .take(self.dense_limit)
            .any(|chapter| chapter.number() == number)
    }

    /// Searches the volume for `name`.
    ///
    /// A hit in a sparse chapter not present in the cache *faults* the
    /// chapter in, modeling the on-demand cache fill that the
    /// sparse-cache barrier fences across zones.
    pub fn search(&mut self, name: &ChunkName) -> Option<DedupeAdvice> {
        let number = *self.chapter_index.get(name)?;
        let chapter = self
            .chapters
            .iter()
            .find(|chapter| chapter.number() == number)?
            .clone();

        if self.is_dense(number) {
            self.stats.dense_hits += 1;
        } else if self.cache.get(&number).is_some() {
            self.stats.sparse_cache_hits += 1;
        } else {
            self.stats.sparse_faults += 1;
            self.cache.push(number, chapter.clone());
        }
        chapter.search(name)
    }

    /// Forgets `name` (a delete request).
    pub fn remove(&mut self, name: &ChunkName) -> bool {
        self.chapter_index.remove(name).is_some()
    }
}
