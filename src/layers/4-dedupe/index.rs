// SPDX-License-Identifier: MPL-2.0

use super::{
    chunk_name::ChunkName,
    open_chapter::OpenChapterZone,
    volume::{ChapterVolume, ClosedChapter, VolumeStats},
    DedupeAdvice,
};
use crate::prelude::*;

/// A client request against the dedupe index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexAction {
    /// Record new advice; return prior advice if the name was known.
    Post,
    /// Replace the advice for a name.
    Update,
    /// Forget a name.
    Delete,
    /// Look up advice without modifying the index.
    Query,
}

/// Control messages that flow through the same per-zone queues as client
/// requests, distinguished by flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexControl {
    /// All zones must agree chapter `0` is cached before proceeding.
    SparseCacheBarrier(u64),
    /// The named virtual chapter has closed in some zone; every zone
    /// closes its shard of it before opening the next chapter.
    AnnounceChapterClosed(u64),
}

/// One request flowing through the triage -> index -> callback pipeline.
#[derive(Clone, Copy, Debug)]
pub struct IndexRequest {
    pub action: IndexAction,
    pub name: ChunkName,
    pub advice: Option<DedupeAdvice>,
    /// Set when the request is on its second trip through the pipeline.
    pub requeued: bool,
}

/// The result of servicing a request on its index zone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexOutcome {
    /// The advice the index already held for the name, if any.
    pub advice: Option<DedupeAdvice>,
    /// Set when servicing the request closed this zone's shard of the
    /// named virtual chapter; the caller broadcasts the announcement.
    pub closed_chapter: Option<u64>,
}

/// Index-wide counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub posts_found: u64,
    pub posts_not_found: u64,
    pub queries_found: u64,
    pub queries_not_found: u64,
    pub updates: u64,
    pub deletes: u64,
    pub chapters_closed: u64,
}

/// The sizing of the dedupe index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexConfig {
    /// Records buffered per chapter across all zones.
    pub records_per_chapter: usize,
    /// Closed chapters retained per zone before the oldest expires.
    pub chapter_limit: usize,
    /// The newest `dense_limit` closed chapters are searched directly.
    pub dense_limit: usize,
    /// Sparse chapters held in the chapter cache.
    pub cache_chapters: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            records_per_chapter: 1024,
            chapter_limit: 64,
            dense_limit: 16,
            cache_chapters: 8,
        }
    }
}

/// One hash zone's shard of the dedupe index.
///
/// Names route to zones by their low bits, so shards are disjoint: each
/// zone owns its slice of the open chapter and of the chapter volume
/// outright. Only the chapter *lifecycle* is global; zones keep their
/// virtual chapter numbers in lockstep through
/// [`IndexControl::AnnounceChapterClosed`] and fence their sparse caches
/// with [`IndexControl::SparseCacheBarrier`].
pub struct IndexZone {
    zone_index: u32,
    virtual_chapter: u64,
    open: OpenChapterZone,
    volume: ChapterVolume,
    stats: IndexStats,
}

impl IndexZone {
    /// Creates the shard for `zone_index` of `zone_count` zones.
    pub fn new(zone_index: u32, zone_count: u32, config: IndexConfig) -> Self {
        let capacity = (config.records_per_chapter / zone_count as usize).max(1);
        Self {
            zone_index,
            virtual_chapter: 0,
            open: OpenChapterZone::new(capacity),
            volume: ChapterVolume::new(
                config.chapter_limit,
                config.dense_limit,
                config.cache_chapters,
            ),
            stats: IndexStats::default(),
        }
    }

    pub fn zone_index(&self) -> u32 {
        self.zone_index
    }

    /// The virtual chapter currently open in this zone.
    pub fn virtual_chapter(&self) -> u64 {
        self.virtual_chapter
    }

    pub fn stats(&self) -> IndexStats {
        self.stats
    }

    pub fn volume_stats(&self) -> VolumeStats {
        self.volume.stats()
    }

    /// Closes this zone's shard of the open chapter and opens the next
    /// one. Returns the closed virtual chapter number.
    pub fn close_chapter(&mut self) -> u64 {
        let closed = self.virtual_chapter;
        let records = self.open.close();
        self.volume.add_chapter(ClosedChapter::new(closed, records));
        self.virtual_chapter += 1;
        self.stats.chapters_closed += 1;
        closed
    }

    fn put_with_rollover(&mut self, name: ChunkName, advice: DedupeAdvice) -> Option<u64> {
        match self.open.put(name, advice) {
            Ok(()) => None,
            Err(error) if error.errno() == VolumeOverflow => {
                let closed = self.close_chapter();
                self.open
                    .put(name, advice)
                    .expect("a freshly opened chapter cannot overflow");
                Some(closed)
            }
            Err(_) => unreachable!("open chapter put only fails with VolumeOverflow"),
        }
    }

    /// Services one request. The caller (the hash zone) broadcasts any
    /// `closed_chapter` announcement to the other zones.
    pub fn service(&mut self, request: &IndexRequest) -> IndexOutcome {
        match request.action {
            IndexAction::Query => {
                let advice = self.search(&request.name);
                if advice.is_some() {
                    self.stats.queries_found += 1;
                } else {
                    self.stats.queries_not_found += 1;
                }
                IndexOutcome {
                    advice,
                    closed_chapter: None,
                }
            }
            IndexAction::Post => {
                let prior = self.search(&request.name);
                if prior.is_some() {
                    self.stats.posts_found += 1;
                } else {
                    self.stats.posts_not_found += 1;
                }
                let advice = request.advice.expect("post carries advice");
                let closed_chapter = self.put_with_rollover(request.name, advice);
                IndexOutcome {
                    advice: prior,
                    closed_chapter,
                }
            }
            IndexAction::Update => {
                self.stats.updates += 1;
                let prior = self.search(&request.name);
                let advice = request.advice.expect("update carries advice");
                let closed_chapter = self.put_with_rollover(request.name, advice);
                IndexOutcome {
                    advice: prior,
                    closed_chapter,
                }
            }
            IndexAction::Delete => {
                self.stats.deletes += 1;
                self.open.remove(&request.name);
                self.volume.remove(&request.name);
                IndexOutcome::default()
            }
        }
    }

    fn search(&mut self, name: &ChunkName) -> Option<DedupeAdvice> {
        self.open.search(name).or_else(|| self.volume.search(name))
    }

    /// Handles a chapter-close announcement from another zone: close the
    /// local shard of every chapter up to and including the announced
    /// one, so all zones open the successor together.
    pub fn handle_control(&mut self, control: IndexControl) {
        match control {
            IndexControl::AnnounceChapterClosed(virtual_chapter) => {
                while self.virtual_chapter <= virtual_chapter {
                    self.close_chapter();
                }
            }
            IndexControl::SparseCacheBarrier(virtual_chapter) => {
                // Cache agreement: chapters at or before the barrier must
                // not be dense here if they are sparse elsewhere. With
                // disjoint shards the cache contents need no exchange;
                // the barrier only orders chapter transitions.
                debug_assert!(virtual_chapter <= self.virtual_chapter);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{IndexAction, IndexConfig, IndexControl, IndexRequest, IndexZone};
    use crate::layers::dedupe::{ChunkName, DedupeAdvice};

    fn config() -> IndexConfig {
        IndexConfig {
            records_per_chapter: 4,
            chapter_limit: 8,
            dense_limit: 4,
            cache_chapters: 2,
        }
    }

    fn post(zone: &mut IndexZone, seed: u8, pbn: u64) -> super::IndexOutcome {
        zone.service(&IndexRequest {
            action: IndexAction::Post,
            name: ChunkName::of(&[seed; 16]),
            advice: Some(DedupeAdvice::uncompressed(pbn)),
            requeued: false,
        })
    }

    fn query(zone: &mut IndexZone, seed: u8) -> Option<DedupeAdvice> {
        zone.service(&IndexRequest {
            action: IndexAction::Query,
            name: ChunkName::of(&[seed; 16]),
            advice: None,
            requeued: false,
        })
        .advice
    }

    #[test]
    fn post_then_query_roundtrip() {
        let mut zone = IndexZone::new(0, 2, config());
        assert_eq!(post(&mut zone, 1, 100).advice, None);
        assert_eq!(
            query(&mut zone, 1),
            Some(DedupeAdvice::uncompressed(100))
        );
        assert_eq!(query(&mut zone, 2), None);
        assert_eq!(zone.stats().queries_found, 1);
        assert_eq!(zone.stats().queries_not_found, 1);
    }

    #[test]
    fn chapter_closes_on_overflow_and_dense_region_serves() {
        // records_per_chapter 4 over 2 zones: capacity 2 per zone.
        let mut zone = IndexZone::new(0, 2, config());
        assert_eq!(post(&mut zone, 1, 1).closed_chapter, None);
        assert_eq!(post(&mut zone, 2, 2).closed_chapter, None);

        // The shard is full: the next unique post closes chapter 0.
        let outcome = post(&mut zone, 3, 3);
        assert_eq!(outcome.closed_chapter, Some(0));
        assert_eq!(zone.virtual_chapter(), 1);

        // Records of the closed chapter still answer from the volume.
        assert_eq!(query(&mut zone, 1), Some(DedupeAdvice::uncompressed(1)));
        // And the new chapter accepted the overflowing record.
        assert_eq!(query(&mut zone, 3), Some(DedupeAdvice::uncompressed(3)));
    }

    #[test]
    fn announcement_synchronizes_chapters() {
        let mut zone = IndexZone::new(1, 2, config());
        post(&mut zone, 2, 9);
        assert_eq!(zone.virtual_chapter(), 0);

        // Another zone closed chapters 0 and 1.
        zone.handle_control(IndexControl::AnnounceChapterClosed(1));
        assert_eq!(zone.virtual_chapter(), 2);

        // The record posted in chapter 0 survives in the volume.
        assert_eq!(query(&mut zone, 2), Some(DedupeAdvice::uncompressed(9)));
    }

    #[test]
    fn delete_forgets_everywhere() {
        let mut zone = IndexZone::new(0, 1, config());
        post(&mut zone, 1, 5);
        zone.handle_control(IndexControl::AnnounceChapterClosed(0));
        post(&mut zone, 1, 6);

        zone.service(&IndexRequest {
            action: IndexAction::Delete,
            name: ChunkName::of(&[1; 16]),
            advice: None,
            requeued: false,
        });
        assert_eq!(query(&mut zone, 1), None);
    }

    #[test]
    fn update_replaces_advice() {
        let mut zone = IndexZone::new(0, 1, config());
        post(&mut zone, 1, 5);
        let outcome = zone.service(&IndexRequest {
            action: IndexAction::Update,
            name: ChunkName::of(&[1; 16]),
            advice: Some(DedupeAdvice::uncompressed(77)),
            requeued: false,
        });
        assert_eq!(outcome.advice, Some(DedupeAdvice::uncompressed(5)));
        assert_eq!(query(&mut zone, 1), Some(DedupeAdvice::uncompressed(77)));
    }
}
