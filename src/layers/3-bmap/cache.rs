// SPDX-License-Identifier: MPL-2.0

use core::num::NonZeroUsize;

use lru::LruCache;

use super::page::TreePage;
use crate::{
    layers::bio::{BlockSet, Buf, Pbn},
    prelude::*,
};

/// The lifecycle of a cached tree page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    /// Being read from storage.
    Incoming,
    /// In memory, identical to the on-disk copy.
    Resident,
    /// In memory with changes the on-disk copy lacks.
    Dirty,
    /// Being written back to storage.
    Outgoing,
}

struct CachedPage {
    page: TreePage,
    state: PageState,
    /// The era (recovery-journal sequence number) at which the page first
    /// became dirty; meaningless unless the state is `Dirty`.
    era: u64,
}

/// A bounded cache of tree pages for one logical zone.
///
/// Pages age by *era*: a dirty page remembers the journal sequence number
/// current when it was first dirtied, and [`PageCache::flush_before`]
/// expels everything older than the cutoff so the journal can reap. An
/// evicted dirty page is written back before its frame is reused.
pub struct PageCache<D> {
    storage: D,
    nonce: u64,
    pages: LruCache<Pbn, CachedPage>,
    loads: u64,
    writebacks: u64,
}

impl<D: BlockSet> PageCache<D> {
    /// Creates a cache holding at most `capacity` pages.
    pub fn new(storage: D, nonce: u64, capacity: usize) -> Self {
        Self {
            storage,
            nonce,
            pages: LruCache::new(NonZeroUsize::new(capacity.max(4)).unwrap()),
            loads: 0,
            writebacks: 0,
        }
    }

    /// The number of page loads served from storage, for statistics.
    pub fn loads(&self) -> u64 {
        self.loads
    }

    /// The number of page writebacks, for statistics.
    pub fn writebacks(&self) -> u64 {
        self.writebacks
    }

    fn write_page(storage: &D, page: &TreePage, writebacks: &mut u64) -> Result<()> {
        storage.write(page.pbn(), page.buf().as_ref())?;
        storage.flush()?;
        *writebacks += 1;
        Ok(())
    }

    fn make_room(&mut self) -> Result<()> {
        while self.pages.len() >= self.pages.cap().get() {
            let Some((_pbn, mut evicted)) = self.pages.pop_lru() else {
                break;
            };
            if evicted.state == PageState::Dirty {
                evicted.state = PageState::Outgoing;
                Self::write_page(&self.storage, &evicted.page, &mut self.writebacks)?;
            }
        }
        Ok(())
    }

    /// Fetches the page at `pbn`, loading it from storage on a miss.
    pub fn get_page(&mut self, pbn: Pbn) -> Result<&mut TreePage> {
        if !self.pages.contains(&pbn) {
            self.make_room()?;
            let mut buf = Buf::alloc(1)?;
            self.storage.read(pbn, buf.as_mut())?;
            let page = TreePage::from_loaded(buf, self.nonce, pbn)?;
            self.loads += 1;
            self.pages.push(
                pbn,
                CachedPage {
                    page,
                    state: PageState::Resident,
                    era: 0,
                },
            );
        }
        Ok(&mut self.pages.get_mut(&pbn).expect("page was just cached").page)
    }

    /// Installs a freshly created page as dirty (it has never been
    /// written to storage).
    pub fn install_page(&mut self, page: TreePage, era: u64) -> Result<()> {
        self.make_room()?;
        let pbn = page.pbn();
        self.pages.push(
            pbn,
            CachedPage {
                page,
                state: PageState::Dirty,
                era,
            },
        );
        Ok(())
    }

    /// Marks the cached page at `pbn` dirty. The era of the *first*
    /// dirtying is kept: it is the bound on how long the journal must
    /// retain the covering entries.
    pub fn mark_dirty(&mut self, pbn: Pbn, era: u64) {
        if let Some(cached) = self.pages.peek_mut(&pbn) {
            if cached.state != PageState::Dirty {
                cached.state = PageState::Dirty;
                cached.era = era;
            }
        }
    }

    /// Returns the era of the oldest dirty page, if any page is dirty.
    pub fn oldest_dirty_era(&self) -> Option<u64> {
        self.pages
            .iter()
            .filter(|(_, cached)| cached.state == PageState::Dirty)
            .map(|(_, cached)| cached.era)
            .min()
    }

    /// Writes back every dirty page whose era precedes `cutoff`.
    pub fn flush_before(&mut self, cutoff: u64) -> Result<()> {
        let storage = &self.storage;
        let writebacks = &mut self.writebacks;
        for (_pbn, cached) in self.pages.iter_mut() {
            if cached.state == PageState::Dirty && cached.era < cutoff {
                cached.state = PageState::Outgoing;
                Self::write_page(storage, &cached.page, writebacks)?;
                cached.state = PageState::Resident;
            }
        }
        Ok(())
    }

    /// Writes back every dirty page.
    pub fn flush_all(&mut self) -> Result<()> {
        self.flush_before(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::{PageCache, TreePage};
    use crate::layers::{
        bio::{BlockSet, MemDisk},
        journal::BlockMapEntry,
    };

    fn install_written_page(disk: &MemDisk, nonce: u64, pbn: u64) {
        let page = TreePage::new_zeroed(nonce, pbn).unwrap();
        disk.write(pbn, page.buf().as_ref()).unwrap();
    }

    #[test]
    fn load_hit_and_validation() {
        let disk = MemDisk::create(16).unwrap();
        install_written_page(&disk, 9, 3);
        let mut cache = PageCache::new(disk, 9, 4);

        let page = cache.get_page(3).unwrap();
        assert_eq!(page.pbn(), 3);
        assert_eq!(cache.loads(), 1);
        cache.get_page(3).unwrap();
        assert_eq!(cache.loads(), 1);

        // An uninitialized block fails header validation.
        assert!(cache.get_page(5).is_err());
    }

    #[test]
    fn dirty_pages_flush_by_era() {
        let disk = MemDisk::create(16).unwrap();
        install_written_page(&disk, 9, 1);
        install_written_page(&disk, 9, 2);
        let mut cache = PageCache::new(disk.clone(), 9, 4);

        let entry = BlockMapEntry::uncompressed(500);
        cache.get_page(1).unwrap().set_entry(0, entry);
        cache.mark_dirty(1, 10);
        cache.get_page(2).unwrap().set_entry(0, entry);
        cache.mark_dirty(2, 20);
        assert_eq!(cache.oldest_dirty_era(), Some(10));

        // Only the older page is expelled.
        cache.flush_before(15).unwrap();
        assert_eq!(cache.oldest_dirty_era(), Some(20));
        assert_eq!(cache.writebacks(), 1);

        // The written copy is now on disk.
        let mut fresh = PageCache::new(disk, 9, 4);
        let page = fresh.get_page(1).unwrap();
        assert_eq!(page.get_entry(0).unwrap(), entry);

        cache.flush_all().unwrap();
        assert_eq!(cache.oldest_dirty_era(), None);
    }

    #[test]
    fn eviction_writes_back_dirty_pages() {
        let disk = MemDisk::create(32).unwrap();
        for pbn in 0..6 {
            install_written_page(&disk, 9, pbn);
        }
        let mut cache = PageCache::new(disk.clone(), 9, 4);

        let entry = BlockMapEntry::uncompressed(500);
        cache.get_page(0).unwrap().set_entry(7, entry);
        cache.mark_dirty(0, 1);

        // Fill past capacity; page 0 is the LRU and gets evicted dirty.
        for pbn in 1..6 {
            cache.get_page(pbn).unwrap();
        }
        assert!(cache.writebacks() >= 1);

        let mut fresh = PageCache::new(disk, 9, 4);
        assert_eq!(fresh.get_page(0).unwrap().get_entry(7).unwrap(), entry);
    }
}
