//! Epoch-based reclamation of retired pages.
//!
//! Copy-on-write makes structural mutation safe to publish while readers are
//! mid-descent, but the pages a mutation replaced cannot go back on the free
//! chain until every reader that might still step onto them has finished.
//!
//! Readers enter an epoch before touching shared structure (cursor creation,
//! point reads, integrity scans) and leave on drop. Retiring a page parks it
//! under the current epoch; reclamation hands a retired page to the free
//! callback only once the minimum epoch across live readers has advanced
//! past the epoch it was retired in. Reclamation runs opportunistically at
//! commit and checkpoint; there is no dedicated thread.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::page::PageNo;

pub struct EpochManager {
    /// Bumped whenever a batch of pages is retired.
    epoch: AtomicU64,
    inner: Mutex<EpochInner>,
}

#[derive(Default)]
struct EpochInner {
    /// Live readers per entry epoch.
    readers: BTreeMap<u64, usize>,
    /// Retired pages, FIFO by retirement epoch.
    retired: VecDeque<(u64, Vec<PageNo>)>,
}

/// A reader registration. Dropping it exits the epoch.
pub struct EpochGuard {
    manager: Arc<EpochManager>,
    epoch: u64,
}

impl EpochManager {
    pub fn new() -> Arc<EpochManager> {
        Arc::new(EpochManager {
            epoch: AtomicU64::new(1),
            inner: Mutex::new(EpochInner::default()),
        })
    }

    /// Register a reader at the current epoch.
    pub fn enter(self: &Arc<Self>) -> EpochGuard {
        let mut inner = self.inner.lock();
        let epoch = self.epoch.load(Ordering::Acquire);
        *inner.readers.entry(epoch).or_insert(0) += 1;
        EpochGuard {
            manager: Arc::clone(self),
            epoch,
        }
    }

    /// Park pages replaced by a COW mutation and advance the epoch.
    pub fn retire(&self, pages: Vec<PageNo>) {
        if pages.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel);
        inner.retired.push_back((epoch, pages));
    }

    /// Free every retired batch no live reader can still observe.
    pub fn reclaim<F>(&self, mut free: F)
    where
        F: FnMut(PageNo),
    {
        let mut ready = Vec::new();
        {
            let mut inner = self.inner.lock();
            let min_reader = inner
                .readers
                .keys()
                .next()
                .copied()
                .unwrap_or(u64::MAX);
            while let Some((epoch, _)) = inner.retired.front() {
                // A reader that entered at epoch E may hold pages retired at
                // E or later; only strictly older batches are safe.
                if *epoch < min_reader {
                    let (_, pages) = inner.retired.pop_front().unwrap();
                    ready.push(pages);
                } else {
                    break;
                }
            }
        }
        for pages in ready {
            for page in pages {
                free(page);
            }
        }
    }

    /// Pages currently awaiting reclamation (observability / tests).
    pub fn retired_count(&self) -> usize {
        self.inner.lock().retired.iter().map(|(_, p)| p.len()).sum()
    }

    pub fn live_readers(&self) -> usize {
        self.inner.lock().readers.values().sum()
    }
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        let mut inner = self.manager.inner.lock();
        if let Some(count) = inner.readers.get_mut(&self.epoch) {
            *count -= 1;
            if *count == 0 {
                inner.readers.remove(&self.epoch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retired_pages_wait_for_readers() {
        let mgr = EpochManager::new();
        let reader = mgr.enter();
        mgr.retire(vec![10, 11]);

        let mut freed = Vec::new();
        mgr.reclaim(|p| freed.push(p));
        assert!(freed.is_empty(), "reader still live");

        drop(reader);
        mgr.reclaim(|p| freed.push(p));
        assert_eq!(freed, vec![10, 11]);
        assert_eq!(mgr.retired_count(), 0);
    }

    #[test]
    fn late_reader_does_not_block_old_batches() {
        let mgr = EpochManager::new();
        mgr.retire(vec![5]);
        // This reader entered after page 5 was retired; it can never reach it.
        let _reader = mgr.enter();

        let mut freed = Vec::new();
        mgr.reclaim(|p| freed.push(p));
        assert_eq!(freed, vec![5]);
    }

    #[test]
    fn reclaim_without_readers_frees_everything() {
        let mgr = EpochManager::new();
        mgr.retire(vec![1]);
        mgr.retire(vec![2, 3]);
        let mut freed = Vec::new();
        mgr.reclaim(|p| freed.push(p));
        assert_eq!(freed, vec![1, 2, 3]);
    }

    #[test]
    fn guard_counts_balance() {
        let mgr = EpochManager::new();
        let a = mgr.enter();
        let b = mgr.enter();
        assert_eq!(mgr.live_readers(), 2);
        drop(a);
        drop(b);
        assert_eq!(mgr.live_readers(), 0);
    }
}
