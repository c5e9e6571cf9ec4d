//! Pager: block I/O over the single database file.
//!
//! Owns the frame cache, the on-disk free list, the header page, and the
//! optional read-only memory map. Cached buffers are immutable `Arc<Page>`
//! images; a write installs a replacement buffer rather than mutating in
//! place, so read guards stay valid with no per-frame lock. One lock guards
//! the frame table.
//!
//! Dirty pages accumulate in the cache. At commit the pending set is sealed
//! and handed to the WAL; at checkpoint everything dirty is flushed to the
//! main file. Eviction picks the least-recently-used clean unpinned frame;
//! when only dirty frames remain the LRU dirty frame is first spilled to the
//! WAL (or the main file when the WAL is disabled) and then dropped. A frame
//! pinned by an outstanding guard is never evicted.

use std::collections::{BTreeSet, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use lru::LruCache;
use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::error::{Result, TurError};
use crate::storage::freelist;
use crate::storage::header::DbHeader;
use crate::storage::mmap::MmapRegion;
use crate::storage::page::{Page, PageNo, LARGE_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::wal::writer::Wal;

pub const DEFAULT_CACHE_FRAMES: usize = 1000;

/// Pinned, immutable view of a cached page.
pub struct PageGuard {
    page: Arc<Page>,
}

impl Deref for PageGuard {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl PageGuard {
    pub fn share(&self) -> Arc<Page> {
        Arc::clone(&self.page)
    }
}

struct Frame {
    buf: Arc<Page>,
    dirty: bool,
}

struct PagerState {
    cache: LruCache<PageNo, Frame>,
    header: DbHeader,
    /// Next page number to hand out at end-of-file.
    page_count: u32,
    /// Dirtied since the last commit barrier; framed into the WAL at commit.
    wal_pending: BTreeSet<PageNo>,
    /// Dirtied since the last checkpoint; flushed to the main file there.
    dirty: BTreeSet<PageNo>,
    /// Pages whose checksum failed; reads re-fail without touching disk.
    poisoned: HashSet<PageNo>,
}

pub struct Pager {
    file: Mutex<File>,
    path: PathBuf,
    page_size: usize,
    cache_frames: usize,
    read_only: bool,
    use_mmap: bool,
    state: Mutex<PagerState>,
    map: Mutex<Option<MmapRegion>>,
    /// Serializes free-chain pops, which read the head page between two
    /// state-lock critical sections.
    alloc_lock: Mutex<()>,
    wal: OnceLock<Arc<Wal>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Pager {
    /// Create a new database file with a sealed header page.
    pub fn create(
        path: &Path,
        page_size: usize,
        cache_frames: usize,
        use_mmap: bool,
    ) -> Result<Pager> {
        validate_page_size(page_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let pager = Pager {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            page_size,
            cache_frames: cache_frames.max(2),
            read_only: false,
            use_mmap,
            state: Mutex::new(PagerState {
                cache: LruCache::unbounded(),
                header: DbHeader::new(page_size as u32),
                page_count: 1,
                wal_pending: BTreeSet::new(),
                dirty: BTreeSet::new(),
                poisoned: HashSet::new(),
            }),
            map: Mutex::new(None),
            alloc_lock: Mutex::new(()),
            wal: OnceLock::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        };

        // Page 0 must exist on disk before anything else does.
        {
            let mut state = pager.state.lock();
            pager.install_header_page(&mut state);
            pager.flush_dirty_locked(&mut state, &CancelToken::none())?;
        }
        pager.sync()?;
        Ok(pager)
    }

    /// Open an existing database file, validating the header.
    pub fn open(
        path: &Path,
        cache_frames: usize,
        read_only: bool,
        use_mmap: bool,
    ) -> Result<Pager> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        let file_len = file.metadata()?.len();

        // Peek at the declared page size before the page can be checked.
        let mut prefix = [0u8; 20];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut prefix)
            .map_err(|_| TurError::BadFormat("file shorter than header".into()))?;
        if &prefix[0..16] != crate::storage::header::DB_MAGIC {
            return Err(TurError::BadFormat("bad magic".into()));
        }
        let page_size = u32::from_be_bytes(prefix[16..20].try_into().unwrap()) as usize;
        validate_page_size(page_size)?;

        file.seek(SeekFrom::Start(0))?;
        let mut raw = vec![0u8; page_size];
        file.read_exact(&mut raw)?;
        let page0 = Page::from_bytes(0, raw);
        if !page0.verify() {
            return Err(TurError::CorruptPage(0));
        }
        let header = DbHeader::read_from(&page0)?;

        let page_count = (file_len / page_size as u64).max(1) as u32;
        let pager = Pager {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            page_size,
            cache_frames: cache_frames.max(2),
            read_only,
            use_mmap,
            state: Mutex::new(PagerState {
                cache: LruCache::unbounded(),
                header,
                page_count,
                wal_pending: BTreeSet::new(),
                dirty: BTreeSet::new(),
                poisoned: HashSet::new(),
            }),
            map: Mutex::new(None),
            alloc_lock: Mutex::new(()),
            wal: OnceLock::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        };
        if use_mmap {
            pager.remap()?;
        }
        Ok(pager)
    }

    /// Wire the WAL in. Cache misses consult its page index before the main
    /// file, and dirty evictions spill into it.
    pub fn attach_wal(&self, wal: Arc<Wal>) {
        let _ = self.wal.set(wal);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn page_count(&self) -> u32 {
        self.state.lock().page_count
    }

    pub fn cache_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    // --- Header accessors ---

    pub fn header(&self) -> DbHeader {
        self.state.lock().header.clone()
    }

    pub fn schema_root(&self) -> PageNo {
        self.state.lock().header.schema_root
    }

    pub fn set_schema_root(&self, root: PageNo) {
        let mut state = self.state.lock();
        state.header.schema_root = root;
        self.install_header_page(&mut state);
    }

    pub fn vector_roots(&self) -> Vec<PageNo> {
        self.state.lock().header.vector_roots.clone()
    }

    pub fn push_vector_root(&self, meta_page: PageNo) -> usize {
        let mut state = self.state.lock();
        state.header.vector_roots.push(meta_page);
        let idx = state.header.vector_roots.len() - 1;
        self.install_header_page(&mut state);
        idx
    }

    pub fn txn_horizon(&self) -> u64 {
        self.state.lock().header.txn_horizon
    }

    pub fn set_txn_horizon(&self, horizon: u64) {
        let mut state = self.state.lock();
        state.header.txn_horizon = horizon;
        self.install_header_page(&mut state);
    }

    /// Rebuild the page-0 image from the in-memory header and mark it dirty.
    fn install_header_page(&self, state: &mut PagerState) {
        let mut page = Page::new(0, self.page_size);
        state.header.write_to(&mut page);
        page.seal();
        self.install(state, page, true);
    }

    // --- Reads ---

    pub fn read(&self, page_no: PageNo) -> Result<PageGuard> {
        self.read_with(page_no, &CancelToken::none())
    }

    pub fn read_with(&self, page_no: PageNo, cancel: &CancelToken) -> Result<PageGuard> {
        self.read_sized(page_no, self.page_size, cancel)
    }

    /// Read a 64 KiB HNSW page (a run of consecutive regular pages).
    pub fn read_large(&self, page_no: PageNo, cancel: &CancelToken) -> Result<PageGuard> {
        self.read_sized(page_no, LARGE_PAGE_SIZE, cancel)
    }

    fn read_sized(&self, page_no: PageNo, size: usize, cancel: &CancelToken) -> Result<PageGuard> {
        let mut state = self.state.lock();
        if state.poisoned.contains(&page_no) {
            return Err(TurError::CorruptPage(page_no));
        }
        if let Some(frame) = state.cache.get(&page_no) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(PageGuard {
                page: Arc::clone(&frame.buf),
            });
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        cancel.check()?;

        let mut buf = vec![0u8; size];
        let chunks = size / self.page_size;
        for i in 0..chunks {
            let chunk_no = page_no + i as u32;
            let dst = &mut buf[i * self.page_size..(i + 1) * self.page_size];
            self.read_chunk(chunk_no, dst)?;
        }

        let page = Page::from_bytes(page_no, buf);
        if !page.verify() {
            state.poisoned.insert(page_no);
            return Err(TurError::CorruptPage(page_no));
        }
        let arc = Arc::new(page);
        self.insert_frame(
            &mut state,
            page_no,
            Frame {
                buf: Arc::clone(&arc),
                dirty: false,
            },
        )?;
        Ok(PageGuard { page: arc })
    }

    /// Fetch one page-size chunk from the WAL, the mmap, or the file.
    fn read_chunk(&self, chunk_no: PageNo, dst: &mut [u8]) -> Result<()> {
        if let Some(wal) = self.wal.get() {
            if let Some(offset) = wal.lookup(chunk_no) {
                return wal.read_page_data(offset, dst);
            }
        }
        let offset = chunk_no as u64 * self.page_size as u64;
        if self.use_mmap {
            let map = self.map.lock();
            if let Some(region) = map.as_ref() {
                if region.read_at(offset, dst) {
                    return Ok(());
                }
            }
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(dst)?;
        Ok(())
    }

    // --- Writes ---

    /// Install a fresh page image as dirty. The flush to the log or the main
    /// file happens at commit/checkpoint, not here.
    pub fn write_page(&self, page: Page) -> Result<()> {
        if self.read_only {
            return Err(TurError::ReadOnly);
        }
        debug_assert!(page.size() == self.page_size || page.size() == LARGE_PAGE_SIZE);
        let mut state = self.state.lock();
        state.poisoned.remove(&page.no());
        self.install(&mut state, page, true);
        self.make_room(&mut state)?;
        Ok(())
    }

    fn install(&self, state: &mut PagerState, page: Page, dirty: bool) {
        let no = page.no();
        if dirty {
            state.wal_pending.insert(no);
            state.dirty.insert(no);
        }
        state.cache.put(
            no,
            Frame {
                buf: Arc::new(page),
                dirty,
            },
        );
    }

    fn insert_frame(&self, state: &mut PagerState, no: PageNo, frame: Frame) -> Result<()> {
        state.cache.put(no, frame);
        self.make_room(state)
    }

    /// Evict down to capacity. Clean unpinned frames go first; if none
    /// exist the LRU dirty frame is spilled and dropped. Pinned frames are
    /// skipped, which can leave the cache temporarily over capacity.
    /// 64 KiB frames also stay resident: the WAL indexes them chunk-wise
    /// and the checkpoint flush restores whole units from the cache only.
    fn make_room(&self, state: &mut PagerState) -> Result<()> {
        while state.cache.len() > self.cache_frames {
            let mut clean_victim: Option<PageNo> = None;
            let mut dirty_victim: Option<PageNo> = None;
            for (&no, frame) in state.cache.iter().rev() {
                if no == 0
                    || frame.buf.size() != self.page_size
                    || Arc::strong_count(&frame.buf) > 1
                {
                    continue; // header, large pages and pinned frames stay
                }
                if !frame.dirty {
                    clean_victim = Some(no);
                    break;
                }
                if dirty_victim.is_none() {
                    dirty_victim = Some(no);
                }
            }
            if let Some(no) = clean_victim {
                state.cache.pop(&no);
                continue;
            }
            let Some(no) = dirty_victim else {
                break; // everything pinned
            };
            self.spill_frame(state, no)?;
            state.cache.pop(&no);
        }
        Ok(())
    }

    /// Write a dirty frame out before eviction: into the WAL when attached,
    /// straight to the main file otherwise.
    fn spill_frame(&self, state: &mut PagerState, no: PageNo) -> Result<()> {
        let frame = state
            .cache
            .peek(&no)
            .ok_or_else(|| TurError::Corruption(format!("spill of uncached page {}", no)))?;
        let mut sealed = (*frame.buf).clone();
        sealed.seal();
        if let Some(wal) = self.wal.get() {
            wal.append_page(0, &sealed, false)?;
            state.wal_pending.remove(&no);
            // Still in `dirty`: the checkpoint flush will pick the image
            // back up through the WAL index.
        } else {
            self.write_image_to_file(&sealed)?;
            state.wal_pending.remove(&no);
            state.dirty.remove(&no);
        }
        Ok(())
    }

    fn write_image_to_file(&self, page: &Page) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page.no() as u64 * self.page_size as u64))?;
        file.write_all(page.data())?;
        Ok(())
    }

    // --- Allocation ---

    /// Allocate one page: pop the free chain or extend the file.
    pub fn allocate(&self) -> Result<PageNo> {
        if self.read_only {
            return Err(TurError::ReadOnly);
        }
        let _alloc = self.alloc_lock.lock();
        let head = self.state.lock().header.freelist_head;
        if head != 0 {
            let next = {
                let guard = self.read(head)?;
                freelist::next_free(&guard)?
            };
            let mut state = self.state.lock();
            state.header.freelist_head = next;
            self.install_header_page(&mut state);
            // The stale FREELIST image must not shadow the caller's rewrite.
            state.cache.pop(&head);
            state.wal_pending.remove(&head);
            state.dirty.remove(&head);
            return Ok(head);
        }
        let mut state = self.state.lock();
        let no = state.page_count;
        state.page_count += 1;
        Ok(no)
    }

    /// Allocate a run of consecutive pages for one 64 KiB HNSW page.
    /// Runs always come from the end of the file; the free chain cannot
    /// guarantee contiguity.
    pub fn allocate_large(&self) -> Result<PageNo> {
        if self.read_only {
            return Err(TurError::ReadOnly);
        }
        let chunks = (LARGE_PAGE_SIZE / self.page_size) as u32;
        let mut state = self.state.lock();
        let no = state.page_count;
        state.page_count += chunks;
        Ok(no)
    }

    /// Return a page to the free chain.
    pub fn free(&self, page_no: PageNo) -> Result<()> {
        if self.read_only {
            return Err(TurError::ReadOnly);
        }
        let mut state = self.state.lock();
        let head = state.header.freelist_head;
        let page = freelist::encode_free_page(page_no, self.page_size, head);
        self.install(&mut state, page, true);
        state.header.freelist_head = page_no;
        state.poisoned.remove(&page_no);
        self.install_header_page(&mut state);
        self.make_room(&mut state)
    }

    /// Return every chunk of a 64 KiB page to the free chain.
    pub fn free_large(&self, page_no: PageNo) -> Result<()> {
        let chunks = (LARGE_PAGE_SIZE / self.page_size) as u32;
        for i in 0..chunks {
            self.free(page_no + i)?;
        }
        Ok(())
    }

    // --- Commit / checkpoint support ---

    /// Seal and hand over every page dirtied since the last commit barrier.
    /// The caller frames them into the WAL; the pages stay dirty in the
    /// cache until the next checkpoint flush.
    pub fn take_wal_pending(&self) -> Vec<Arc<Page>> {
        let mut state = self.state.lock();
        let pending: Vec<PageNo> = state.wal_pending.iter().copied().collect();
        let mut out = Vec::with_capacity(pending.len());
        for no in pending {
            if let Some(frame) = state.cache.peek(&no) {
                let mut sealed = (*frame.buf).clone();
                sealed.seal();
                let arc = Arc::new(sealed);
                state.cache.put(
                    no,
                    Frame {
                        buf: Arc::clone(&arc),
                        dirty: true,
                    },
                );
                out.push(arc);
            }
        }
        state.wal_pending.clear();
        out
    }

    /// Current sealed header page image (used for empty-write-set commit
    /// barriers).
    pub fn header_page_image(&self) -> Page {
        let state = self.state.lock();
        let mut page = Page::new(0, self.page_size);
        state.header.write_to(&mut page);
        page.seal();
        page
    }

    /// Flush every dirty page to the main file. Pages that were spilled out
    /// of the cache are read back through the WAL index first.
    pub fn flush_dirty(&self, cancel: &CancelToken) -> Result<()> {
        let mut state = self.state.lock();
        self.flush_dirty_locked(&mut state, cancel)
    }

    fn flush_dirty_locked(&self, state: &mut PagerState, cancel: &CancelToken) -> Result<()> {
        let dirty: Vec<PageNo> = state.dirty.iter().copied().collect();
        for no in dirty {
            cancel.check()?;
            let image = match state.cache.peek(&no) {
                Some(frame) => {
                    let mut sealed = (*frame.buf).clone();
                    sealed.seal();
                    sealed
                }
                None => {
                    // Spilled earlier; the WAL index has the latest image.
                    let wal = self.wal.get().ok_or_else(|| {
                        TurError::Corruption(format!("dirty page {} lost from cache", no))
                    })?;
                    let offset = wal.lookup(no).ok_or_else(|| {
                        TurError::Corruption(format!("dirty page {} missing from WAL", no))
                    })?;
                    let mut buf = vec![0u8; self.page_size];
                    wal.read_page_data(offset, &mut buf)?;
                    Page::from_bytes(no, buf)
                }
            };
            self.write_image_to_file(&image)?;
            if let Some(frame) = state.cache.peek_mut(&no) {
                frame.dirty = false;
            }
        }
        state.dirty.clear();
        state.wal_pending.clear();
        Ok(())
    }

    /// Fsync the main file.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    /// Refresh the read-only mapping after the file grew.
    pub fn remap(&self) -> Result<()> {
        if !self.use_mmap {
            return Ok(());
        }
        let len = {
            let file = self.file.lock();
            file.metadata()?.len() as usize
        };
        let file = self.file.lock();
        let region = MmapRegion::map(&file, len)?;
        drop(file);
        *self.map.lock() = Some(region);
        Ok(())
    }

    /// Drop every cached frame (test hook for cold-read paths).
    #[doc(hidden)]
    pub fn clear_cache(&self) {
        self.state.lock().cache.clear();
    }
}

fn validate_page_size(page_size: usize) -> Result<()> {
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(TurError::BadFormat(format!(
            "invalid page size {}",
            page_size
        )));
    }
    Ok(())
}
