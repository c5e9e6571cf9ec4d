//! TurDB: single-file embedded relational storage engine with native
//! vector search.
//!
//! - Copy-on-write B+ trees over a checksummed page file
//! - Snapshot-isolated MVCC with eager write-conflict detection
//! - Frame-structured write-ahead log with prefix replay
//! - Persistent HNSW vector index on 64 KiB pages
//! - Structural integrity checking and crash recovery
//!
//! The SQL front end (lexer, planner, virtual machine, catalog) consumes
//! this crate through [`Database`] and the handles it hands out; rows cross
//! the boundary as opaque byte strings (see [`types::Value`] for the shared
//! record vocabulary).

pub mod btree;
pub mod cancel;
pub mod concurrency;
pub mod error;
pub mod hnsw;
pub mod integrity;
pub mod mvcc;
pub mod storage;
pub mod types;
pub mod wal;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::btree::cursor::Cursor;
use crate::btree::directory::{TreeDirectory, TreeMeta};
use crate::btree::ops::BTree;
use crate::cancel::CancelToken;
use crate::concurrency::epoch::EpochManager;
use crate::concurrency::LockFile;
use crate::error::{Result, TurError};
use crate::hnsw::{HnswIndex, HnswParams};
use crate::integrity::{IntegrityError, IntegrityOptions};
use crate::mvcc::version::{chain_delete, chain_put, chain_undo, decode_chain, encode_chain};
use crate::mvcc::{claim_key, Transaction, TxnManager, WriteRecord};
use crate::storage::page::DEFAULT_PAGE_SIZE;
use crate::storage::pager::{Pager, DEFAULT_CACHE_FRAMES};
use crate::wal::checkpoint::{self, CheckpointPolicy};
use crate::wal::recovery;
use crate::wal::writer::Wal;

pub use crate::cancel::CancelToken as Cancel;
pub use crate::error::TurError as Error;
pub use crate::hnsw::HnswParams as VectorParams;
pub use crate::integrity::FkSpec;
pub use crate::mvcc::TxnState;
pub use crate::types::Value;

/// Open-time configuration.
#[derive(Debug, Clone)]
pub struct Options {
    pub page_size: usize,
    pub cache_frames: usize,
    pub read_only: bool,
    pub wal_enabled: bool,
    /// Serve clean cache misses from a read-only memory map.
    pub mmap: bool,
    pub checkpoint: CheckpointPolicy,
    /// Foreign keys declared to the integrity checker.
    pub foreign_keys: Vec<FkSpec>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            page_size: DEFAULT_PAGE_SIZE,
            cache_frames: DEFAULT_CACHE_FRAMES,
            read_only: false,
            wal_enabled: true,
            mmap: false,
            checkpoint: CheckpointPolicy::from_env(),
            foreign_keys: Vec::new(),
        }
    }
}

/// Cheap observability counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct DbStats {
    pub commits: u64,
    pub rollbacks: u64,
    pub checkpoints: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub wal_bytes: u64,
}

/// One named tree's shared state: the published root and the writer latch.
struct TreeHandle {
    name: String,
    kind: crate::btree::directory::TreeKind,
    base: Option<String>,
    root: AtomicU32,
    /// Held for the duration of one structural mutation.
    latch: Mutex<()>,
    /// Root changed since the directory last recorded it.
    dirty: AtomicBool,
}

impl TreeHandle {
    fn meta(&self) -> TreeMeta {
        TreeMeta {
            root: self.root.load(Ordering::Acquire),
            kind: self.kind,
            base: self.base.clone(),
        }
    }
}

struct DbInner {
    path: PathBuf,
    pager: Arc<Pager>,
    wal: Option<Arc<Wal>>,
    manager: Arc<TxnManager>,
    epoch: Arc<EpochManager>,
    directory: Mutex<TreeDirectory>,
    trees: RwLock<HashMap<String, Arc<TreeHandle>>>,
    vectors: RwLock<Vec<Arc<HnswIndex>>>,
    /// Serializes commit, rollback and checkpoint.
    commit_lock: Mutex<()>,
    policy: CheckpointPolicy,
    foreign_keys: Vec<FkSpec>,
    closed: AtomicBool,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    checkpoints: AtomicU64,
    _lock: LockFile,
}

/// Thread-safe database handle. Clone-free sharing via internal `Arc`s; the
/// handle itself may be wrapped in an `Arc` by the embedder.
pub struct Database {
    inner: Arc<DbInner>,
}

fn wal_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push("-wal");
    PathBuf::from(os)
}

impl Database {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, options: Options) -> Result<Database> {
        let lock = LockFile::acquire(path)?;
        let wp = wal_path(path);
        let exists = path.exists();

        if !exists && options.read_only {
            return Err(TurError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "database file does not exist",
            )));
        }

        let mut recovered = None;
        if exists && !options.read_only {
            // Replay first (fsyncs the main file), then drop the old log.
            // A crash between the two replays the same prefix again.
            recovered = recovery::recover(path, &wp)?;
            if recovered.is_some() || wp.exists() {
                recovery::truncate_wal_durably(&wp)?;
            }
        }

        let pager = if exists {
            Pager::open(path, options.cache_frames, options.read_only, options.mmap)?
        } else {
            Pager::create(path, options.page_size, options.cache_frames, options.mmap)?
        };
        let pager = Arc::new(pager);
        let header = pager.header();

        let resume_from = match &recovered {
            Some(r) => header.txn_horizon.max(r.max_stamp),
            None => header.txn_horizon,
        };
        let manager = TxnManager::new(resume_from);
        let epoch = EpochManager::new();

        let wal = if options.wal_enabled && !options.read_only {
            let wal = Arc::new(Wal::create(&wp, pager.page_size(), manager.current_ts())?);
            pager.attach_wal(Arc::clone(&wal));
            Some(wal)
        } else {
            None
        };

        let mut directory = if exists {
            if header.schema_root == 0 {
                return Err(TurError::BadFormat("missing tree directory".into()));
            }
            TreeDirectory::open(header.schema_root)
        } else {
            let directory = TreeDirectory::create(&pager)?;
            pager.set_schema_root(directory.root());
            directory
        };

        // Purge chain stamps left by transactions that died in the crash,
        // then advance the horizon past everything that survived.
        if let Some(r) = &recovered {
            let cancel = CancelToken::none();
            let entries = directory.list(&pager)?;
            let mut stats = crate::mvcc::gc::GcStats::default();
            for (name, meta) in entries {
                let mut tree = BTree::open(meta.root);
                let s = crate::mvcc::gc::vacuum_uncommitted(
                    &mut tree,
                    &pager,
                    &epoch,
                    header.txn_horizon,
                    &r.committed,
                    &cancel,
                )?;
                stats.versions_removed += s.versions_removed;
                stats.keys_removed += s.keys_removed;
                if tree.root() != meta.root {
                    let mut updated = meta.clone();
                    updated.root = tree.root();
                    directory.put(&pager, &epoch, &name, &updated)?;
                }
            }
            pager.set_schema_root(directory.root());
            if stats.versions_removed > 0 {
                info!(
                    "post-recovery vacuum: stripped {} uncommitted versions",
                    stats.versions_removed
                );
            }
        }

        // Preload tree handles and vector indexes.
        let mut trees = HashMap::new();
        for (name, meta) in directory.list(&pager)? {
            trees.insert(
                name.clone(),
                Arc::new(TreeHandle {
                    name,
                    kind: meta.kind,
                    base: meta.base,
                    root: AtomicU32::new(meta.root),
                    latch: Mutex::new(()),
                    dirty: AtomicBool::new(false),
                }),
            );
        }
        let mut vectors = Vec::new();
        for meta_page in pager.vector_roots() {
            vectors.push(Arc::new(HnswIndex::open(
                &pager,
                &CancelToken::none(),
                meta_page,
            )?));
        }

        let db = Database {
            inner: Arc::new(DbInner {
                path: path.to_path_buf(),
                pager,
                wal,
                manager,
                epoch,
                directory: Mutex::new(directory),
                trees: RwLock::new(trees),
                vectors: RwLock::new(vectors),
                commit_lock: Mutex::new(()),
                policy: options.checkpoint,
                foreign_keys: options.foreign_keys,
                closed: AtomicBool::new(false),
                commits: AtomicU64::new(0),
                rollbacks: AtomicU64::new(0),
                checkpoints: AtomicU64::new(0),
                _lock: lock,
            }),
        };

        // Make recovery and fresh-create state durable before serving.
        if !options.read_only {
            db.checkpoint()?;
        }
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TurError::Closed);
        }
        Ok(())
    }

    pub fn stats(&self) -> DbStats {
        DbStats {
            commits: self.inner.commits.load(Ordering::Relaxed),
            rollbacks: self.inner.rollbacks.load(Ordering::Relaxed),
            checkpoints: self.inner.checkpoints.load(Ordering::Relaxed),
            cache_hits: self.inner.pager.cache_hits(),
            cache_misses: self.inner.pager.cache_misses(),
            wal_bytes: self.inner.wal.as_ref().map(|w| w.bytes()).unwrap_or(0),
        }
    }

    // --- Transactions ---

    pub fn begin(&self) -> Result<Transaction> {
        self.ensure_open()?;
        Ok(self.inner.manager.begin())
    }

    /// Commit: frame the dirty pages, raise the commit barrier, fsync, then
    /// flip the transaction state. A failed commit aborts the transaction.
    pub fn commit(&self, txn: &mut Transaction) -> Result<()> {
        self.ensure_open()?;
        txn.ensure_active()?;
        let inner = &self.inner;
        let _commit = inner.commit_lock.lock();

        match self.commit_locked(txn) {
            Ok(()) => {
                inner.commits.fetch_add(1, Ordering::Relaxed);
                inner.epoch.reclaim(|p| {
                    let _ = inner.pager.free(p);
                });
                if let Some(wal) = &inner.wal {
                    if inner.policy.due(wal) {
                        drop(_commit);
                        let _ = self.checkpoint();
                    }
                }
                Ok(())
            }
            Err(e) => {
                // The WAL never saw a commit barrier; undo the chains and
                // release the write set.
                let _ = self.rollback_chains(txn);
                let _ = inner.manager.mark_aborted(txn);
                Err(e)
            }
        }
    }

    fn commit_locked(&self, txn: &mut Transaction) -> Result<()> {
        let inner = &self.inner;
        self.sync_tree_roots()?;

        if let Some(wal) = &inner.wal {
            let pending = inner.pager.take_wal_pending();
            if !pending.is_empty() {
                for page in pending.iter().take(pending.len() - 1) {
                    wal.append_page(txn.id(), page, false)?;
                }
                wal.append_page(txn.id(), pending.last().unwrap(), true)?;
                wal.sync()?;
            } else if !txn.write_set.is_empty() {
                // Writes that net out to zero pages still get a barrier.
                wal.append_commit_marker(txn.id(), &inner.pager.header_page_image())?;
                wal.sync()?;
            }
        } else if !txn.write_set.is_empty() {
            inner.pager.flush_dirty(&CancelToken::none())?;
            inner.pager.sync()?;
        }

        inner.manager.mark_committed(txn)?;
        Ok(())
    }

    /// Persist published roots into the directory and the header.
    fn sync_tree_roots(&self) -> Result<()> {
        let inner = &self.inner;
        let trees = inner.trees.read();
        let mut directory = inner.directory.lock();
        let mut changed = false;
        for handle in trees.values() {
            if handle.dirty.swap(false, Ordering::AcqRel) {
                directory.put(&inner.pager, &inner.epoch, &handle.name, &handle.meta())?;
                changed = true;
            }
        }
        if changed {
            inner.pager.set_schema_root(directory.root());
        }
        Ok(())
    }

    /// Roll back: undo every chain the transaction touched, then release it.
    pub fn rollback(&self, txn: &mut Transaction) -> Result<()> {
        self.ensure_open()?;
        txn.ensure_active()?;
        let _commit = self.inner.commit_lock.lock();
        self.rollback_chains(txn)?;
        self.inner.manager.mark_aborted(txn)?;
        self.inner.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rollback_chains(&self, txn: &Transaction) -> Result<()> {
        let inner = &self.inner;
        let cancel = CancelToken::none();
        for record in txn.write_set.iter().rev() {
            let Some(handle) = inner.trees.read().get(&record.tree).cloned() else {
                continue;
            };
            let _latch = handle.latch.lock();
            let mut tree = BTree::open(handle.root.load(Ordering::Acquire));
            let Some(bytes) = tree.get(&inner.pager, &cancel, &record.key)? else {
                continue;
            };
            let chain = chain_undo(decode_chain(&bytes)?, txn.id());
            if chain.is_empty() {
                tree.delete(&inner.pager, &inner.epoch, &cancel, &record.key)?;
            } else {
                tree.insert(
                    &inner.pager,
                    &inner.epoch,
                    &cancel,
                    &record.key,
                    &encode_chain(&chain),
                )?;
            }
            handle.root.store(tree.root(), Ordering::Release);
            handle.dirty.store(true, Ordering::Release);
        }
        Ok(())
    }

    // --- Trees ---

    /// Create a named table tree. Fails if the name is taken.
    pub fn btree_create(&self, name: &str) -> Result<Tree> {
        self.create_tree(name, None)
    }

    /// Create a named index tree tied to `base` for cardinality checking.
    pub fn index_create(&self, name: &str, base: &str) -> Result<Tree> {
        self.create_tree(name, Some(base))
    }

    fn create_tree(&self, name: &str, base: Option<&str>) -> Result<Tree> {
        self.ensure_open()?;
        if self.inner.pager.read_only() {
            return Err(TurError::ReadOnly);
        }
        let inner = &self.inner;
        {
            let trees = inner.trees.read();
            if trees.contains_key(name) {
                return Err(TurError::Corruption(format!(
                    "tree '{}' already exists",
                    name
                )));
            }
        }
        let tree = BTree::create(&inner.pager)?;
        let meta = match base {
            None => TreeMeta::table(tree.root()),
            Some(base) => TreeMeta::index(tree.root(), base),
        };
        {
            let mut directory = inner.directory.lock();
            directory.put(&inner.pager, &inner.epoch, name, &meta)?;
            inner.pager.set_schema_root(directory.root());
        }
        let handle = Arc::new(TreeHandle {
            name: name.to_string(),
            kind: meta.kind,
            base: meta.base.clone(),
            root: AtomicU32::new(meta.root),
            latch: Mutex::new(()),
            dirty: AtomicBool::new(false),
        });
        inner.trees.write().insert(name.to_string(), Arc::clone(&handle));
        Ok(Tree {
            db: Arc::clone(&self.inner),
            handle,
        })
    }

    /// Open an existing tree by name.
    pub fn btree_open(&self, name: &str) -> Result<Tree> {
        self.ensure_open()?;
        let handle = self
            .inner
            .trees
            .read()
            .get(name)
            .cloned()
            .ok_or(TurError::NotFound)?;
        Ok(Tree {
            db: Arc::clone(&self.inner),
            handle,
        })
    }

    // --- Vector indexes ---

    /// Create a vector index; returns its position among the header's
    /// vector roots.
    pub fn hnsw_create(&self, dim: usize, params: HnswParams) -> Result<VectorIndex> {
        self.ensure_open()?;
        if self.inner.pager.read_only() {
            return Err(TurError::ReadOnly);
        }
        let index = Arc::new(HnswIndex::create(&self.inner.pager, dim, params)?);
        let pos = self.inner.pager.push_vector_root(index.meta_page());
        self.inner.vectors.write().push(Arc::clone(&index));
        Ok(VectorIndex {
            db: Arc::clone(&self.inner),
            index,
            pos,
        })
    }

    pub fn hnsw_open(&self, pos: usize) -> Result<VectorIndex> {
        self.ensure_open()?;
        let index = self
            .inner
            .vectors
            .read()
            .get(pos)
            .cloned()
            .ok_or(TurError::NotFound)?;
        Ok(VectorIndex {
            db: Arc::clone(&self.inner),
            index,
            pos,
        })
    }

    // --- Maintenance ---

    /// Flush everything and rewind the WAL.
    pub fn checkpoint(&self) -> Result<()> {
        self.ensure_open()?;
        let inner = &self.inner;
        if inner.pager.read_only() {
            return Ok(()); // nothing to flush, nothing to rewind
        }
        let _commit = inner.commit_lock.lock();
        let cancel = CancelToken::none();
        match &inner.wal {
            Some(wal) => checkpoint::run(&inner.pager, wal, &inner.manager, &cancel)?,
            None => {
                let horizon = inner.manager.safe_horizon();
                inner.pager.set_txn_horizon(horizon);
                inner.pager.flush_dirty(&cancel)?;
                inner.pager.sync()?;
                inner.manager.advance_horizon(horizon);
            }
        }
        inner.epoch.reclaim(|p| {
            let _ = inner.pager.free(p);
        });
        inner.checkpoints.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// One garbage-collection sweep over every tree's version chains.
    pub fn gc(&self) -> Result<crate::mvcc::gc::GcStats> {
        self.ensure_open()?;
        let inner = &self.inner;
        if inner.pager.read_only() {
            return Ok(crate::mvcc::gc::GcStats::default());
        }
        let cancel = CancelToken::none();
        let mut total = crate::mvcc::gc::GcStats::default();
        let handles: Vec<Arc<TreeHandle>> = inner.trees.read().values().cloned().collect();
        for handle in handles {
            let _latch = handle.latch.lock();
            let mut tree = BTree::open(handle.root.load(Ordering::Acquire));
            let stats = crate::mvcc::gc::collect(
                &mut tree,
                &inner.pager,
                &inner.epoch,
                &inner.manager,
                &cancel,
            )?;
            if tree.root() != handle.root.load(Ordering::Acquire) {
                handle.root.store(tree.root(), Ordering::Release);
                handle.dirty.store(true, Ordering::Release);
            }
            total.chains_scanned += stats.chains_scanned;
            total.versions_removed += stats.versions_removed;
            total.keys_removed += stats.keys_removed;
        }
        Ok(total)
    }

    /// Pin a transaction's snapshot against GC.
    pub fn create_snapshot(&self, txn: &Transaction) -> Result<crate::mvcc::SnapshotHandle> {
        self.ensure_open()?;
        Ok(self.inner.manager.create_snapshot(txn))
    }

    /// Full structural validation; findings come back as data.
    pub fn integrity_check(&self) -> Result<Vec<IntegrityError>> {
        self.integrity_check_with(&CancelToken::none())
    }

    pub fn integrity_check_with(&self, cancel: &CancelToken) -> Result<Vec<IntegrityError>> {
        self.ensure_open()?;
        let inner = &self.inner;
        if !inner.pager.read_only() {
            let _commit = inner.commit_lock.lock();
            inner.pager.flush_dirty(cancel)?;
            inner.pager.sync()?;
        }
        let _epoch = inner.epoch.enter();
        let directory = inner.directory.lock();
        let options = IntegrityOptions {
            foreign_keys: inner.foreign_keys.clone(),
        };
        integrity::integrity_check(
            &inner.pager,
            &directory,
            &inner.pager.vector_roots(),
            &options,
            cancel,
        )
    }

    /// Structure-only validation (key order + checksums).
    pub fn quick_check(&self) -> Result<Vec<IntegrityError>> {
        self.ensure_open()?;
        let inner = &self.inner;
        if !inner.pager.read_only() {
            let _commit = inner.commit_lock.lock();
            inner.pager.flush_dirty(&CancelToken::none())?;
            inner.pager.sync()?;
        }
        let _epoch = inner.epoch.enter();
        let directory = inner.directory.lock();
        integrity::quick_check(
            &inner.pager,
            &directory,
            &inner.pager.vector_roots(),
            &CancelToken::none(),
        )
    }

    /// Checkpoint and invalidate the handle.
    pub fn close(self) -> Result<()> {
        if !self.inner.pager.read_only() {
            self.checkpoint()?;
        }
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }

    /// Drop the handle without flushing anything: cached dirty pages vanish
    /// and only what the WAL holds survives, exactly as in a process crash.
    /// Test hook for crash-recovery scenarios.
    #[doc(hidden)]
    pub fn simulate_crash(self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

impl Drop for DbInner {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) || self.pager.read_only() {
            return;
        }
        // Best-effort durability on an un-closed handle.
        let cancel = CancelToken::none();
        let flushed = self
            .pager
            .flush_dirty(&cancel)
            .and_then(|_| self.pager.sync());
        if let Err(e) = flushed {
            warn!("flush on drop failed: {}", e);
        }
    }
}

// --- Tree handle ---

/// A named B+ tree with MVCC semantics layered over the raw key space.
pub struct Tree {
    db: Arc<DbInner>,
    handle: Arc<TreeHandle>,
}

impl Tree {
    pub fn name(&self) -> &str {
        &self.handle.name
    }

    fn ensure_open(&self) -> Result<()> {
        if self.db.closed.load(Ordering::Acquire) {
            return Err(TurError::Closed);
        }
        Ok(())
    }

    /// Read the version of `key` visible to `txn`.
    pub fn get(&self, txn: &Transaction, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_with(txn, key, &CancelToken::none())
    }

    pub fn get_with(
        &self,
        txn: &Transaction,
        key: &[u8],
        cancel: &CancelToken,
    ) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        txn.ensure_active()?;
        let _epoch = self.db.epoch.enter();
        let tree = BTree::open(self.handle.root.load(Ordering::Acquire));
        let Some(bytes) = tree.get(&self.db.pager, cancel, key)? else {
            return Ok(None);
        };
        let chain = decode_chain(&bytes)?;
        Ok(self
            .db
            .manager
            .visible_version(txn, &chain)
            .map(|v| v.data.clone()))
    }

    /// Write `value` under `key`. Fails with `WriteConflict` when another
    /// active transaction has a pending write on the same key.
    pub fn put(&self, txn: &mut Transaction, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with(txn, key, value, &CancelToken::none())
    }

    pub fn put_with(
        &self,
        txn: &mut Transaction,
        key: &[u8],
        value: &[u8],
        cancel: &CancelToken,
    ) -> Result<()> {
        self.mutate(txn, key, cancel, |chain, id| {
            chain_put(chain, id, value.to_vec());
            true
        })
        .map(|_| ())
    }

    /// Mark the live version deleted. Returns whether a live version existed.
    pub fn delete(&self, txn: &mut Transaction, key: &[u8]) -> Result<bool> {
        self.delete_with(txn, key, &CancelToken::none())
    }

    pub fn delete_with(
        &self,
        txn: &mut Transaction,
        key: &[u8],
        cancel: &CancelToken,
    ) -> Result<bool> {
        self.mutate(txn, key, cancel, |chain, id| chain_delete(chain, id))
    }

    fn mutate<F>(
        &self,
        txn: &mut Transaction,
        key: &[u8],
        cancel: &CancelToken,
        apply: F,
    ) -> Result<bool>
    where
        F: FnOnce(&mut Vec<crate::mvcc::version::RowVersion>, u64) -> bool,
    {
        self.ensure_open()?;
        txn.ensure_active()?;
        cancel.check()?;
        if self.db.pager.read_only() {
            return Err(TurError::ReadOnly);
        }
        self.db
            .manager
            .claim_write(txn, claim_key(&self.handle.name, key))?;

        let _latch = self.handle.latch.lock();
        let mut tree = BTree::open(self.handle.root.load(Ordering::Acquire));
        let mut chain = match tree.get(&self.db.pager, cancel, key)? {
            Some(bytes) => decode_chain(&bytes)?,
            None => Vec::new(),
        };
        let applied = apply(&mut chain, txn.id());
        if !applied {
            return Ok(false);
        }
        tree.insert(
            &self.db.pager,
            &self.db.epoch,
            cancel,
            key,
            &encode_chain(&chain),
        )?;
        self.handle.root.store(tree.root(), Ordering::Release);
        self.handle.dirty.store(true, Ordering::Release);
        txn.write_set.push(WriteRecord {
            tree: self.handle.name.clone(),
            key: key.to_vec(),
        });
        Ok(true)
    }

    /// Ordered cursor over the versions visible to `txn`, bound to the root
    /// snapshot at creation.
    pub fn cursor<'t>(&self, txn: &'t Transaction) -> Result<TreeCursor<'t>> {
        self.ensure_open()?;
        txn.ensure_active()?;
        let guard = self.db.epoch.enter();
        let cursor = Cursor::new(
            Arc::clone(&self.db.pager),
            self.handle.root.load(Ordering::Acquire),
            Some(guard),
            CancelToken::none(),
        );
        Ok(TreeCursor {
            cursor,
            manager: Arc::clone(&self.db.manager),
            txn,
        })
    }
}

/// MVCC-filtering cursor: yields only keys with a version visible to the
/// bound transaction, in ascending key order.
pub struct TreeCursor<'t> {
    cursor: Cursor,
    manager: Arc<TxnManager>,
    txn: &'t Transaction,
}

impl<'t> TreeCursor<'t> {
    pub fn first(&mut self) -> Result<bool> {
        if !self.cursor.first()? {
            return Ok(false);
        }
        self.settle_forward()
    }

    pub fn last(&mut self) -> Result<bool> {
        if !self.cursor.last()? {
            return Ok(false);
        }
        self.settle_backward()
    }

    pub fn seek(&mut self, key: &[u8]) -> Result<bool> {
        if !self.cursor.seek(key)? {
            return Ok(false);
        }
        self.settle_forward()
    }

    pub fn seek_exact(&mut self, key: &[u8]) -> Result<bool> {
        Ok(self.seek(key)? && self.cursor.key()? == Some(key))
    }

    pub fn next(&mut self) -> Result<bool> {
        if !self.cursor.next()? {
            return Ok(false);
        }
        self.settle_forward()
    }

    pub fn prev(&mut self) -> Result<bool> {
        if !self.cursor.prev()? {
            return Ok(false);
        }
        self.settle_backward()
    }

    pub fn valid(&self) -> bool {
        self.cursor.valid()
    }

    pub fn key(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.cursor.key()?.map(|k| k.to_vec()))
    }

    /// The visible version's data at the current position.
    pub fn value(&self) -> Result<Option<Vec<u8>>> {
        let Some(bytes) = self.cursor.value()? else {
            return Ok(None);
        };
        let chain = decode_chain(&bytes)?;
        Ok(self
            .manager
            .visible_version(self.txn, &chain)
            .map(|v| v.data.clone()))
    }

    pub fn close(&mut self) {
        self.cursor.close();
    }

    fn settle_forward(&mut self) -> Result<bool> {
        loop {
            if self.visible_here()? {
                return Ok(true);
            }
            if !self.cursor.next()? {
                return Ok(false);
            }
        }
    }

    fn settle_backward(&mut self) -> Result<bool> {
        loop {
            if self.visible_here()? {
                return Ok(true);
            }
            if !self.cursor.prev()? {
                return Ok(false);
            }
        }
    }

    fn visible_here(&self) -> Result<bool> {
        let Some(bytes) = self.cursor.value()? else {
            return Ok(false);
        };
        let chain = decode_chain(&bytes)?;
        Ok(self.manager.visible_version(self.txn, &chain).is_some())
    }
}

// --- Vector index handle ---

/// A vector index handle. Inserts are visible immediately in the graph;
/// the base table's MVCC decides whether a hit's rowid is visible.
pub struct VectorIndex {
    db: Arc<DbInner>,
    index: Arc<HnswIndex>,
    pos: usize,
}

impl VectorIndex {
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn dim(&self) -> usize {
        self.index.dim()
    }

    pub fn len(&self) -> u64 {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn insert(&self, txn: &Transaction, rowid: u64, vector: &[f32]) -> Result<()> {
        self.insert_with(txn, rowid, vector, &CancelToken::none())
    }

    pub fn insert_with(
        &self,
        txn: &Transaction,
        rowid: u64,
        vector: &[f32],
        cancel: &CancelToken,
    ) -> Result<()> {
        if self.db.closed.load(Ordering::Acquire) {
            return Err(TurError::Closed);
        }
        txn.ensure_active()?;
        if self.db.pager.read_only() {
            return Err(TurError::ReadOnly);
        }
        self.index
            .insert(&self.db.pager, &self.db.epoch, cancel, rowid, vector)
    }

    /// k-nearest rowids by ascending cosine distance.
    pub fn search(
        &self,
        txn: &Transaction,
        query: &[f32],
        k: usize,
        ef_search: usize,
    ) -> Result<Vec<(u64, f32)>> {
        self.search_with(txn, query, k, ef_search, &CancelToken::none())
    }

    pub fn search_with(
        &self,
        txn: &Transaction,
        query: &[f32],
        k: usize,
        ef_search: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<(u64, f32)>> {
        if self.db.closed.load(Ordering::Acquire) {
            return Err(TurError::Closed);
        }
        txn.ensure_active()?;
        self.index.search(cancel, query, k, ef_search)
    }

    /// Rebuild into fresh pages and swap atomically.
    pub fn rebuild(&self) -> Result<()> {
        if self.db.closed.load(Ordering::Acquire) {
            return Err(TurError::Closed);
        }
        self.index
            .rebuild(&self.db.pager, &self.db.epoch, &CancelToken::none())
    }
}
