//! MVCC transaction manager.
//!
//! One monotone 64-bit counter mints transaction ids, start timestamps and
//! commit timestamps: `begin` fetches the counter for `id == start_ts`,
//! `commit` fetches it again for `commit_ts`. Snapshot ordering falls out of
//! `start_ts` comparison.
//!
//! Version stamps at or below the persisted *horizon* (header field, advanced
//! at checkpoint) are known committed with `commit_ts = stamp`; everything
//! newer resolves through the in-memory transaction table. A stamp the table
//! has never seen belongs to a transaction that died before commit and is
//! treated as aborted.
//!
//! Write conflicts are detected eagerly: the first active transaction to
//! write a (tree, key) claims it; a second active writer gets `WriteConflict`
//! without disturbing the claimant, and only the offending write fails; the
//! transaction stays usable.

pub mod gc;
pub mod version;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, TurError};
use crate::mvcc::version::{RowVersion, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Committed(u64),
    Aborted,
}

/// A write claim: which tree and key a transaction has pending.
pub type ClaimKey = Vec<u8>;

pub fn claim_key(tree: &str, key: &[u8]) -> ClaimKey {
    let mut claim = Vec::with_capacity(tree.len() + 1 + key.len());
    claim.extend_from_slice(tree.as_bytes());
    claim.push(0);
    claim.extend_from_slice(key);
    claim
}

/// One undo record: enough to reverse a chain mutation on rollback.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub tree: String,
    pub key: Vec<u8>,
}

/// In-flight transaction handle.
pub struct Transaction {
    pub(crate) id: TxnId,
    pub(crate) start_ts: u64,
    pub(crate) state: TxnState,
    pub(crate) commit_ts: u64,
    pub(crate) write_set: Vec<WriteRecord>,
}

impl Transaction {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// 0 until committed.
    pub fn commit_ts(&self) -> u64 {
        self.commit_ts
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.state != TxnState::Active {
            return Err(TurError::TxDone);
        }
        Ok(())
    }
}

struct TxnTable {
    states: HashMap<TxnId, TxnStatus>,
    /// start_ts → number of active transactions begun there (always 1, the
    /// counter is unique; a map keeps min-lookup cheap).
    active: BTreeMap<u64, TxnId>,
    /// Snapshot pins blocking GC below their timestamp.
    pins: BTreeMap<u64, usize>,
    claims: HashMap<ClaimKey, TxnId>,
}

pub struct TxnManager {
    counter: AtomicU64,
    horizon: AtomicU64,
    table: Mutex<TxnTable>,
}

impl TxnManager {
    /// `horizon` is the persisted timestamp below which every stamp is known
    /// committed; the counter resumes just past it.
    pub fn new(horizon: u64) -> Arc<TxnManager> {
        Arc::new(TxnManager {
            counter: AtomicU64::new(horizon + 1),
            horizon: AtomicU64::new(horizon),
            table: Mutex::new(TxnTable {
                states: HashMap::new(),
                active: BTreeMap::new(),
                pins: BTreeMap::new(),
                claims: HashMap::new(),
            }),
        })
    }

    pub fn horizon(&self) -> u64 {
        self.horizon.load(Ordering::Acquire)
    }

    /// Advance the persisted-committed horizon (checkpoint time). Everything
    /// at or below the new horizon must be durably committed.
    pub fn advance_horizon(&self, horizon: u64) {
        self.horizon.fetch_max(horizon, Ordering::AcqRel);
    }

    /// Highest timestamp handed out so far.
    pub fn current_ts(&self) -> u64 {
        self.counter.load(Ordering::Acquire) - 1
    }

    pub fn begin(&self) -> Transaction {
        let ts = self.counter.fetch_add(1, Ordering::AcqRel);
        let mut table = self.table.lock();
        table.states.insert(ts, TxnStatus::Active);
        table.active.insert(ts, ts);
        Transaction {
            id: ts,
            start_ts: ts,
            state: TxnState::Active,
            commit_ts: 0,
            write_set: Vec::new(),
        }
    }

    /// Mint the commit timestamp and flip the transaction to Committed.
    /// The caller performs WAL durability before calling this.
    pub fn mark_committed(&self, txn: &mut Transaction) -> Result<u64> {
        txn.ensure_active()?;
        let commit_ts = self.counter.fetch_add(1, Ordering::AcqRel);
        let mut table = self.table.lock();
        table.states.insert(txn.id, TxnStatus::Committed(commit_ts));
        table.active.remove(&txn.start_ts);
        release_claims(&mut table, txn.id);
        txn.state = TxnState::Committed;
        txn.commit_ts = commit_ts;
        Ok(commit_ts)
    }

    pub fn mark_aborted(&self, txn: &mut Transaction) -> Result<()> {
        txn.ensure_active()?;
        let mut table = self.table.lock();
        table.states.insert(txn.id, TxnStatus::Aborted);
        table.active.remove(&txn.start_ts);
        release_claims(&mut table, txn.id);
        txn.state = TxnState::Aborted;
        Ok(())
    }

    /// Resolve a version stamp. The live table wins over the horizon
    /// shortcut: a transaction that committed *after* a still-active reader
    /// began carries a commit timestamp larger than its id, and the horizon
    /// approximation must not mask it.
    pub fn status(&self, stamp: TxnId) -> TxnStatus {
        if stamp == 0 {
            return TxnStatus::Aborted;
        }
        if let Some(status) = self.table.lock().states.get(&stamp) {
            return *status;
        }
        if stamp <= self.horizon() {
            return TxnStatus::Committed(stamp);
        }
        // Unknown above the horizon: the writer died before committing.
        TxnStatus::Aborted
    }

    /// Does `txn` see writes stamped `stamp`?
    fn sees(&self, txn: &Transaction, stamp: TxnId) -> bool {
        if stamp == txn.id {
            return true; // own writes, committed or not
        }
        matches!(self.status(stamp), TxnStatus::Committed(ts) if ts <= txn.start_ts)
    }

    /// The §visibility rule: creator visible, and no visible deleter.
    pub fn visible(&self, txn: &Transaction, version: &RowVersion) -> bool {
        if !self.sees(txn, version.created_by) {
            return false;
        }
        version.deleted_by == 0 || !self.sees(txn, version.deleted_by)
    }

    /// First visible version in a chain (chains are newest-first).
    pub fn visible_version<'a>(
        &self,
        txn: &Transaction,
        chain: &'a [RowVersion],
    ) -> Option<&'a RowVersion> {
        chain.iter().find(|v| self.visible(txn, v))
    }

    /// Claim (tree, key) for writing. Fails with `WriteConflict` when another
    /// active transaction holds the claim.
    pub fn claim_write(&self, txn: &Transaction, claim: ClaimKey) -> Result<()> {
        txn.ensure_active()?;
        let mut table = self.table.lock();
        match table.claims.get(&claim) {
            Some(&holder) if holder != txn.id => {
                if matches!(table.states.get(&holder), Some(TxnStatus::Active)) {
                    return Err(TurError::WriteConflict);
                }
                // Stale claim from a finished transaction.
                table.claims.insert(claim, txn.id);
                Ok(())
            }
            Some(_) => Ok(()),
            None => {
                table.claims.insert(claim, txn.id);
                Ok(())
            }
        }
    }

    /// Oldest timestamp any reader might still need: the floor for GC.
    pub fn gc_floor(&self) -> u64 {
        let table = self.table.lock();
        let min_active = table.active.keys().next().copied();
        let min_pin = table.pins.keys().next().copied();
        let next = self.counter.load(Ordering::Acquire);
        [min_active, min_pin]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(next)
    }

    /// Pin `txn`'s snapshot against garbage collection.
    pub fn create_snapshot(self: &Arc<Self>, txn: &Transaction) -> SnapshotHandle {
        let mut table = self.table.lock();
        *table.pins.entry(txn.start_ts).or_insert(0) += 1;
        SnapshotHandle {
            manager: Arc::clone(self),
            start_ts: txn.start_ts,
        }
    }

    /// Drop bookkeeping the horizon already answers for: finished entries
    /// whose id *and* commit timestamp sit at or below it. Anything else
    /// must stay: pruning it would flip a committed stamp to aborted (above
    /// the horizon) or backdate a commit (id below, commit above).
    pub fn prune_finished(&self) {
        let horizon = self.horizon();
        let mut table = self.table.lock();
        table.states.retain(|&id, status| match status {
            TxnStatus::Active => true,
            TxnStatus::Committed(ts) => id > horizon || *ts > horizon,
            TxnStatus::Aborted => id > horizon,
        });
    }

    /// Highest horizon safe to persist right now: every stamp at or below it
    /// must already be durably committed with its commit timestamp also at
    /// or below it. Active transactions cap it at their snapshot.
    pub fn safe_horizon(&self) -> u64 {
        let table = self.table.lock();
        match table.active.keys().next() {
            Some(&min_active) => min_active.saturating_sub(1),
            None => self.counter.load(Ordering::Acquire) - 1,
        }
    }

    pub fn active_count(&self) -> usize {
        self.table.lock().active.len()
    }
}

fn release_claims(table: &mut TxnTable, txn: TxnId) {
    table.claims.retain(|_, holder| *holder != txn);
}

/// Pins a snapshot's visibility against GC until dropped.
pub struct SnapshotHandle {
    manager: Arc<TxnManager>,
    start_ts: u64,
}

impl SnapshotHandle {
    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        let mut table = self.manager.table.lock();
        if let Some(count) = table.pins.get_mut(&self.start_ts) {
            *count -= 1;
            if *count == 0 {
                table.pins.remove(&self.start_ts);
            }
        }
    }
}
