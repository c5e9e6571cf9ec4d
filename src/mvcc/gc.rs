//! Version-chain garbage collection and the post-recovery vacuum.
//!
//! GC walks a tree's chains and unlinks versions no current or future
//! snapshot can reach: aborted versions, and versions whose deleter
//! committed below the GC floor (the oldest active or pinned snapshot).
//! Chains that empty out lose their key. The storage comes back through the
//! usual COW retire path.
//!
//! The vacuum runs once after WAL replay: page images written by committed
//! transactions can embed chain entries stamped by transactions that never
//! committed before the crash. Those stamps sit above the persisted horizon
//! and outside the replayed commit set, so they are stripped; after that
//! every surviving stamp is committed and the horizon can advance past all
//! of them.

use std::collections::HashSet;
use std::sync::Arc;

use log::debug;

use crate::btree::ops::BTree;
use crate::cancel::CancelToken;
use crate::concurrency::epoch::EpochManager;
use crate::error::Result;
use crate::mvcc::version::{decode_chain, encode_chain, RowVersion, TxnId};
use crate::mvcc::{TxnManager, TxnStatus};
use crate::storage::pager::Pager;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub chains_scanned: u64,
    pub versions_removed: u64,
    pub keys_removed: u64,
}

/// One GC sweep over a tree. Returns what was collected.
pub fn collect(
    tree: &mut BTree,
    pager: &Pager,
    epoch: &Arc<EpochManager>,
    manager: &TxnManager,
    cancel: &CancelToken,
) -> Result<GcStats> {
    let floor = manager.gc_floor();
    let mut stats = GcStats::default();
    let mut edits: Vec<(Vec<u8>, Option<Vec<u8>>)> = Vec::new();

    tree.scan(pager, cancel, |key, value| {
        stats.chains_scanned += 1;
        let chain = decode_chain(value)?;
        let kept: Vec<RowVersion> = chain
            .iter()
            .filter(|v| !collectable(manager, floor, v))
            .cloned()
            .collect();
        if kept.len() != chain.len() {
            stats.versions_removed += (chain.len() - kept.len()) as u64;
            if kept.is_empty() {
                stats.keys_removed += 1;
                edits.push((key.to_vec(), None));
            } else {
                edits.push((key.to_vec(), Some(encode_chain(&kept))));
            }
        }
        Ok(true)
    })?;

    for (key, replacement) in edits {
        cancel.check()?;
        match replacement {
            Some(bytes) => tree.insert(pager, epoch, cancel, &key, &bytes)?,
            None => {
                tree.delete(pager, epoch, cancel, &key)?;
            }
        }
    }
    if stats.versions_removed > 0 {
        debug!(
            "gc: removed {} versions ({} whole keys) across {} chains",
            stats.versions_removed, stats.keys_removed, stats.chains_scanned
        );
    }
    Ok(stats)
}

fn collectable(manager: &TxnManager, floor: u64, version: &RowVersion) -> bool {
    match manager.status(version.created_by) {
        TxnStatus::Aborted => return true,
        TxnStatus::Active => return false,
        TxnStatus::Committed(_) => {}
    }
    if version.deleted_by == 0 {
        return false;
    }
    match manager.status(version.deleted_by) {
        // Deleter committed before every snapshot that could still look:
        // nobody can ever see this version again.
        TxnStatus::Committed(ts) => ts < floor,
        _ => false,
    }
}

/// Strip stamps left behind by transactions that never committed before a
/// crash. `committed` is the id set recovered from the WAL's commit frames;
/// `horizon` is the persisted pre-crash horizon.
pub fn vacuum_uncommitted(
    tree: &mut BTree,
    pager: &Pager,
    epoch: &Arc<EpochManager>,
    horizon: u64,
    committed: &HashSet<TxnId>,
    cancel: &CancelToken,
) -> Result<GcStats> {
    let mut stats = GcStats::default();
    let mut edits: Vec<(Vec<u8>, Option<Vec<u8>>)> = Vec::new();
    let is_committed = |stamp: TxnId| stamp <= horizon || committed.contains(&stamp);

    tree.scan(pager, cancel, |key, value| {
        stats.chains_scanned += 1;
        let chain = decode_chain(value)?;
        let mut kept = Vec::with_capacity(chain.len());
        let mut changed = false;
        for mut version in chain {
            if !is_committed(version.created_by) {
                changed = true;
                stats.versions_removed += 1;
                continue;
            }
            if version.deleted_by != 0 && !is_committed(version.deleted_by) {
                version.deleted_by = 0;
                changed = true;
            }
            kept.push(version);
        }
        if changed {
            if kept.is_empty() {
                stats.keys_removed += 1;
                edits.push((key.to_vec(), None));
            } else {
                edits.push((key.to_vec(), Some(encode_chain(&kept))));
            }
        }
        Ok(true)
    })?;

    for (key, replacement) in edits {
        cancel.check()?;
        match replacement {
            Some(bytes) => tree.insert(pager, epoch, cancel, &key, &bytes)?,
            None => {
                tree.delete(pager, epoch, cancel, &key)?;
            }
        }
    }
    Ok(stats)
}
