//! Checkpoint: install WAL-resident committed pages into the main file and
//! rewind the log.
//!
//! Runs at close, on request, and when the log crosses the configured byte
//! or commit-count thresholds. Ordering: (1) stamp the header with the
//! highest safely-committed horizon, (2) flush every dirty page, (3) fsync
//! the main file, (4) start a fresh WAL generation. A crash between (3) and
//! (4) merely replays images the main file already has.
//!
//! The caller must hold the commit lock so no new frames race the rewind;
//! active write transactions cap the horizon at their snapshot but do not
//! block the flush.

use std::env;

use log::debug;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::mvcc::TxnManager;
use crate::storage::pager::Pager;
use crate::wal::writer::Wal;

const DEFAULT_WAL_BYTES_THRESHOLD: u64 = 4 * 1024 * 1024;
const DEFAULT_COMMITS_THRESHOLD: u64 = 1000;

/// When to checkpoint automatically. Environment variables override the
/// defaults: `TURDB_CHECKPOINT_WAL_BYTES`, `TURDB_CHECKPOINT_COMMITS`
/// (0 disables that trigger).
#[derive(Debug, Clone, Copy)]
pub struct CheckpointPolicy {
    pub wal_bytes_threshold: u64,
    pub commits_threshold: u64,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        CheckpointPolicy {
            wal_bytes_threshold: DEFAULT_WAL_BYTES_THRESHOLD,
            commits_threshold: DEFAULT_COMMITS_THRESHOLD,
        }
    }
}

impl CheckpointPolicy {
    pub fn from_env() -> CheckpointPolicy {
        CheckpointPolicy {
            wal_bytes_threshold: parse_env_u64(
                "TURDB_CHECKPOINT_WAL_BYTES",
                DEFAULT_WAL_BYTES_THRESHOLD,
            ),
            commits_threshold: parse_env_u64(
                "TURDB_CHECKPOINT_COMMITS",
                DEFAULT_COMMITS_THRESHOLD,
            ),
        }
    }

    pub fn due(&self, wal: &Wal) -> bool {
        (self.wal_bytes_threshold != 0 && wal.bytes() >= self.wal_bytes_threshold)
            || (self.commits_threshold != 0 && wal.commit_count() >= self.commits_threshold)
    }
}

fn parse_env_u64(name: &str, default: u64) -> u64 {
    match env::var(name) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(v) => v,
            Err(_) => {
                log::warn!("{} must be an integer, using default {}", name, default);
                default
            }
        },
        Err(_) => default,
    }
}

/// Run one checkpoint. Caller holds the commit lock.
///
/// The flush always happens. The horizon advance and the WAL rewind need a
/// quiet point: with a write transaction still active, its stamps sit in
/// shared pages and only the log's commit-id set can tell them apart from
/// committed ones at recovery, so the log must survive until the
/// transaction ends. Uncommitted pages flushed here are unreachable from
/// the last committed roots and harmless.
pub fn run(
    pager: &Pager,
    wal: &Wal,
    manager: &TxnManager,
    cancel: &CancelToken,
) -> Result<()> {
    cancel.check()?;
    let quiet = manager.active_count() == 0;
    if quiet {
        pager.set_txn_horizon(manager.safe_horizon());
    }

    pager.flush_dirty(cancel)?;
    pager.sync()?;

    if quiet {
        let horizon = manager.safe_horizon();
        wal.reset(manager.current_ts())?;
        manager.advance_horizon(horizon);
        manager.prune_finished();
        debug!("checkpoint: horizon advanced to {}", horizon);
    } else {
        debug!("checkpoint: flushed only, active transactions keep the log");
    }
    pager.remap()?;
    Ok(())
}
