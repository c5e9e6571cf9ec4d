//! Crash recovery: replay the WAL into the main file.
//!
//! Replay is prefix-based, like the commit protocol that produced the log:
//! every valid frame up to and including the last valid commit frame is
//! applied (latest image per page wins); the tail after it, written by a
//! transaction that crashed mid-commit, is discarded. A crash during recovery is
//! harmless: replaying the same prefix again writes the same bytes.
//!
//! Page images committed by one transaction can embed MVCC chain entries
//! stamped by transactions that never reached their commit frame. Replay
//! surfaces the recovered commit-id set so the caller can run the
//! post-recovery vacuum (`mvcc::gc::vacuum_uncommitted`) before the
//! database opens for traffic.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use log::info;

use crate::error::{Result, TurError};
use crate::storage::page::PageNo;
use crate::wal::reader::WalReader;

#[derive(Debug, Default)]
pub struct RecoveryResult {
    pub frames_scanned: usize,
    pub frames_applied: usize,
    pub pages_applied: usize,
    /// Transactions with a commit frame inside the applied prefix.
    pub committed: HashSet<u64>,
    /// Highest transaction stamp observed anywhere in the log (tail
    /// included); the timestamp counter must resume above it.
    pub max_stamp: u64,
    /// Frames after the last commit barrier, discarded.
    pub discarded_tail: usize,
}

/// Replay `wal_path` into `db_path`. Returns None when there is no log or
/// it contains nothing committed.
pub fn recover(db_path: &Path, wal_path: &Path) -> Result<Option<RecoveryResult>> {
    if !wal_path.exists() {
        return Ok(None);
    }
    let mut reader = WalReader::open(wal_path)?;
    let frames = reader.read_all()?;
    if frames.is_empty() {
        return Ok(None);
    }
    let page_size = reader.page_size();

    let mut result = RecoveryResult {
        frames_scanned: frames.len(),
        max_stamp: reader.seed(),
        ..RecoveryResult::default()
    };
    for frame in &frames {
        result.max_stamp = result.max_stamp.max(frame.tx_id);
    }

    let last_commit = match frames.iter().rposition(|f| f.commit) {
        Some(at) => at,
        None => {
            // Crash before any commit barrier: the whole log is tail.
            result.discarded_tail = frames.len();
            info!(
                "recovery: no commit barrier in {} frames, discarding log",
                frames.len()
            );
            return Ok(Some(result));
        }
    };
    result.discarded_tail = frames.len() - (last_commit + 1);

    // Latest image per page within the committed prefix.
    let mut latest: HashMap<PageNo, usize> = HashMap::new();
    for (i, frame) in frames.iter().take(last_commit + 1).enumerate() {
        latest.insert(frame.page_no, i);
        if frame.commit {
            result.committed.insert(frame.tx_id);
        }
    }
    result.frames_applied = last_commit + 1;

    let mut file = OpenOptions::new().read(true).write(true).open(db_path)?;
    let mut pages: Vec<(PageNo, usize)> = latest.into_iter().collect();
    pages.sort_unstable();
    for (page_no, frame_idx) in pages {
        let frame = &frames[frame_idx];
        if frame.data.len() != page_size {
            return Err(TurError::Wal(format!(
                "frame for page {} has size {}, expected {}",
                page_no,
                frame.data.len(),
                page_size
            )));
        }
        file.seek(SeekFrom::Start(page_no as u64 * page_size as u64))?;
        file.write_all(&frame.data)?;
        result.pages_applied += 1;
    }
    file.sync_all()?;

    info!(
        "recovery: applied {} pages from {} frames ({} committed tx, {} tail frames discarded)",
        result.pages_applied,
        result.frames_applied,
        result.committed.len(),
        result.discarded_tail
    );
    Ok(Some(result))
}

/// Truncate the WAL after recovery (or a clean checkpoint) and make the
/// truncation itself durable.
pub fn truncate_wal_durably(wal_path: &Path) -> Result<()> {
    let file = std::fs::File::create(wal_path)?;
    file.sync_all()?;
    if let Some(parent) = wal_path.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::storage::page::{Page, PageType, DEFAULT_PAGE_SIZE};
    use crate::storage::pager::{Pager, DEFAULT_CACHE_FRAMES};
    use crate::wal::writer::Wal;
    use tempfile::TempDir;

    fn sealed_page(no: PageNo, fill: u8) -> Page {
        let mut page = Page::with_type(no, DEFAULT_PAGE_SIZE, PageType::BtreeLeaf);
        page.data_mut()[200] = fill;
        page.seal();
        page
    }

    fn create_db(path: &Path) {
        let pager = Pager::create(path, DEFAULT_PAGE_SIZE, DEFAULT_CACHE_FRAMES, false).unwrap();
        pager.flush_dirty(&CancelToken::none()).unwrap();
        pager.sync().unwrap();
    }

    #[test]
    fn committed_frames_are_applied() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("t.db");
        let wal_path = dir.path().join("t-wal");
        create_db(&db_path);

        {
            let wal = Wal::create(&wal_path, DEFAULT_PAGE_SIZE, 1).unwrap();
            wal.append_page(2, &sealed_page(1, 0x11), false).unwrap();
            wal.append_page(2, &sealed_page(2, 0x22), true).unwrap();
            wal.sync().unwrap();
        }

        let result = recover(&db_path, &wal_path).unwrap().unwrap();
        assert_eq!(result.pages_applied, 2);
        assert!(result.committed.contains(&2));
        assert_eq!(result.discarded_tail, 0);

        let bytes = std::fs::read(&db_path).unwrap();
        assert_eq!(bytes[DEFAULT_PAGE_SIZE + 200], 0x11);
        assert_eq!(bytes[2 * DEFAULT_PAGE_SIZE + 200], 0x22);
    }

    #[test]
    fn frames_after_last_commit_are_discarded() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("t.db");
        let wal_path = dir.path().join("t-wal");
        create_db(&db_path);

        {
            let wal = Wal::create(&wal_path, DEFAULT_PAGE_SIZE, 1).unwrap();
            wal.append_page(2, &sealed_page(1, 0x11), true).unwrap();
            // A second transaction wrote frames but crashed before commit.
            wal.append_page(3, &sealed_page(2, 0x33), false).unwrap();
            wal.sync().unwrap();
        }

        let result = recover(&db_path, &wal_path).unwrap().unwrap();
        assert_eq!(result.pages_applied, 1);
        assert_eq!(result.discarded_tail, 1);
        assert!(!result.committed.contains(&3));
        // The uncommitted page never reached the main file.
        let bytes = std::fs::read(&db_path).unwrap();
        assert!(bytes.len() < 3 * DEFAULT_PAGE_SIZE || bytes[2 * DEFAULT_PAGE_SIZE + 200] != 0x33);
    }

    #[test]
    fn no_commit_barrier_discards_everything() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("t.db");
        let wal_path = dir.path().join("t-wal");
        create_db(&db_path);
        let before = std::fs::read(&db_path).unwrap();

        {
            let wal = Wal::create(&wal_path, DEFAULT_PAGE_SIZE, 1).unwrap();
            wal.append_page(2, &sealed_page(1, 0x44), false).unwrap();
            wal.sync().unwrap();
        }

        let result = recover(&db_path, &wal_path).unwrap().unwrap();
        assert_eq!(result.pages_applied, 0);
        assert_eq!(result.discarded_tail, 1);
        assert_eq!(std::fs::read(&db_path).unwrap(), before);
    }

    #[test]
    fn replay_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("t.db");
        let wal_path = dir.path().join("t-wal");
        create_db(&db_path);

        {
            let wal = Wal::create(&wal_path, DEFAULT_PAGE_SIZE, 1).unwrap();
            wal.append_page(2, &sealed_page(1, 0x55), true).unwrap();
            wal.sync().unwrap();
        }

        recover(&db_path, &wal_path).unwrap().unwrap();
        let first = std::fs::read(&db_path).unwrap();
        recover(&db_path, &wal_path).unwrap().unwrap();
        assert_eq!(std::fs::read(&db_path).unwrap(), first);
    }

    #[test]
    fn missing_wal_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("t.db");
        create_db(&db_path);
        assert!(recover(&db_path, &dir.path().join("none-wal"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn max_stamp_covers_discarded_tail() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("t.db");
        let wal_path = dir.path().join("t-wal");
        create_db(&db_path);

        {
            let wal = Wal::create(&wal_path, DEFAULT_PAGE_SIZE, 5).unwrap();
            wal.append_page(7, &sealed_page(1, 1), true).unwrap();
            wal.append_page(99, &sealed_page(2, 2), false).unwrap(); // tail
            wal.sync().unwrap();
        }
        let result = recover(&db_path, &wal_path).unwrap().unwrap();
        assert_eq!(result.max_stamp, 99);
    }
}
