//! WAL writer: append-only frames plus an in-memory page index.
//!
//! Besides appending, the writer keeps a map of page number → file offset of
//! the latest frame for that page. The pager consults it on cache misses so
//! that pages spilled to the log (dirty-frame eviction) or committed but not
//! yet checkpointed are read back from the log, never stale from the main
//! file.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::Rng;

use crate::error::{Result, TurError};
use crate::storage::page::{Page, PageNo, LARGE_PAGE_SIZE};
use crate::wal::{frame_checksum, FRAME_HEADER_SIZE, WAL_HEADER_SIZE, WAL_MAGIC};

pub struct Wal {
    path: PathBuf,
    page_size: usize,
    inner: Mutex<WalInner>,
}

struct WalInner {
    file: File,
    salt: u32,
    seed: u64,
    /// Current file length in bytes.
    bytes: u64,
    frames: u64,
    commits: u64,
    /// page → offset of the latest frame's page_data.
    index: HashMap<PageNo, u64>,
}

impl Wal {
    /// Create a fresh (truncated) WAL. `seed` records the timestamp counter
    /// at creation so recovery can resume the counter monotonically.
    pub fn create(path: &Path, page_size: usize, seed: u64) -> Result<Wal> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let salt: u32 = rand::thread_rng().gen();
        write_header(&mut file, page_size, salt, seed)?;
        file.sync_all()?;
        Ok(Wal {
            path: path.to_path_buf(),
            page_size,
            inner: Mutex::new(WalInner {
                file,
                salt,
                seed,
                bytes: WAL_HEADER_SIZE as u64,
                frames: 0,
                commits: 0,
                index: HashMap::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn salt(&self) -> u32 {
        self.inner.lock().salt
    }

    pub fn seed(&self) -> u64 {
        self.inner.lock().seed
    }

    /// Total bytes in the log, header included.
    pub fn bytes(&self) -> u64 {
        self.inner.lock().bytes
    }

    pub fn commit_count(&self) -> u64 {
        self.inner.lock().commits
    }

    pub fn frame_count(&self) -> u64 {
        self.inner.lock().frames
    }

    /// Append one page image. Large (64 KiB) pages are logged as a run of
    /// page-size chunks with consecutive page numbers; `commit_last` raises
    /// the commit flag on the final chunk only.
    pub fn append_page(&self, tx_id: u64, page: &Page, commit_last: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let data = page.data();
        if data.len() == self.page_size {
            self.append_frame(&mut inner, page.no(), tx_id, commit_last, data)
        } else if data.len() == LARGE_PAGE_SIZE {
            let chunks = LARGE_PAGE_SIZE / self.page_size;
            for i in 0..chunks {
                let chunk = &data[i * self.page_size..(i + 1) * self.page_size];
                let commit = commit_last && i == chunks - 1;
                self.append_frame(&mut inner, page.no() + i as u32, tx_id, commit, chunk)?;
            }
            Ok(())
        } else {
            Err(TurError::Wal(format!(
                "page {} has unloggable size {}",
                page.no(),
                data.len()
            )))
        }
    }

    /// Append a bare commit barrier re-framing `page`'s current image.
    /// Used when a commit has an empty write set but must still be durable.
    pub fn append_commit_marker(&self, tx_id: u64, page: &Page) -> Result<()> {
        self.append_page(tx_id, page, true)
    }

    fn append_frame(
        &self,
        inner: &mut WalInner,
        page_no: PageNo,
        tx_id: u64,
        commit: bool,
        data: &[u8],
    ) -> Result<()> {
        debug_assert_eq!(data.len(), self.page_size);
        let commit_flag = u8::from(commit);
        let crc = frame_checksum(page_no, tx_id, commit_flag, inner.salt, data);

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[0..4].copy_from_slice(&page_no.to_be_bytes());
        header[4..12].copy_from_slice(&tx_id.to_be_bytes());
        header[12..16].copy_from_slice(&crc.to_be_bytes());
        header[16] = commit_flag;

        inner.file.seek(SeekFrom::Start(inner.bytes))?;
        inner.file.write_all(&header)?;
        inner.file.write_all(data)?;

        let data_offset = inner.bytes + FRAME_HEADER_SIZE as u64;
        inner.index.insert(page_no, data_offset);
        inner.bytes += (FRAME_HEADER_SIZE + self.page_size) as u64;
        inner.frames += 1;
        if commit {
            inner.commits += 1;
        }
        Ok(())
    }

    /// Fsync the log. The commit protocol calls this after the commit frame.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }

    /// Latest logged image offset for a page, if any.
    pub fn lookup(&self, page_no: PageNo) -> Option<u64> {
        self.inner.lock().index.get(&page_no).copied()
    }

    /// Read a page image previously located with [`Wal::lookup`].
    pub fn read_page_data(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(buf)?;
        Ok(())
    }

    /// Pages currently carried by the log, with their latest image offsets.
    pub fn indexed_pages(&self) -> Vec<(PageNo, u64)> {
        let inner = self.inner.lock();
        let mut pages: Vec<(PageNo, u64)> = inner.index.iter().map(|(&p, &o)| (p, o)).collect();
        pages.sort_unstable_by_key(|&(p, _)| p);
        pages
    }

    /// Start a new WAL generation: truncate, fresh salt, clear the index.
    /// Called after a checkpoint has made the main file current.
    pub fn reset(&self, seed: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.set_len(0)?;
        let salt: u32 = rand::thread_rng().gen();
        write_header(&mut inner.file, self.page_size, salt, seed)?;
        inner.file.sync_all()?;
        inner.salt = salt;
        inner.seed = seed;
        inner.bytes = WAL_HEADER_SIZE as u64;
        inner.frames = 0;
        inner.commits = 0;
        inner.index.clear();
        Ok(())
    }
}

fn write_header(file: &mut File, page_size: usize, salt: u32, seed: u64) -> Result<()> {
    let mut header = [0u8; WAL_HEADER_SIZE];
    header[0..16].copy_from_slice(WAL_MAGIC);
    header[16..20].copy_from_slice(&(page_size as u32).to_be_bytes());
    header[20..24].copy_from_slice(&salt.to_be_bytes());
    header[24..32].copy_from_slice(&seed.to_be_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    Ok(())
}
