//! WAL reader: frame iteration with torn-tail tolerance.
//!
//! Frames are fixed-size, so the scan walks the file in strides. A frame
//! that fails its checksum ends the log, unless a valid frame exists
//! further ahead, in which case the damage is mid-log and recovery must not
//! silently drop committed records: that is a hard error. A short frame at
//! the end of the file is always a torn tail and is discarded.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Result, TurError};
use crate::storage::page::PageNo;
use crate::wal::{frame_checksum, FRAME_HEADER_SIZE, WAL_HEADER_SIZE, WAL_MAGIC};

#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub page_no: PageNo,
    pub tx_id: u64,
    pub commit: bool,
    pub data: Vec<u8>,
}

pub struct WalReader {
    file: File,
    page_size: usize,
    salt: u32,
    seed: u64,
    file_len: u64,
    pos: u64,
}

impl WalReader {
    /// Open a WAL for scanning. An empty or header-only file yields a reader
    /// that returns no frames.
    pub fn open(path: &Path) -> Result<WalReader> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < WAL_HEADER_SIZE as u64 {
            // Truncated before the header made it out; nothing to replay.
            return Ok(WalReader {
                file,
                page_size: 0,
                salt: 0,
                seed: 0,
                file_len,
                pos: file_len,
            });
        }
        let mut header = [0u8; WAL_HEADER_SIZE];
        file.read_exact(&mut header)?;
        if &header[0..16] != WAL_MAGIC {
            return Err(TurError::Wal("bad WAL magic".into()));
        }
        let page_size = u32::from_be_bytes(header[16..20].try_into().unwrap()) as usize;
        let salt = u32::from_be_bytes(header[20..24].try_into().unwrap());
        let seed = u64::from_be_bytes(header[24..32].try_into().unwrap());
        Ok(WalReader {
            file,
            page_size,
            salt,
            seed,
            file_len,
            pos: WAL_HEADER_SIZE as u64,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn salt(&self) -> u32 {
        self.salt
    }

    /// Timestamp counter recorded at WAL creation.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn frame_size(&self) -> u64 {
        (FRAME_HEADER_SIZE + self.page_size) as u64
    }

    /// Next frame, or None at the (possibly torn) end of the log.
    pub fn next_frame(&mut self) -> Result<Option<FrameRecord>> {
        if self.page_size == 0 {
            return Ok(None);
        }
        match self.read_frame_at(self.pos)? {
            FrameScan::Valid(frame) => {
                self.pos += self.frame_size();
                Ok(Some(frame))
            }
            FrameScan::Short => Ok(None),
            FrameScan::BadChecksum => {
                if self.has_valid_frame_after(self.pos + self.frame_size())? {
                    Err(TurError::Wal(format!(
                        "WAL frame at offset {} fails its checksum (mid-log corruption)",
                        self.pos
                    )))
                } else {
                    Ok(None) // torn tail
                }
            }
        }
    }

    pub fn read_all(&mut self) -> Result<Vec<FrameRecord>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn read_frame_at(&mut self, offset: u64) -> Result<FrameScan> {
        if self.file_len < offset + self.frame_size() {
            return Ok(FrameScan::Short);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.file.read_exact(&mut header)?;
        let page_no = u32::from_be_bytes(header[0..4].try_into().unwrap());
        let tx_id = u64::from_be_bytes(header[4..12].try_into().unwrap());
        let stored_crc = u32::from_be_bytes(header[12..16].try_into().unwrap());
        let commit_flag = header[16];

        let mut data = vec![0u8; self.page_size];
        self.file.read_exact(&mut data)?;

        if commit_flag > 1
            || frame_checksum(page_no, tx_id, commit_flag, self.salt, &data) != stored_crc
        {
            return Ok(FrameScan::BadChecksum);
        }
        Ok(FrameScan::Valid(FrameRecord {
            page_no,
            tx_id,
            commit: commit_flag == 1,
            data,
        }))
    }

    /// Probe the remaining strides for any valid frame. Distinguishes a
    /// tolerable torn tail from hard mid-log corruption.
    fn has_valid_frame_after(&mut self, mut offset: u64) -> Result<bool> {
        while self.file_len >= offset + self.frame_size() {
            if matches!(self.read_frame_at(offset)?, FrameScan::Valid(_)) {
                return Ok(true);
            }
            offset += self.frame_size();
        }
        Ok(false)
    }
}

enum FrameScan {
    Valid(FrameRecord),
    Short,
    BadChecksum,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{Page, PageType, DEFAULT_PAGE_SIZE};
    use crate::wal::writer::Wal;
    use std::io::Write;
    use tempfile::TempDir;

    fn sealed_page(no: PageNo, fill: u8) -> Page {
        let mut page = Page::with_type(no, DEFAULT_PAGE_SIZE, PageType::BtreeLeaf);
        page.data_mut()[100] = fill;
        page.seal();
        page
    }

    fn write_frames(path: &std::path::Path) -> u64 {
        let wal = Wal::create(path, DEFAULT_PAGE_SIZE, 7).unwrap();
        wal.append_page(1, &sealed_page(3, 0xA1), false).unwrap();
        wal.append_page(1, &sealed_page(4, 0xA2), true).unwrap();
        wal.sync().unwrap();
        wal.bytes()
    }

    #[test]
    fn roundtrip_read_all() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t-wal");
        write_frames(&path);

        let mut reader = WalReader::open(&path).unwrap();
        assert_eq!(reader.seed(), 7);
        let frames = reader.read_all().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].page_no, 3);
        assert!(!frames[0].commit);
        assert!(frames[1].commit);
        assert_eq!(frames[1].data[100], 0xA2);
    }

    #[test]
    fn torn_tail_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t-wal");
        write_frames(&path);

        // Append half a frame of garbage.
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&vec![0xEE; FRAME_HEADER_SIZE + 100]).unwrap();
        file.sync_all().unwrap();

        let mut reader = WalReader::open(&path).unwrap();
        assert_eq!(reader.read_all().unwrap().len(), 2);
    }

    #[test]
    fn full_frame_of_garbage_at_tail_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t-wal");
        write_frames(&path);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&vec![0xEE; FRAME_HEADER_SIZE + DEFAULT_PAGE_SIZE])
            .unwrap();
        file.sync_all().unwrap();

        let mut reader = WalReader::open(&path).unwrap();
        assert_eq!(reader.read_all().unwrap().len(), 2);
    }

    #[test]
    fn mid_log_corruption_is_a_hard_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t-wal");
        write_frames(&path);

        // Flip a byte inside the FIRST frame's payload; a valid frame follows.
        let mut bytes = std::fs::read(&path).unwrap();
        let at = WAL_HEADER_SIZE + FRAME_HEADER_SIZE + 512;
        bytes[at] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = WalReader::open(&path).unwrap();
        let result = reader.read_all();
        assert!(matches!(result, Err(TurError::Wal(_))));
    }

    #[test]
    fn stale_generation_frames_never_validate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t-wal");
        write_frames(&path);
        let old_bytes = std::fs::read(&path).unwrap();

        // New generation (fresh salt), then splice an old-generation frame
        // behind a new valid frame: the old salt fails the checksum.
        let wal = Wal::create(&path, DEFAULT_PAGE_SIZE, 9).unwrap();
        wal.append_page(2, &sealed_page(5, 0xB1), true).unwrap();
        wal.sync().unwrap();
        drop(wal);

        let mut new_bytes = std::fs::read(&path).unwrap();
        new_bytes.extend_from_slice(&old_bytes[WAL_HEADER_SIZE..WAL_HEADER_SIZE + FRAME_HEADER_SIZE + DEFAULT_PAGE_SIZE]);
        std::fs::write(&path, &new_bytes).unwrap();

        let mut reader = WalReader::open(&path).unwrap();
        let frames = reader.read_all().unwrap();
        assert_eq!(frames.len(), 1, "stale frame must read as torn tail");
        assert_eq!(frames[0].page_no, 5);
    }

    #[test]
    fn empty_file_yields_no_frames() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t-wal");
        std::fs::write(&path, b"").unwrap();
        let mut reader = WalReader::open(&path).unwrap();
        assert!(reader.next_frame().unwrap().is_none());
    }
}
