//! Write-ahead log.
//!
//! Sidecar file `<db>-wal`. A 32-byte header is followed by fixed-size
//! frames, one per page image:
//!
//!   header: magic "TurDB-WAL-1" NUL-padded to 16 | page_size u32 | salt u32 | seed u64
//!   frame:  page_no u32 | tx_id u64 | crc u32 | commit_flag u8 | pad u8[3] | page_data[page_size]
//!
//! All integers big-endian. The frame checksum is CRC-32C over
//! `page_no ‖ tx_id ‖ commit_flag ‖ salt ‖ page_data`, so frames surviving
//! from an older WAL generation (different salt) never validate. A commit is
//! durable once its `commit_flag = 1` frame is fsynced; replay applies the
//! frame prefix up to the last valid commit frame and discards the tail.

pub mod checkpoint;
pub mod reader;
pub mod recovery;
pub mod writer;

pub const WAL_MAGIC: &[u8; 16] = b"TurDB-WAL-1\0\0\0\0\0";
pub const WAL_HEADER_SIZE: usize = 32;
pub const FRAME_HEADER_SIZE: usize = 20;

/// CRC-32C over the frame header fields, the WAL salt, and the page image.
pub fn frame_checksum(page_no: u32, tx_id: u64, commit_flag: u8, salt: u32, data: &[u8]) -> u32 {
    let mut crc = crc32c::crc32c(&page_no.to_be_bytes());
    crc = crc32c::crc32c_append(crc, &tx_id.to_be_bytes());
    crc = crc32c::crc32c_append(crc, &[commit_flag]);
    crc = crc32c::crc32c_append(crc, &salt.to_be_bytes());
    crc32c::crc32c_append(crc, data)
}
