//! Database header, stored in page 0.
//!
//! Layout (big-endian):
//!
//!   0..16   magic "TurDB format 1\0" NUL-padded to 16 bytes
//!   16..20  page_size u32
//!   20..24  format version u32
//!   24..28  schema root page u32 (tree-directory B-tree)
//!   28..32  free-list head page u32 (0 = empty)
//!   32..36  vector-index roots count u32
//!   36..    count * u32 HNSW metadata page numbers
//!   then    txn horizon u64 (highest timestamp known committed)
//!
//! The page ends with the usual CRC-32C trailer. `page_count` is derived
//! from the file length and deliberately not stored.

use crate::error::{Result, TurError};
use crate::storage::page::{Page, PageNo, PAGE_TRAILER_SIZE};

pub const DB_MAGIC: &[u8; 16] = b"TurDB format 1\0\0";
pub const DB_FORMAT_VERSION: u32 = 1;

const FIXED_LEN: usize = 36;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbHeader {
    pub page_size: u32,
    pub version: u32,
    /// Root of the tree-directory B-tree (0 = not yet created).
    pub schema_root: PageNo,
    /// Head of the on-disk free-page chain (0 = empty).
    pub freelist_head: PageNo,
    /// HNSW metadata pages, one per vector index, in creation order.
    pub vector_roots: Vec<PageNo>,
    /// Every version stamp at or below this timestamp is known committed.
    pub txn_horizon: u64,
}

impl DbHeader {
    pub fn new(page_size: u32) -> Self {
        DbHeader {
            page_size,
            version: DB_FORMAT_VERSION,
            schema_root: 0,
            freelist_head: 0,
            vector_roots: Vec::new(),
            txn_horizon: 0,
        }
    }

    /// Serialize into page 0. The trailer is left for the pager to seal.
    pub fn write_to(&self, page: &mut Page) {
        let data = page.data_mut();
        data[..FIXED_LEN + self.vector_roots.len() * 4 + 8].fill(0);
        data[0..16].copy_from_slice(DB_MAGIC);
        data[16..20].copy_from_slice(&self.page_size.to_be_bytes());
        data[20..24].copy_from_slice(&self.version.to_be_bytes());
        data[24..28].copy_from_slice(&self.schema_root.to_be_bytes());
        data[28..32].copy_from_slice(&self.freelist_head.to_be_bytes());
        data[32..36].copy_from_slice(&(self.vector_roots.len() as u32).to_be_bytes());
        let mut at = FIXED_LEN;
        for &root in &self.vector_roots {
            data[at..at + 4].copy_from_slice(&root.to_be_bytes());
            at += 4;
        }
        data[at..at + 8].copy_from_slice(&self.txn_horizon.to_be_bytes());
    }

    /// Parse the header out of page 0.
    pub fn read_from(page: &Page) -> Result<DbHeader> {
        let data = page.data();
        if data.len() < FIXED_LEN + 8 + PAGE_TRAILER_SIZE {
            return Err(TurError::BadFormat("header page too small".into()));
        }
        if &data[0..16] != DB_MAGIC {
            return Err(TurError::BadFormat("bad magic".into()));
        }
        let page_size = u32::from_be_bytes(data[16..20].try_into().unwrap());
        let version = u32::from_be_bytes(data[20..24].try_into().unwrap());
        if version > DB_FORMAT_VERSION {
            return Err(TurError::BadFormat(format!(
                "unsupported format version {}",
                version
            )));
        }
        let schema_root = u32::from_be_bytes(data[24..28].try_into().unwrap());
        let freelist_head = u32::from_be_bytes(data[28..32].try_into().unwrap());
        let count = u32::from_be_bytes(data[32..36].try_into().unwrap()) as usize;

        let mut at = FIXED_LEN;
        if data.len() < at + count * 4 + 8 + PAGE_TRAILER_SIZE {
            return Err(TurError::BadFormat("vector root array overflows header".into()));
        }
        let mut vector_roots = Vec::with_capacity(count);
        for _ in 0..count {
            vector_roots.push(u32::from_be_bytes(data[at..at + 4].try_into().unwrap()));
            at += 4;
        }
        let txn_horizon = u64::from_be_bytes(data[at..at + 8].try_into().unwrap());

        Ok(DbHeader {
            page_size,
            version,
            schema_root,
            freelist_head,
            vector_roots,
            txn_horizon,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::DEFAULT_PAGE_SIZE;

    #[test]
    fn header_roundtrip() {
        let mut header = DbHeader::new(DEFAULT_PAGE_SIZE as u32);
        header.schema_root = 3;
        header.freelist_head = 9;
        header.vector_roots = vec![12, 44];
        header.txn_horizon = 77;

        let mut page = Page::new(0, DEFAULT_PAGE_SIZE);
        header.write_to(&mut page);
        let parsed = DbHeader::read_from(&page).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut page = Page::new(0, DEFAULT_PAGE_SIZE);
        DbHeader::new(DEFAULT_PAGE_SIZE as u32).write_to(&mut page);
        page.data_mut()[0] = b'X';
        assert!(matches!(
            DbHeader::read_from(&page),
            Err(TurError::BadFormat(_))
        ));
    }

    #[test]
    fn future_version_rejected() {
        let mut page = Page::new(0, DEFAULT_PAGE_SIZE);
        let mut header = DbHeader::new(DEFAULT_PAGE_SIZE as u32);
        header.version = DB_FORMAT_VERSION + 1;
        header.write_to(&mut page);
        assert!(DbHeader::read_from(&page).is_err());
    }
}
