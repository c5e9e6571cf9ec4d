//! Structural validation.
//!
//! Non-destructive scans that return findings as data; the check surface
//! never throws for a structural problem, only for an I/O failure that stops
//! it from looking. An empty report means healthy.
//!
//! Full check: (a) every tree's keys strictly ascending under byte order,
//! (b) every index tree's cardinality matches its base table, (c) declared
//! foreign keys resolve, (d) every page's checksum validates against the
//! bytes on disk. Quick check: (a) and (d) only.

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::btree::directory::{TreeDirectory, TreeKind};
use crate::btree::ops::BTree;
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::hnsw::node::decode_meta;
use crate::storage::page::{PageNo, LARGE_PAGE_SIZE, PAGE_TRAILER_SIZE};
use crate::storage::pager::Pager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityKind {
    KeyOrder,
    Cardinality,
    ForeignKey,
    Checksum,
}

#[derive(Debug, Clone)]
pub struct IntegrityError {
    pub kind: IntegrityKind,
    pub table: Option<String>,
    pub index: Option<String>,
    pub page: Option<PageNo>,
    pub message: String,
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// A declared foreign key at the storage level: every key of the child
/// index tree must exist as a key of the parent tree.
#[derive(Debug, Clone)]
pub struct FkSpec {
    pub child_index: String,
    pub parent_table: String,
}

#[derive(Debug, Default, Clone)]
pub struct IntegrityOptions {
    pub foreign_keys: Vec<FkSpec>,
}

/// Full integrity check.
pub fn integrity_check(
    pager: &Pager,
    directory: &TreeDirectory,
    vector_roots: &[PageNo],
    options: &IntegrityOptions,
    cancel: &CancelToken,
) -> Result<Vec<IntegrityError>> {
    let mut errors = Vec::new();
    let entries = directory.list(pager)?;

    for (name, meta) in &entries {
        check_key_order(pager, name, meta.kind, meta.root, cancel, &mut errors)?;
    }
    check_cardinality(pager, &entries, cancel, &mut errors)?;
    for fk in &options.foreign_keys {
        check_foreign_key(pager, directory, fk, cancel, &mut errors)?;
    }
    check_checksums(pager, vector_roots, cancel, &mut errors)?;
    Ok(errors)
}

/// Structure-only check: key order and checksums.
pub fn quick_check(
    pager: &Pager,
    directory: &TreeDirectory,
    vector_roots: &[PageNo],
    cancel: &CancelToken,
) -> Result<Vec<IntegrityError>> {
    let mut errors = Vec::new();
    for (name, meta) in directory.list(pager)? {
        check_key_order(pager, &name, meta.kind, meta.root, cancel, &mut errors)?;
    }
    check_checksums(pager, vector_roots, cancel, &mut errors)?;
    Ok(errors)
}

fn locate(kind: TreeKind, name: &str) -> (Option<String>, Option<String>) {
    match kind {
        TreeKind::Table => (Some(name.to_string()), None),
        TreeKind::Index => (None, Some(name.to_string())),
    }
}

fn check_key_order(
    pager: &Pager,
    name: &str,
    kind: TreeKind,
    root: PageNo,
    cancel: &CancelToken,
    errors: &mut Vec<IntegrityError>,
) -> Result<()> {
    let tree = BTree::open(root);
    let mut last: Option<Vec<u8>> = None;
    let mut violation: Option<String> = None;
    tree.scan_keys(pager, cancel, |key| {
        if let Some(prev) = &last {
            if key <= prev.as_slice() {
                violation = Some(format!(
                    "keys out of order in '{}' (len {} after len {})",
                    name,
                    key.len(),
                    prev.len()
                ));
                return Ok(false);
            }
        }
        last = Some(key.to_vec());
        Ok(true)
    })?;
    if let Some(message) = violation {
        let (table, index) = locate(kind, name);
        errors.push(IntegrityError {
            kind: IntegrityKind::KeyOrder,
            table,
            index,
            page: None,
            message,
        });
    }
    Ok(())
}

fn count_keys(pager: &Pager, root: PageNo, cancel: &CancelToken) -> Result<u64> {
    let tree = BTree::open(root);
    let mut count = 0u64;
    tree.scan_keys(pager, cancel, |_| {
        count += 1;
        Ok(true)
    })?;
    Ok(count)
}

fn check_cardinality(
    pager: &Pager,
    entries: &[(String, crate::btree::directory::TreeMeta)],
    cancel: &CancelToken,
    errors: &mut Vec<IntegrityError>,
) -> Result<()> {
    for (name, meta) in entries {
        let (TreeKind::Index, Some(base)) = (meta.kind, meta.base.as_ref()) else {
            continue;
        };
        let Some(base_meta) = entries.iter().find(|(n, _)| n == base).map(|(_, m)| m) else {
            errors.push(IntegrityError {
                kind: IntegrityKind::Cardinality,
                table: Some(base.clone()),
                index: Some(name.clone()),
                page: None,
                message: format!("index '{}' references missing table '{}'", name, base),
            });
            continue;
        };
        let index_count = count_keys(pager, meta.root, cancel)?;
        let table_count = count_keys(pager, base_meta.root, cancel)?;
        if index_count != table_count {
            errors.push(IntegrityError {
                kind: IntegrityKind::Cardinality,
                table: Some(base.clone()),
                index: Some(name.clone()),
                page: None,
                message: format!(
                    "index '{}' holds {} entries, table '{}' holds {}",
                    name, index_count, base, table_count
                ),
            });
        }
    }
    Ok(())
}

fn check_foreign_key(
    pager: &Pager,
    directory: &TreeDirectory,
    fk: &FkSpec,
    cancel: &CancelToken,
    errors: &mut Vec<IntegrityError>,
) -> Result<()> {
    let Some(child) = directory.get(pager, &fk.child_index)? else {
        errors.push(IntegrityError {
            kind: IntegrityKind::ForeignKey,
            table: None,
            index: Some(fk.child_index.clone()),
            page: None,
            message: format!("foreign key names unknown index '{}'", fk.child_index),
        });
        return Ok(());
    };
    let Some(parent) = directory.get(pager, &fk.parent_table)? else {
        errors.push(IntegrityError {
            kind: IntegrityKind::ForeignKey,
            table: Some(fk.parent_table.clone()),
            index: None,
            page: None,
            message: format!("foreign key names unknown table '{}'", fk.parent_table),
        });
        return Ok(());
    };

    let child_tree = BTree::open(child.root);
    let parent_tree = BTree::open(parent.root);
    let mut dangling = 0u64;
    child_tree.scan_keys(pager, cancel, |key| {
        if parent_tree.get(pager, cancel, key)?.is_none() {
            dangling += 1;
        }
        Ok(true)
    })?;
    if dangling > 0 {
        errors.push(IntegrityError {
            kind: IntegrityKind::ForeignKey,
            table: Some(fk.parent_table.clone()),
            index: Some(fk.child_index.clone()),
            page: None,
            message: format!(
                "{} key(s) of '{}' have no match in '{}'",
                dangling, fk.child_index, fk.parent_table
            ),
        });
    }
    Ok(())
}

/// Verify every on-disk page's CRC trailer. HNSW node pages are 64 KiB
/// units: their interior chunks have no individual trailer and are checked
/// as part of the unit.
fn check_checksums(
    pager: &Pager,
    vector_roots: &[PageNo],
    cancel: &CancelToken,
    errors: &mut Vec<IntegrityError>,
) -> Result<()> {
    let page_size = pager.page_size();
    let chunks_per_large = (LARGE_PAGE_SIZE / page_size) as u32;

    // Gather the HNSW node page runs from each index's node directory.
    let mut large_starts: Vec<PageNo> = Vec::new();
    let mut skip: HashSet<PageNo> = HashSet::new();
    for &meta_page in vector_roots {
        let guard = pager.read_with(meta_page, cancel)?;
        let meta = decode_meta(&guard)?;
        drop(guard);
        let tree = BTree::open(meta.node_tree_root);
        tree.scan(pager, cancel, |_, value| {
            if value.len() == 4 {
                let start = u32::from_be_bytes(value.try_into().unwrap());
                large_starts.push(start);
                for i in 0..chunks_per_large {
                    skip.insert(start + i);
                }
            }
            Ok(true)
        })?;
    }

    let mut file = File::open(pager.path())?;
    let file_len = file.metadata()?.len();
    let pages_on_disk = (file_len / page_size as u64) as u32;

    let mut buf = vec![0u8; page_size];
    for page_no in 0..pages_on_disk {
        if skip.contains(&page_no) {
            continue;
        }
        cancel.check()?;
        file.seek(SeekFrom::Start(page_no as u64 * page_size as u64))?;
        file.read_exact(&mut buf)?;
        if !trailer_valid(&buf) {
            errors.push(IntegrityError {
                kind: IntegrityKind::Checksum,
                table: None,
                index: None,
                page: Some(page_no),
                message: format!("page {} fails its CRC-32C", page_no),
            });
        }
    }

    let mut large_buf = vec![0u8; LARGE_PAGE_SIZE];
    for start in large_starts {
        cancel.check()?;
        let offset = start as u64 * page_size as u64;
        if offset + LARGE_PAGE_SIZE as u64 > file_len {
            // Not yet checkpointed into the main file; nothing to verify.
            continue;
        }
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut large_buf)?;
        if !trailer_valid(&large_buf) {
            errors.push(IntegrityError {
                kind: IntegrityKind::Checksum,
                table: None,
                index: None,
                page: Some(start),
                message: format!("HNSW node page {} fails its CRC-32C", start),
            });
        }
    }
    Ok(())
}

fn trailer_valid(buf: &[u8]) -> bool {
    let at = buf.len() - PAGE_TRAILER_SIZE;
    let stored = u32::from_be_bytes(buf[at..].try_into().unwrap());
    crc32c::crc32c(&buf[..at]) == stored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::directory::TreeMeta;
    use crate::concurrency::epoch::EpochManager;
    use crate::storage::page::DEFAULT_PAGE_SIZE;
    use crate::storage::pager::DEFAULT_CACHE_FRAMES;
    use std::io::Write;
    use tempfile::TempDir;

    fn none() -> CancelToken {
        CancelToken::none()
    }

    struct Fixture {
        dir: TempDir,
        pager: Pager,
        directory: TreeDirectory,
        epoch: std::sync::Arc<EpochManager>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let pager = Pager::create(
            &dir.path().join("t.db"),
            DEFAULT_PAGE_SIZE,
            DEFAULT_CACHE_FRAMES,
            false,
        )
        .unwrap();
        let directory = TreeDirectory::create(&pager).unwrap();
        Fixture {
            dir,
            pager,
            directory,
            epoch: EpochManager::new(),
        }
    }

    #[test]
    fn healthy_database_reports_nothing() {
        let mut f = fixture();
        let mut table = BTree::create(&f.pager).unwrap();
        for i in 0..50u64 {
            table
                .insert(&f.pager, &f.epoch, &none(), &i.to_be_bytes(), b"row")
                .unwrap();
        }
        f.directory
            .put(&f.pager, &f.epoch, "t", &TreeMeta::table(table.root()))
            .unwrap();
        f.pager.flush_dirty(&none()).unwrap();

        let errors =
            integrity_check(&f.pager, &f.directory, &[], &IntegrityOptions::default(), &none())
                .unwrap();
        assert!(errors.is_empty(), "unexpected: {:?}", errors);
    }

    #[test]
    fn cardinality_mismatch_is_reported() {
        let mut f = fixture();
        let mut table = BTree::create(&f.pager).unwrap();
        let mut index = BTree::create(&f.pager).unwrap();
        for i in 0..10u64 {
            table
                .insert(&f.pager, &f.epoch, &none(), &i.to_be_bytes(), b"row")
                .unwrap();
        }
        // Index is missing rows.
        for i in 0..7u64 {
            index
                .insert(&f.pager, &f.epoch, &none(), &i.to_be_bytes(), b"")
                .unwrap();
        }
        f.directory
            .put(&f.pager, &f.epoch, "t", &TreeMeta::table(table.root()))
            .unwrap();
        f.directory
            .put(&f.pager, &f.epoch, "t_idx", &TreeMeta::index(index.root(), "t"))
            .unwrap();
        f.pager.flush_dirty(&none()).unwrap();

        let errors =
            integrity_check(&f.pager, &f.directory, &[], &IntegrityOptions::default(), &none())
                .unwrap();
        assert!(errors
            .iter()
            .any(|e| e.kind == IntegrityKind::Cardinality && e.index.as_deref() == Some("t_idx")));
    }

    #[test]
    fn dangling_foreign_key_is_reported() {
        let mut f = fixture();
        let mut parent = BTree::create(&f.pager).unwrap();
        let mut child = BTree::create(&f.pager).unwrap();
        parent
            .insert(&f.pager, &f.epoch, &none(), b"p1", b"row")
            .unwrap();
        child.insert(&f.pager, &f.epoch, &none(), b"p1", b"").unwrap();
        child.insert(&f.pager, &f.epoch, &none(), b"p2", b"").unwrap(); // dangling
        f.directory
            .put(&f.pager, &f.epoch, "parent", &TreeMeta::table(parent.root()))
            .unwrap();
        f.directory
            .put(&f.pager, &f.epoch, "child_fk", &TreeMeta::index(child.root(), "parent"))
            .unwrap();
        f.pager.flush_dirty(&none()).unwrap();

        let options = IntegrityOptions {
            foreign_keys: vec![FkSpec {
                child_index: "child_fk".into(),
                parent_table: "parent".into(),
            }],
        };
        let errors =
            integrity_check(&f.pager, &f.directory, &[], &options, &none()).unwrap();
        assert!(errors.iter().any(|e| e.kind == IntegrityKind::ForeignKey));
    }

    #[test]
    fn flipped_bit_on_disk_fails_checksum_scan() {
        let mut f = fixture();
        let mut table = BTree::create(&f.pager).unwrap();
        table
            .insert(&f.pager, &f.epoch, &none(), b"k", b"v")
            .unwrap();
        f.directory
            .put(&f.pager, &f.epoch, "t", &TreeMeta::table(table.root()))
            .unwrap();
        f.pager.flush_dirty(&none()).unwrap();
        f.pager.sync().unwrap();

        // Corrupt the table's root page on disk (body byte, not trailer).
        let path = f.dir.path().join("t.db");
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(
            table.root() as u64 * DEFAULT_PAGE_SIZE as u64 + 50,
        ))
        .unwrap();
        file.write_all(&[0xFF]).unwrap();
        file.sync_all().unwrap();

        let errors = quick_check(&f.pager, &f.directory, &[], &none()).unwrap();
        assert!(errors
            .iter()
            .any(|e| e.kind == IntegrityKind::Checksum && e.page == Some(table.root())));
    }
}
