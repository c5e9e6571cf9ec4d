//! Tree directory: names → roots.
//!
//! A dedicated B-tree (its root lives in the header's schema-root slot)
//! maps each table or index name to its current root page and storage-level
//! metadata. This is what `btree_open(name)` resolves through, and what the
//! integrity check uses to pair index trees with their base tables. It is
//! not the SQL catalog; column and constraint metadata belong to the layer
//! above.
//!
//! Entry value: [root u32] [kind u8] [base_len u16] [base-table name bytes]

use std::sync::Arc;

use crate::btree::ops::BTree;
use crate::cancel::CancelToken;
use crate::concurrency::epoch::EpochManager;
use crate::error::{Result, TurError};
use crate::storage::page::PageNo;
use crate::storage::pager::Pager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TreeKind {
    Table = 0,
    Index = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeMeta {
    pub root: PageNo,
    pub kind: TreeKind,
    /// For indexes: the table whose cardinality this tree must match.
    pub base: Option<String>,
}

impl TreeMeta {
    pub fn table(root: PageNo) -> TreeMeta {
        TreeMeta {
            root,
            kind: TreeKind::Table,
            base: None,
        }
    }

    pub fn index(root: PageNo, base: &str) -> TreeMeta {
        TreeMeta {
            root,
            kind: TreeKind::Index,
            base: Some(base.to_string()),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let base = self.base.as_deref().unwrap_or("");
        let mut buf = Vec::with_capacity(7 + base.len());
        buf.extend_from_slice(&self.root.to_be_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&(base.len() as u16).to_be_bytes());
        buf.extend_from_slice(base.as_bytes());
        buf
    }

    fn decode(data: &[u8]) -> Result<TreeMeta> {
        if data.len() < 7 {
            return Err(TurError::Corruption("tree directory entry too short".into()));
        }
        let root = u32::from_be_bytes(data[0..4].try_into().unwrap());
        let kind = match data[4] {
            0 => TreeKind::Table,
            1 => TreeKind::Index,
            other => {
                return Err(TurError::Corruption(format!(
                    "unknown tree kind {}",
                    other
                )));
            }
        };
        let base_len = u16::from_be_bytes(data[5..7].try_into().unwrap()) as usize;
        if data.len() < 7 + base_len {
            return Err(TurError::Corruption("tree directory entry truncated".into()));
        }
        let base = if base_len == 0 {
            None
        } else {
            Some(
                std::str::from_utf8(&data[7..7 + base_len])
                    .map_err(|_| TurError::Corruption("tree directory name not UTF-8".into()))?
                    .to_string(),
            )
        };
        Ok(TreeMeta { root, kind, base })
    }
}

pub struct TreeDirectory {
    tree: BTree,
}

impl TreeDirectory {
    pub fn create(pager: &Pager) -> Result<TreeDirectory> {
        Ok(TreeDirectory {
            tree: BTree::create(pager)?,
        })
    }

    pub fn open(root: PageNo) -> TreeDirectory {
        TreeDirectory {
            tree: BTree::open(root),
        }
    }

    pub fn root(&self) -> PageNo {
        self.tree.root()
    }

    pub fn get(&self, pager: &Pager, name: &str) -> Result<Option<TreeMeta>> {
        match self.tree.get(pager, &CancelToken::none(), name.as_bytes())? {
            Some(bytes) => Ok(Some(TreeMeta::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(
        &mut self,
        pager: &Pager,
        epoch: &Arc<EpochManager>,
        name: &str,
        meta: &TreeMeta,
    ) -> Result<()> {
        self.tree.insert(
            pager,
            epoch,
            &CancelToken::none(),
            name.as_bytes(),
            &meta.encode(),
        )
    }

    pub fn remove(
        &mut self,
        pager: &Pager,
        epoch: &Arc<EpochManager>,
        name: &str,
    ) -> Result<bool> {
        self.tree
            .delete(pager, epoch, &CancelToken::none(), name.as_bytes())
    }

    pub fn list(&self, pager: &Pager) -> Result<Vec<(String, TreeMeta)>> {
        let mut entries = Vec::new();
        self.tree.scan(pager, &CancelToken::none(), |key, value| {
            let name = std::str::from_utf8(key)
                .map_err(|_| TurError::Corruption("tree directory name not UTF-8".into()))?
                .to_string();
            entries.push((name, TreeMeta::decode(value)?));
            Ok(true)
        })?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::DEFAULT_PAGE_SIZE;
    use crate::storage::pager::DEFAULT_CACHE_FRAMES;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Pager, Arc<EpochManager>) {
        let dir = TempDir::new().unwrap();
        let pager = Pager::create(
            &dir.path().join("t.db"),
            DEFAULT_PAGE_SIZE,
            DEFAULT_CACHE_FRAMES,
            false,
        )
        .unwrap();
        (dir, pager, EpochManager::new())
    }

    #[test]
    fn directory_roundtrip() {
        let (_dir, pager, epoch) = fixture();
        let mut dir = TreeDirectory::create(&pager).unwrap();

        dir.put(&pager, &epoch, "users", &TreeMeta::table(10)).unwrap();
        dir.put(&pager, &epoch, "users_by_email", &TreeMeta::index(11, "users"))
            .unwrap();

        let users = dir.get(&pager, "users").unwrap().unwrap();
        assert_eq!(users.root, 10);
        assert_eq!(users.kind, TreeKind::Table);
        assert_eq!(users.base, None);

        let index = dir.get(&pager, "users_by_email").unwrap().unwrap();
        assert_eq!(index.kind, TreeKind::Index);
        assert_eq!(index.base.as_deref(), Some("users"));

        assert_eq!(dir.get(&pager, "ghost").unwrap(), None);
        assert_eq!(dir.list(&pager).unwrap().len(), 2);
    }

    #[test]
    fn reopen_from_root_sees_entries() {
        let (_dir, pager, epoch) = fixture();
        let root = {
            let mut dir = TreeDirectory::create(&pager).unwrap();
            dir.put(&pager, &epoch, "t", &TreeMeta::table(42)).unwrap();
            dir.root()
        };
        let dir = TreeDirectory::open(root);
        assert_eq!(dir.get(&pager, "t").unwrap().unwrap().root, 42);
    }

    #[test]
    fn remove_entry() {
        let (_dir, pager, epoch) = fixture();
        let mut dir = TreeDirectory::create(&pager).unwrap();
        dir.put(&pager, &epoch, "t", &TreeMeta::table(1)).unwrap();
        assert!(dir.remove(&pager, &epoch, "t").unwrap());
        assert_eq!(dir.get(&pager, "t").unwrap(), None);
        assert!(!dir.remove(&pager, &epoch, "t").unwrap());
    }
}
