//! Ordered iteration over a B+ tree snapshot.
//!
//! A cursor binds to the root captured at creation and holds an epoch guard
//! until closed, so the pages of that snapshot cannot be reclaimed under it.
//! Iteration is driven by the parent stack: each stack entry records which
//! child pointer of an interior node the descent took, and `next`/`prev`
//! ascend until a sibling pointer exists in the wanted direction. Keys come
//! out in strict ascending byte-lexicographic order.
//!
//! State machine: Valid (positioned on an entry), Invalid (exhausted or not
//! yet positioned), Closed (all operations fail).

use std::sync::Arc;

use crate::btree::node::{
    cell_count, find_child, interior_entry, leaf_entry, node_type, rightmost_child, search_leaf,
    LeafValue,
};
use crate::btree::overflow;
use crate::cancel::CancelToken;
use crate::concurrency::epoch::EpochGuard;
use crate::error::{Result, TurError};
use crate::storage::page::{PageNo, PageType};
use crate::storage::pager::{PageGuard, Pager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Valid,
    Invalid,
    Closed,
}

pub struct Cursor {
    pager: Arc<Pager>,
    cancel: CancelToken,
    root: PageNo,
    /// Interior path: (page, child pointer index taken, 0..=cell_count).
    stack: Vec<(PageNo, u16)>,
    leaf: Option<(PageGuard, u16)>,
    state: CursorState,
    _epoch: Option<EpochGuard>,
}

impl Cursor {
    pub fn new(
        pager: Arc<Pager>,
        root: PageNo,
        epoch: Option<EpochGuard>,
        cancel: CancelToken,
    ) -> Cursor {
        Cursor {
            pager,
            cancel,
            root,
            stack: Vec::new(),
            leaf: None,
            state: CursorState::Invalid,
            _epoch: epoch,
        }
    }

    pub fn valid(&self) -> bool {
        self.state == CursorState::Valid
    }

    /// Release the snapshot (and its epoch guard). Further calls fail.
    pub fn close(&mut self) {
        self.stack.clear();
        self.leaf = None;
        self.state = CursorState::Closed;
        self._epoch = None;
    }

    fn guard_open(&self) -> Result<()> {
        if self.state == CursorState::Closed {
            return Err(TurError::Closed);
        }
        Ok(())
    }

    /// Position on the smallest key. Returns whether an entry exists.
    pub fn first(&mut self) -> Result<bool> {
        self.guard_open()?;
        self.descend_edge(self.root, true)?;
        if self.leaf_entry_count() == 0 {
            return self.advance_leaf();
        }
        self.state = CursorState::Valid;
        Ok(true)
    }

    /// Position on the largest key.
    pub fn last(&mut self) -> Result<bool> {
        self.guard_open()?;
        self.descend_edge(self.root, false)?;
        if self.leaf_entry_count() == 0 {
            return self.retreat_leaf();
        }
        self.state = CursorState::Valid;
        Ok(true)
    }

    /// Position on the first key >= `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<bool> {
        self.guard_open()?;
        self.stack.clear();
        let mut page_no = self.root;
        for _ in 0..crate::btree::MAX_CURSOR_DEPTH {
            self.cancel.check()?;
            let page = self.pager.read_with(page_no, &self.cancel)?;
            match node_type(&page) {
                Some(PageType::BtreeInterior) => {
                    let (child, idx) = find_child(&page, key)?;
                    self.stack.push((page_no, idx));
                    page_no = child;
                }
                Some(PageType::BtreeLeaf) => {
                    let pos = match search_leaf(&page, key)? {
                        Ok(i) => i,
                        Err(i) => i,
                    };
                    let count = cell_count(&page);
                    self.leaf = Some((page, pos));
                    if pos < count {
                        self.state = CursorState::Valid;
                        return Ok(true);
                    }
                    return self.advance_leaf();
                }
                _ => return Err(TurError::CorruptPage(page_no)),
            }
        }
        Err(TurError::Corruption(
            "B-tree depth exceeds maximum (possible cycle)".into(),
        ))
    }

    /// Position on `key` exactly. On a miss the cursor lands where `seek`
    /// would and reports false.
    pub fn seek_exact(&mut self, key: &[u8]) -> Result<bool> {
        if !self.seek(key)? {
            return Ok(false);
        }
        Ok(self.key()? == Some(key))
    }

    /// Step to the next key in ascending order.
    pub fn next(&mut self) -> Result<bool> {
        self.guard_open()?;
        if self.state != CursorState::Valid {
            return Ok(false);
        }
        let (_, idx) = self.leaf.as_ref().expect("valid cursor has a leaf");
        let next_idx = idx + 1;
        if next_idx < self.leaf_entry_count() {
            self.leaf.as_mut().unwrap().1 = next_idx;
            return Ok(true);
        }
        self.advance_leaf()
    }

    /// Step to the previous key.
    pub fn prev(&mut self) -> Result<bool> {
        self.guard_open()?;
        if self.state != CursorState::Valid {
            return Ok(false);
        }
        let (_, idx) = self.leaf.as_ref().expect("valid cursor has a leaf");
        if *idx > 0 {
            let prev_idx = idx - 1;
            self.leaf.as_mut().unwrap().1 = prev_idx;
            return Ok(true);
        }
        self.retreat_leaf()
    }

    /// Current key, or None when not positioned.
    pub fn key(&self) -> Result<Option<&[u8]>> {
        self.guard_open()?;
        if self.state != CursorState::Valid {
            return Ok(None);
        }
        let (page, idx) = self.leaf.as_ref().unwrap();
        Ok(Some(leaf_entry(page, *idx)?.0))
    }

    /// Current value with overflow chains assembled.
    pub fn value(&self) -> Result<Option<Vec<u8>>> {
        self.guard_open()?;
        if self.state != CursorState::Valid {
            return Ok(None);
        }
        let (page, idx) = self.leaf.as_ref().unwrap();
        let (_, value) = leaf_entry(page, *idx)?;
        let out = match value {
            LeafValue::Inline(bytes) => bytes.to_vec(),
            LeafValue::Overflow {
                total_len,
                inline,
                first_page,
            } => overflow::read_chain(&self.pager, &self.cancel, total_len, inline, first_page)?,
        };
        Ok(Some(out))
    }

    fn leaf_entry_count(&self) -> u16 {
        self.leaf.as_ref().map(|(p, _)| cell_count(p)).unwrap_or(0)
    }

    /// Walk down to the leftmost (or rightmost) leaf under `page_no`,
    /// rebuilding the stack from scratch.
    fn descend_edge(&mut self, page_no: PageNo, leftmost: bool) -> Result<()> {
        self.stack.clear();
        self.descend_into(page_no, leftmost)
    }

    /// Descend from `page_no`, pushing path entries, until a leaf.
    fn descend_into(&mut self, mut page_no: PageNo, leftmost: bool) -> Result<()> {
        for _ in 0..crate::btree::MAX_CURSOR_DEPTH {
            self.cancel.check()?;
            let page = self.pager.read_with(page_no, &self.cancel)?;
            match node_type(&page) {
                Some(PageType::BtreeInterior) => {
                    let n = cell_count(&page);
                    let idx = if leftmost { 0 } else { n };
                    let child = child_at(&page, idx)?;
                    self.stack.push((page_no, idx));
                    page_no = child;
                }
                Some(PageType::BtreeLeaf) => {
                    let count = cell_count(&page);
                    let pos = if leftmost || count == 0 { 0 } else { count - 1 };
                    self.leaf = Some((page, pos));
                    return Ok(());
                }
                _ => return Err(TurError::CorruptPage(page_no)),
            }
        }
        Err(TurError::Corruption(
            "B-tree depth exceeds maximum (possible cycle)".into(),
        ))
    }

    /// Ascend until a right sibling pointer exists, then descend to its
    /// leftmost leaf. Invalidates when the tree is exhausted.
    fn advance_leaf(&mut self) -> Result<bool> {
        self.leaf = None;
        while let Some((page_no, idx)) = self.stack.pop() {
            self.cancel.check()?;
            let page = self.pager.read_with(page_no, &self.cancel)?;
            let n = cell_count(&page);
            if idx < n {
                let next_idx = idx + 1;
                let child = child_at(&page, next_idx)?;
                self.stack.push((page_no, next_idx));
                self.descend_into(child, true)?;
                if self.leaf_entry_count() > 0 {
                    self.leaf.as_mut().unwrap().1 = 0;
                    self.state = CursorState::Valid;
                    return Ok(true);
                }
                // Empty leaf: keep ascending from where the descent left us.
                self.leaf = None;
                continue;
            }
        }
        self.state = CursorState::Invalid;
        Ok(false)
    }

    /// Mirror of `advance_leaf` toward smaller keys.
    fn retreat_leaf(&mut self) -> Result<bool> {
        self.leaf = None;
        while let Some((page_no, idx)) = self.stack.pop() {
            self.cancel.check()?;
            let page = self.pager.read_with(page_no, &self.cancel)?;
            if idx > 0 {
                let prev_idx = idx - 1;
                let child = child_at(&page, prev_idx)?;
                self.stack.push((page_no, prev_idx));
                self.descend_into(child, false)?;
                let count = self.leaf_entry_count();
                if count > 0 {
                    self.leaf.as_mut().unwrap().1 = count - 1;
                    self.state = CursorState::Valid;
                    return Ok(true);
                }
                self.leaf = None;
                continue;
            }
        }
        self.state = CursorState::Invalid;
        Ok(false)
    }
}

/// Child pointer `idx` of an interior node (`idx == cell_count` is the
/// rightmost child).
fn child_at(page: &crate::storage::page::Page, idx: u16) -> Result<PageNo> {
    if idx < cell_count(page) {
        Ok(interior_entry(page, idx)?.1)
    } else {
        Ok(rightmost_child(page))
    }
}
