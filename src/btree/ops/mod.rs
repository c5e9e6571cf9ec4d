//! Copy-on-write B+ tree operations.
//!
//! Every mutation rewrites the touched root→leaf path into freshly allocated
//! pages and returns the new root; the caller publishes it atomically.
//! Replaced pages (and the overflow chains of replaced values) are retired
//! through the epoch manager rather than freed directly, so readers that
//! captured an older root keep a consistent tree.
//!
//! Splits promote a byte-balanced median; deletes that leave a node under
//! the 40% fill threshold borrow from or merge with a sibling, preferring
//! the right one. Readers take no locks; at most one writer mutates a tree
//! at a time (tree-level latch, held by the caller).

use std::sync::Arc;

use crate::btree::node::{
    cell_count, encode_interior_cell, encode_leaf_cell, find_child, interior_entry, leaf_entry,
    node_capacity, node_type, overflow_threshold, rightmost_child, search_leaf, LeafValue,
    NodeBuilder, CELL_POINTER_SIZE, OVERFLOW_INLINE,
};
use crate::btree::overflow;
use crate::cancel::CancelToken;
use crate::concurrency::epoch::EpochManager;
use crate::error::{Result, TurError};
use crate::storage::page::{Page, PageNo, PageType};
use crate::storage::pager::Pager;

/// Depth guard against cycles in corrupted trees.
const MAX_BTREE_DEPTH: usize = 64;

/// Rebalance below this many used content bytes.
fn min_fill(page_size: usize) -> usize {
    node_capacity(page_size) * 2 / 5
}

#[derive(Clone)]
struct LeafItem {
    key: Vec<u8>,
    total_len: usize,
    payload: Vec<u8>,
}

impl LeafItem {
    fn cell(&self) -> Vec<u8> {
        encode_leaf_cell(&self.key, self.total_len, &self.payload)
    }

    fn cell_size(&self) -> usize {
        self.cell().len() + CELL_POINTER_SIZE
    }
}

#[derive(Clone)]
struct InteriorItem {
    key: Vec<u8>,
    left: PageNo,
}

impl InteriorItem {
    fn cell(&self) -> Vec<u8> {
        encode_interior_cell(&self.key, self.left)
    }

    fn cell_size(&self) -> usize {
        self.cell().len() + CELL_POINTER_SIZE
    }
}

struct SplitResult {
    median_key: Vec<u8>,
    right_page: PageNo,
}

/// B+ tree handle: just the current root. Shared state (published root,
/// writer latch) lives with the owner.
pub struct BTree {
    root: PageNo,
}

impl BTree {
    /// Create a tree with a fresh empty leaf root.
    pub fn create(pager: &Pager) -> Result<BTree> {
        let no = pager.allocate()?;
        let page = NodeBuilder::leaf(no, pager.page_size()).finish();
        pager.write_page(page)?;
        Ok(BTree { root: no })
    }

    pub fn open(root: PageNo) -> BTree {
        BTree { root }
    }

    pub fn root(&self) -> PageNo {
        self.root
    }

    /// Point lookup; assembles overflowed values.
    pub fn get(&self, pager: &Pager, cancel: &CancelToken, key: &[u8]) -> Result<Option<Vec<u8>>> {
        cancel.check()?;
        let mut page_no = self.root;
        for _ in 0..MAX_BTREE_DEPTH {
            let page = pager.read_with(page_no, cancel)?;
            match node_type(&page) {
                Some(PageType::BtreeInterior) => {
                    page_no = find_child(&page, key)?.0;
                }
                Some(PageType::BtreeLeaf) => {
                    return match search_leaf(&page, key)? {
                        Ok(idx) => {
                            let (_, value) = leaf_entry(&page, idx)?;
                            Ok(Some(materialize(pager, cancel, value)?))
                        }
                        Err(_) => Ok(None),
                    };
                }
                _ => return Err(TurError::CorruptPage(page_no)),
            }
        }
        Err(TurError::Corruption(
            "B-tree depth exceeds maximum (possible cycle)".into(),
        ))
    }

    /// Insert or replace. Returns the pages this operation retired, already
    /// handed to the epoch manager.
    pub fn insert(
        &mut self,
        pager: &Pager,
        epoch: &Arc<EpochManager>,
        cancel: &CancelToken,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        cancel.check()?;
        let page_size = pager.page_size();
        if key.len() > max_key_len(page_size) {
            return Err(TurError::Corruption(format!(
                "key of {} bytes exceeds page capacity",
                key.len()
            )));
        }

        let item = encode_item(pager, key, value)?;
        let mut retired = Vec::new();
        let (new_root, split) = insert_rec(pager, cancel, self.root, &item, 0, &mut retired)?;
        self.root = match split {
            None => new_root,
            Some(split) => {
                let no = pager.allocate()?;
                let mut builder = NodeBuilder::interior(no, page_size, split.right_page);
                let cell = encode_interior_cell(&split.median_key, new_root);
                if !builder.push_cell(&cell) {
                    return Err(TurError::Corruption("root separator does not fit".into()));
                }
                pager.write_page(builder.finish())?;
                no
            }
        };
        epoch.retire(retired);
        Ok(())
    }

    /// Delete a key. Returns whether it existed.
    pub fn delete(
        &mut self,
        pager: &Pager,
        epoch: &Arc<EpochManager>,
        cancel: &CancelToken,
        key: &[u8],
    ) -> Result<bool> {
        cancel.check()?;
        let mut retired = Vec::new();
        let outcome = delete_rec(pager, cancel, self.root, key, 0, &mut retired)?;
        let Some((new_root, _underfull)) = outcome else {
            return Ok(false);
        };
        self.root = new_root;

        // Collapse an empty interior root onto its only child.
        loop {
            let page = pager.read_with(self.root, cancel)?;
            if node_type(&page) == Some(PageType::BtreeInterior) && cell_count(&page) == 0 {
                let child = rightmost_child(&page);
                retired.push(self.root);
                self.root = child;
            } else {
                break;
            }
        }
        epoch.retire(retired);
        Ok(true)
    }

    /// In-order scan with assembled values. The callback returns false to
    /// stop early.
    pub fn scan<F>(&self, pager: &Pager, cancel: &CancelToken, mut callback: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        scan_rec(pager, cancel, self.root, 0, &mut |key, value| {
            callback(key, value)
        })
        .map(|_| ())
    }

    /// In-order scan over keys only (no overflow I/O).
    pub fn scan_keys<F>(&self, pager: &Pager, cancel: &CancelToken, mut callback: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<bool>,
    {
        scan_keys_rec(pager, cancel, self.root, 0, &mut callback).map(|_| ())
    }

    /// Every page reachable from the root, overflow chains included.
    pub fn collect_pages(&self, pager: &Pager, cancel: &CancelToken) -> Result<Vec<PageNo>> {
        let mut pages = Vec::new();
        collect_rec(pager, cancel, self.root, 0, &mut pages)?;
        Ok(pages)
    }
}

fn max_key_len(page_size: usize) -> usize {
    node_capacity(page_size) / 4
}

/// Turn a value into a leaf item, spilling to an overflow chain if needed.
fn encode_item(pager: &Pager, key: &[u8], value: &[u8]) -> Result<LeafItem> {
    let threshold = overflow_threshold(pager.page_size());
    if value.len() <= threshold {
        return Ok(LeafItem {
            key: key.to_vec(),
            total_len: value.len(),
            payload: value.to_vec(),
        });
    }
    let first = overflow::write_chain(pager, &value[OVERFLOW_INLINE..])?;
    let mut payload = Vec::with_capacity(OVERFLOW_INLINE + 4);
    payload.extend_from_slice(&value[..OVERFLOW_INLINE]);
    payload.extend_from_slice(&first.to_be_bytes());
    Ok(LeafItem {
        key: key.to_vec(),
        total_len: value.len(),
        payload,
    })
}

fn materialize(pager: &Pager, cancel: &CancelToken, value: LeafValue<'_>) -> Result<Vec<u8>> {
    match value {
        LeafValue::Inline(bytes) => Ok(bytes.to_vec()),
        LeafValue::Overflow {
            total_len,
            inline,
            first_page,
        } => overflow::read_chain(pager, cancel, total_len, inline, first_page),
    }
}

fn read_leaf_items(page: &Page) -> Result<Vec<LeafItem>> {
    let n = cell_count(page);
    let mut items = Vec::with_capacity(n as usize);
    for i in 0..n {
        let (key, value) = leaf_entry(page, i)?;
        let (total_len, payload) = match value {
            LeafValue::Inline(bytes) => (bytes.len(), bytes.to_vec()),
            LeafValue::Overflow {
                total_len,
                inline,
                first_page,
            } => {
                let mut payload = Vec::with_capacity(inline.len() + 4);
                payload.extend_from_slice(inline);
                payload.extend_from_slice(&first_page.to_be_bytes());
                (total_len, payload)
            }
        };
        items.push(LeafItem {
            key: key.to_vec(),
            total_len,
            payload,
        });
    }
    Ok(items)
}

fn read_interior_items(page: &Page) -> Result<(Vec<InteriorItem>, PageNo)> {
    let n = cell_count(page);
    let mut items = Vec::with_capacity(n as usize);
    for i in 0..n {
        let (key, left) = interior_entry(page, i)?;
        items.push(InteriorItem {
            key: key.to_vec(),
            left,
        });
    }
    Ok((items, rightmost_child(page)))
}

/// Retire the overflow chain referenced by a replaced or deleted item.
fn retire_item_chain(
    pager: &Pager,
    cancel: &CancelToken,
    item: &LeafItem,
    retired: &mut Vec<PageNo>,
) -> Result<()> {
    let threshold = overflow_threshold(pager.page_size());
    if item.total_len > threshold {
        let at = item.payload.len() - 4;
        let first = u32::from_be_bytes(item.payload[at..].try_into().unwrap());
        retired.extend(overflow::chain_pages(pager, cancel, first)?);
    }
    Ok(())
}

fn leaf_fits(page_size: usize, items: &[LeafItem]) -> bool {
    items.iter().map(|i| i.cell_size()).sum::<usize>() <= node_capacity(page_size)
}

fn interior_fits(page_size: usize, items: &[InteriorItem]) -> bool {
    items.iter().map(|i| i.cell_size()).sum::<usize>() <= node_capacity(page_size)
}

fn build_leaf(pager: &Pager, items: &[LeafItem], right_sibling: PageNo) -> Result<PageNo> {
    let no = pager.allocate()?;
    let mut builder = NodeBuilder::leaf(no, pager.page_size());
    builder.set_right_sibling(right_sibling);
    for item in items {
        if !builder.push_cell(&item.cell()) {
            return Err(TurError::Corruption("leaf rebuild overflowed page".into()));
        }
    }
    pager.write_page(builder.finish())?;
    Ok(no)
}

fn build_interior(
    pager: &Pager,
    items: &[InteriorItem],
    rightmost: PageNo,
) -> Result<PageNo> {
    let no = pager.allocate()?;
    let mut builder = NodeBuilder::interior(no, pager.page_size(), rightmost);
    for item in items {
        if !builder.push_cell(&item.cell()) {
            return Err(TurError::Corruption(
                "interior rebuild overflowed page".into(),
            ));
        }
    }
    pager.write_page(builder.finish())?;
    Ok(no)
}

/// Byte-balanced split point: index where the right half starts.
fn split_point(sizes: &[usize]) -> usize {
    let total: usize = sizes.iter().sum();
    let mut acc = 0usize;
    for (i, size) in sizes.iter().enumerate() {
        acc += size;
        if acc * 2 >= total {
            return (i + 1).clamp(1, sizes.len() - 1);
        }
    }
    sizes.len() / 2
}

fn insert_rec(
    pager: &Pager,
    cancel: &CancelToken,
    page_no: PageNo,
    item: &LeafItem,
    depth: usize,
    retired: &mut Vec<PageNo>,
) -> Result<(PageNo, Option<SplitResult>)> {
    if depth > MAX_BTREE_DEPTH {
        return Err(TurError::Corruption(
            "B-tree depth exceeds maximum (possible cycle)".into(),
        ));
    }
    cancel.check()?;
    let page = pager.read_with(page_no, cancel)?;
    match node_type(&page) {
        Some(PageType::BtreeLeaf) => {
            let mut items = read_leaf_items(&page)?;
            match search_leaf(&page, &item.key)? {
                Ok(idx) => {
                    retire_item_chain(pager, cancel, &items[idx as usize], retired)?;
                    items[idx as usize] = item.clone();
                }
                Err(idx) => items.insert(idx as usize, item.clone()),
            }
            retired.push(page_no);
            let old_sibling = crate::btree::node::right_sibling(&page);
            drop(page);

            if leaf_fits(pager.page_size(), &items) {
                let no = build_leaf(pager, &items, old_sibling)?;
                return Ok((no, None));
            }
            // Split, right half first so the left can point at it.
            let sizes: Vec<usize> = items.iter().map(|i| i.cell_size()).collect();
            let mid = split_point(&sizes);
            let median_key = items[mid].key.clone();
            let right = build_leaf(pager, &items[mid..], old_sibling)?;
            let left = build_leaf(pager, &items[..mid], right)?;
            Ok((
                left,
                Some(SplitResult {
                    median_key,
                    right_page: right,
                }),
            ))
        }
        Some(PageType::BtreeInterior) => {
            let (child, child_idx) = find_child(&page, &item.key)?;
            let (mut items, mut rightmost) = read_interior_items(&page)?;
            drop(page);

            let (new_child, split) = insert_rec(pager, cancel, child, item, depth + 1, retired)?;
            let idx = child_idx as usize;
            if idx < items.len() {
                items[idx].left = new_child;
            } else {
                rightmost = new_child;
            }
            if let Some(split) = split {
                // The pointer that followed the split child now routes to its
                // right half; the median separates the two halves.
                if idx < items.len() {
                    let old_key = std::mem::replace(&mut items[idx].key, split.median_key);
                    items.insert(
                        idx + 1,
                        InteriorItem {
                            key: old_key,
                            left: split.right_page,
                        },
                    );
                } else {
                    items.push(InteriorItem {
                        key: split.median_key,
                        left: new_child,
                    });
                    rightmost = split.right_page;
                }
            }
            retired.push(page_no);

            if interior_fits(pager.page_size(), &items) {
                let no = build_interior(pager, &items, rightmost)?;
                return Ok((no, None));
            }
            let sizes: Vec<usize> = items.iter().map(|i| i.cell_size()).collect();
            let mid = split_point(&sizes);
            let median = items[mid].clone();
            let left = build_interior(pager, &items[..mid], median.left)?;
            let right = build_interior(pager, &items[mid + 1..], rightmost)?;
            Ok((
                left,
                Some(SplitResult {
                    median_key: median.key,
                    right_page: right,
                }),
            ))
        }
        _ => Err(TurError::CorruptPage(page_no)),
    }
}

/// Returns None when the key was absent (tree untouched), otherwise the
/// rewritten page and whether it is underfull.
fn delete_rec(
    pager: &Pager,
    cancel: &CancelToken,
    page_no: PageNo,
    key: &[u8],
    depth: usize,
    retired: &mut Vec<PageNo>,
) -> Result<Option<(PageNo, bool)>> {
    if depth > MAX_BTREE_DEPTH {
        return Err(TurError::Corruption(
            "B-tree depth exceeds maximum (possible cycle)".into(),
        ));
    }
    cancel.check()?;
    let page = pager.read_with(page_no, cancel)?;
    match node_type(&page) {
        Some(PageType::BtreeLeaf) => {
            let Ok(idx) = search_leaf(&page, key)? else {
                return Ok(None);
            };
            let mut items = read_leaf_items(&page)?;
            let sibling = crate::btree::node::right_sibling(&page);
            drop(page);

            let removed = items.remove(idx as usize);
            retire_item_chain(pager, cancel, &removed, retired)?;
            retired.push(page_no);

            let no = build_leaf(pager, &items, sibling)?;
            let used: usize = items.iter().map(|i| i.cell_size()).sum();
            Ok(Some((no, used < min_fill(pager.page_size()))))
        }
        Some(PageType::BtreeInterior) => {
            let (child, child_idx) = find_child(&page, key)?;
            let (mut items, mut rightmost) = read_interior_items(&page)?;
            drop(page);

            let Some((new_child, child_underfull)) =
                delete_rec(pager, cancel, child, key, depth + 1, retired)?
            else {
                return Ok(None);
            };
            let idx = child_idx as usize;
            if idx < items.len() {
                items[idx].left = new_child;
            } else {
                rightmost = new_child;
            }
            retired.push(page_no);

            if child_underfull && !items.is_empty() {
                rebalance(pager, cancel, &mut items, &mut rightmost, idx, retired)?;
            }

            let no = build_interior(pager, &items, rightmost)?;
            let used: usize = items.iter().map(|i| i.cell_size()).sum();
            Ok(Some((no, used < min_fill(pager.page_size()))))
        }
        _ => Err(TurError::CorruptPage(page_no)),
    }
}

/// Merge or redistribute the underfull child at pointer `idx` with a
/// sibling. Prefers the right sibling; the leftmost-possible pair is chosen
/// only when the child is the rightmost pointer.
fn rebalance(
    pager: &Pager,
    cancel: &CancelToken,
    items: &mut Vec<InteriorItem>,
    rightmost: &mut PageNo,
    idx: usize,
    retired: &mut Vec<PageNo>,
) -> Result<()> {
    // Separator between the pair: the child pairs with its right sibling,
    // except when it is the rightmost pointer and pairs leftward.
    let sep = if idx < items.len() { idx } else { idx - 1 };
    let left_no = items[sep].left;
    let right_no = if sep + 1 < items.len() {
        items[sep + 1].left
    } else {
        *rightmost
    };

    let left_page = pager.read_with(left_no, cancel)?;
    let right_page = pager.read_with(right_no, cancel)?;
    let left_type = node_type(&left_page);
    let right_type = node_type(&right_page);
    if left_type != right_type {
        return Err(TurError::Corruption(
            "sibling nodes disagree on node type".into(),
        ));
    }

    match left_type {
        Some(PageType::BtreeLeaf) => {
            let mut combined = read_leaf_items(&left_page)?;
            let sibling = crate::btree::node::right_sibling(&right_page);
            combined.extend(read_leaf_items(&right_page)?);
            drop(left_page);
            drop(right_page);
            retired.push(left_no);
            retired.push(right_no);

            if leaf_fits(pager.page_size(), &combined) {
                let merged = build_leaf(pager, &combined, sibling)?;
                items.remove(sep);
                if sep < items.len() {
                    items[sep].left = merged;
                } else {
                    *rightmost = merged;
                }
            } else {
                let sizes: Vec<usize> = combined.iter().map(|i| i.cell_size()).collect();
                let mid = split_point(&sizes);
                let new_right = build_leaf(pager, &combined[mid..], sibling)?;
                let new_left = build_leaf(pager, &combined[..mid], new_right)?;
                items[sep].key = combined[mid].key.clone();
                items[sep].left = new_left;
                if sep + 1 < items.len() {
                    items[sep + 1].left = new_right;
                } else {
                    *rightmost = new_right;
                }
            }
        }
        Some(PageType::BtreeInterior) => {
            let (left_items, left_right) = read_interior_items(&left_page)?;
            let (right_items, right_right) = read_interior_items(&right_page)?;
            drop(left_page);
            drop(right_page);
            retired.push(left_no);
            retired.push(right_no);

            // The separator comes down between the two halves.
            let mut combined = left_items;
            combined.push(InteriorItem {
                key: items[sep].key.clone(),
                left: left_right,
            });
            combined.extend(right_items);

            if interior_fits(pager.page_size(), &combined) {
                let merged = build_interior(pager, &combined, right_right)?;
                items.remove(sep);
                if sep < items.len() {
                    items[sep].left = merged;
                } else {
                    *rightmost = merged;
                }
            } else {
                let sizes: Vec<usize> = combined.iter().map(|i| i.cell_size()).collect();
                let mid = split_point(&sizes);
                let median = combined[mid].clone();
                let new_left = build_interior(pager, &combined[..mid], median.left)?;
                let new_right = build_interior(pager, &combined[mid + 1..], right_right)?;
                items[sep].key = median.key;
                items[sep].left = new_left;
                if sep + 1 < items.len() {
                    items[sep + 1].left = new_right;
                } else {
                    *rightmost = new_right;
                }
            }
        }
        _ => return Err(TurError::CorruptPage(left_no)),
    }
    Ok(())
}

fn scan_rec(
    pager: &Pager,
    cancel: &CancelToken,
    page_no: PageNo,
    depth: usize,
    callback: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
) -> Result<bool> {
    if depth > MAX_BTREE_DEPTH {
        return Err(TurError::Corruption(
            "B-tree depth exceeds maximum (possible cycle)".into(),
        ));
    }
    cancel.check()?;
    let page = pager.read_with(page_no, cancel)?;
    match node_type(&page) {
        Some(PageType::BtreeLeaf) => {
            for i in 0..cell_count(&page) {
                let (key, value) = leaf_entry(&page, i)?;
                let assembled = materialize(pager, cancel, value)?;
                if !callback(key, &assembled)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Some(PageType::BtreeInterior) => {
            for i in 0..cell_count(&page) {
                let (_, child) = interior_entry(&page, i)?;
                if !scan_rec(pager, cancel, child, depth + 1, callback)? {
                    return Ok(false);
                }
            }
            scan_rec(pager, cancel, rightmost_child(&page), depth + 1, callback)
        }
        _ => Err(TurError::CorruptPage(page_no)),
    }
}

fn scan_keys_rec(
    pager: &Pager,
    cancel: &CancelToken,
    page_no: PageNo,
    depth: usize,
    callback: &mut dyn FnMut(&[u8]) -> Result<bool>,
) -> Result<bool> {
    if depth > MAX_BTREE_DEPTH {
        return Err(TurError::Corruption(
            "B-tree depth exceeds maximum (possible cycle)".into(),
        ));
    }
    cancel.check()?;
    let page = pager.read_with(page_no, cancel)?;
    match node_type(&page) {
        Some(PageType::BtreeLeaf) => {
            for i in 0..cell_count(&page) {
                let (key, _) = leaf_entry(&page, i)?;
                if !callback(key)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Some(PageType::BtreeInterior) => {
            for i in 0..cell_count(&page) {
                let (_, child) = interior_entry(&page, i)?;
                if !scan_keys_rec(pager, cancel, child, depth + 1, callback)? {
                    return Ok(false);
                }
            }
            scan_keys_rec(pager, cancel, rightmost_child(&page), depth + 1, callback)
        }
        _ => Err(TurError::CorruptPage(page_no)),
    }
}

fn collect_rec(
    pager: &Pager,
    cancel: &CancelToken,
    page_no: PageNo,
    depth: usize,
    pages: &mut Vec<PageNo>,
) -> Result<()> {
    if depth > MAX_BTREE_DEPTH {
        return Err(TurError::Corruption(
            "B-tree depth exceeds maximum (possible cycle)".into(),
        ));
    }
    cancel.check()?;
    pages.push(page_no);
    let page = pager.read_with(page_no, cancel)?;
    match node_type(&page) {
        Some(PageType::BtreeLeaf) => {
            for i in 0..cell_count(&page) {
                let (_, value) = leaf_entry(&page, i)?;
                if let LeafValue::Overflow { first_page, .. } = value {
                    pages.extend(overflow::chain_pages(pager, cancel, first_page)?);
                }
            }
            Ok(())
        }
        Some(PageType::BtreeInterior) => {
            for i in 0..cell_count(&page) {
                let (_, child) = interior_entry(&page, i)?;
                collect_rec(pager, cancel, child, depth + 1, pages)?;
            }
            collect_rec(pager, cancel, rightmost_child(&page), depth + 1, pages)
        }
        _ => Err(TurError::CorruptPage(page_no)),
    }
}
