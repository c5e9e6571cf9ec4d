//! On-disk HNSW node and metadata formats.
//!
//! Node pages are 64 KiB:
//!
//!   [type: u8 = HNSW_NODE] [node_id u64] [level u8] [rowid u64] [dim u32]
//!   [vector: dim * f32 bits BE]
//!   per layer 0..=level: [count u16] [count * node_id u64]
//!   ... [crc trailer]
//!
//! The metadata page (regular size, pointed at by the header's
//! vector-index-roots array):
//!
//!   [type: u8 = HNSW_META] [dim u32] [m u32] [m_max0 u32]
//!   [ef_construction u32] [entry u64, MAX = none] [max_level u8]
//!   [count u64] [next_node_id u64] [node_tree_root u32] ... [crc trailer]

use crate::error::{Result, TurError};
use crate::storage::page::{Page, PageNo, PageType, LARGE_PAGE_SIZE, PAGE_TRAILER_SIZE};

pub const NO_ENTRY: u64 = u64::MAX;
const NODE_FIXED: usize = 1 + 8 + 1 + 8 + 4;
const META_LEN: usize = 1 + 4 + 4 + 4 + 4 + 8 + 1 + 8 + 8 + 4;

/// Decoded node page.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: u64,
    pub level: u8,
    pub rowid: u64,
    pub vector: Vec<f32>,
    /// One list per layer, index 0 = layer 0.
    pub neighbors: Vec<Vec<u64>>,
}

pub fn encode_node(page_no: PageNo, record: &NodeRecord) -> Result<Page> {
    let needed = NODE_FIXED
        + record.vector.len() * 4
        + record
            .neighbors
            .iter()
            .map(|l| 2 + l.len() * 8)
            .sum::<usize>()
        + PAGE_TRAILER_SIZE;
    if needed > LARGE_PAGE_SIZE {
        return Err(TurError::Corruption(format!(
            "HNSW node {} needs {} bytes, page holds {}",
            record.id, needed, LARGE_PAGE_SIZE
        )));
    }
    let mut page = Page::with_type(page_no, LARGE_PAGE_SIZE, PageType::HnswNode);
    let data = page.data_mut();
    data[1..9].copy_from_slice(&record.id.to_be_bytes());
    data[9] = record.level;
    data[10..18].copy_from_slice(&record.rowid.to_be_bytes());
    data[18..22].copy_from_slice(&(record.vector.len() as u32).to_be_bytes());
    let mut at = NODE_FIXED;
    for &x in &record.vector {
        data[at..at + 4].copy_from_slice(&x.to_bits().to_be_bytes());
        at += 4;
    }
    debug_assert_eq!(record.neighbors.len(), record.level as usize + 1);
    for layer in &record.neighbors {
        data[at..at + 2].copy_from_slice(&(layer.len() as u16).to_be_bytes());
        at += 2;
        for &id in layer {
            data[at..at + 8].copy_from_slice(&id.to_be_bytes());
            at += 8;
        }
    }
    Ok(page)
}

pub fn decode_node(page: &Page) -> Result<NodeRecord> {
    if page.page_type() != Some(PageType::HnswNode) {
        return Err(TurError::CorruptPage(page.no()));
    }
    let data = page.data();
    let id = u64::from_be_bytes(data[1..9].try_into().unwrap());
    let level = data[9];
    let rowid = u64::from_be_bytes(data[10..18].try_into().unwrap());
    let dim = u32::from_be_bytes(data[18..22].try_into().unwrap()) as usize;

    let mut at = NODE_FIXED;
    let limit = data.len() - PAGE_TRAILER_SIZE;
    if at + dim * 4 > limit {
        return Err(TurError::CorruptPage(page.no()));
    }
    let mut vector = Vec::with_capacity(dim);
    for _ in 0..dim {
        vector.push(f32::from_bits(u32::from_be_bytes(
            data[at..at + 4].try_into().unwrap(),
        )));
        at += 4;
    }
    let mut neighbors = Vec::with_capacity(level as usize + 1);
    for _ in 0..=level {
        if at + 2 > limit {
            return Err(TurError::CorruptPage(page.no()));
        }
        let count = u16::from_be_bytes(data[at..at + 2].try_into().unwrap()) as usize;
        at += 2;
        if at + count * 8 > limit {
            return Err(TurError::CorruptPage(page.no()));
        }
        let mut layer = Vec::with_capacity(count);
        for _ in 0..count {
            layer.push(u64::from_be_bytes(data[at..at + 8].try_into().unwrap()));
            at += 8;
        }
        neighbors.push(layer);
    }
    Ok(NodeRecord {
        id,
        level,
        rowid,
        vector,
        neighbors,
    })
}

/// Decoded metadata page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaRecord {
    pub dim: u32,
    pub m: u32,
    pub m_max0: u32,
    pub ef_construction: u32,
    /// `NO_ENTRY` when the graph is empty.
    pub entry: u64,
    pub max_level: u8,
    pub count: u64,
    pub next_node_id: u64,
    pub node_tree_root: PageNo,
}

pub fn encode_meta(page_no: PageNo, page_size: usize, meta: &MetaRecord) -> Page {
    debug_assert!(page_size >= META_LEN + PAGE_TRAILER_SIZE);
    let mut page = Page::with_type(page_no, page_size, PageType::HnswMeta);
    let data = page.data_mut();
    data[1..5].copy_from_slice(&meta.dim.to_be_bytes());
    data[5..9].copy_from_slice(&meta.m.to_be_bytes());
    data[9..13].copy_from_slice(&meta.m_max0.to_be_bytes());
    data[13..17].copy_from_slice(&meta.ef_construction.to_be_bytes());
    data[17..25].copy_from_slice(&meta.entry.to_be_bytes());
    data[25] = meta.max_level;
    data[26..34].copy_from_slice(&meta.count.to_be_bytes());
    data[34..42].copy_from_slice(&meta.next_node_id.to_be_bytes());
    data[42..46].copy_from_slice(&meta.node_tree_root.to_be_bytes());
    page
}

pub fn decode_meta(page: &Page) -> Result<MetaRecord> {
    if page.page_type() != Some(PageType::HnswMeta) {
        return Err(TurError::CorruptPage(page.no()));
    }
    let data = page.data();
    Ok(MetaRecord {
        dim: u32::from_be_bytes(data[1..5].try_into().unwrap()),
        m: u32::from_be_bytes(data[5..9].try_into().unwrap()),
        m_max0: u32::from_be_bytes(data[9..13].try_into().unwrap()),
        ef_construction: u32::from_be_bytes(data[13..17].try_into().unwrap()),
        entry: u64::from_be_bytes(data[17..25].try_into().unwrap()),
        max_level: data[25],
        count: u64::from_be_bytes(data[26..34].try_into().unwrap()),
        next_node_id: u64::from_be_bytes(data[34..42].try_into().unwrap()),
        node_tree_root: u32::from_be_bytes(data[42..46].try_into().unwrap()),
    })
}
