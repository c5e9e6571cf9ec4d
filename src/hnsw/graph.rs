//! Persistent HNSW proximity graph: build, search, rebuild-on-swap.
//!
//! The whole graph lives in memory (loaded from its node pages at open) and
//! every mutation is written back through the pager, so node pages ride the
//! same WAL/checkpoint path as everything else. Searches never touch disk.
//!
//! Concurrency: searches take the graph read lock plus short per-node
//! shared locks on neighbor lists. One insert runs at a time (index write
//! mutex); it holds the graph write lock only for map/metadata updates and
//! takes per-node list locks one at a time while linking, so searches
//! overlap with the bulk of construction. `rebuild` assembles a complete
//! replacement graph in fresh pages and swaps it in under one brief write
//! lock; old pages are retired through the epoch manager.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use rand::Rng;

use crate::btree::key_encoding::{decode_u64, encode_u64};
use crate::btree::ops::BTree;
use crate::cancel::CancelToken;
use crate::concurrency::epoch::EpochManager;
use crate::error::{Result, TurError};
use crate::hnsw::distance::{cosine_distance, normalize};
use crate::hnsw::node::{
    decode_meta, decode_node, encode_meta, encode_node, MetaRecord, NodeRecord, NO_ENTRY,
};
use crate::storage::page::{PageNo, LARGE_PAGE_SIZE};
use crate::storage::pager::Pager;

pub const MAX_DIM: usize = 8192;
const MAX_LEVEL: u8 = 15;

#[derive(Debug, Clone, Copy)]
pub struct HnswParams {
    /// Neighbor cap on layers above 0.
    pub m: usize,
    /// Neighbor cap on layer 0.
    pub m_max0: usize,
    /// Beam width during construction.
    pub ef_construction: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        HnswParams {
            m: 16,
            m_max0: 32,
            ef_construction: 200,
        }
    }
}

struct Node {
    id: u64,
    rowid: u64,
    level: u8,
    page: PageNo,
    vector: Vec<f32>,
    /// One list per layer; writers hold the list lock, readers take it
    /// shared for the duration of one hop.
    neighbors: Vec<RwLock<Vec<u64>>>,
}

impl Node {
    fn snapshot(&self) -> NodeRecord {
        NodeRecord {
            id: self.id,
            level: self.level,
            rowid: self.rowid,
            vector: self.vector.clone(),
            neighbors: self.neighbors.iter().map(|l| l.read().clone()).collect(),
        }
    }
}

struct GraphState {
    entry: Option<u64>,
    max_level: u8,
    count: u64,
    next_id: u64,
    node_tree: BTree,
    nodes: HashMap<u64, Arc<Node>>,
}

pub struct HnswIndex {
    meta_page: PageNo,
    page_size: usize,
    dim: usize,
    params: HnswParams,
    state: RwLock<GraphState>,
    write_lock: Mutex<()>,
}

/// (distance, node id) with total order; NaNs sort as equal and lose ties
/// by id so the heaps stay deterministic.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    dist: f32,
    id: u64,
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist
            .partial_cmp(&other.dist)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl HnswIndex {
    /// Create an empty index; its metadata page goes into the header's
    /// vector-roots array (the caller registers it).
    pub fn create(pager: &Pager, dim: usize, params: HnswParams) -> Result<HnswIndex> {
        if dim == 0 || dim > MAX_DIM {
            return Err(TurError::DimensionMismatch {
                expected: MAX_DIM,
                got: dim,
            });
        }
        let meta_page = pager.allocate()?;
        let node_tree = BTree::create(pager)?;
        let index = HnswIndex {
            meta_page,
            page_size: pager.page_size(),
            dim,
            params,
            state: RwLock::new(GraphState {
                entry: None,
                max_level: 0,
                count: 0,
                next_id: 1,
                node_tree,
                nodes: HashMap::new(),
            }),
            write_lock: Mutex::new(()),
        };
        index.persist_meta(pager, &index.state.read())?;
        Ok(index)
    }

    /// Load an index from its metadata page, pulling every node page into
    /// memory through the node directory.
    pub fn open(pager: &Pager, cancel: &CancelToken, meta_page: PageNo) -> Result<HnswIndex> {
        let guard = pager.read_with(meta_page, cancel)?;
        let meta = decode_meta(&guard)?;
        drop(guard);

        let node_tree = BTree::open(meta.node_tree_root);
        let mut nodes = HashMap::with_capacity(meta.count as usize);
        let mut pages = Vec::with_capacity(meta.count as usize);
        node_tree.scan(pager, cancel, |key, value| {
            if key.len() != 8 || value.len() != 4 {
                return Err(TurError::Corruption("malformed HNSW node directory".into()));
            }
            let id = decode_u64(key.try_into().unwrap());
            let page = u32::from_be_bytes(value.try_into().unwrap());
            pages.push((id, page));
            Ok(true)
        })?;
        for (id, page_no) in pages {
            cancel.check()?;
            let guard = pager.read_large(page_no, cancel)?;
            let record = decode_node(&guard)?;
            if record.id != id {
                return Err(TurError::Corruption(format!(
                    "HNSW node page {} carries id {}, directory says {}",
                    page_no, record.id, id
                )));
            }
            nodes.insert(id, Arc::new(node_from_record(record, page_no)));
        }

        Ok(HnswIndex {
            meta_page,
            page_size: pager.page_size(),
            dim: meta.dim as usize,
            params: HnswParams {
                m: meta.m as usize,
                m_max0: meta.m_max0 as usize,
                ef_construction: meta.ef_construction as usize,
            },
            state: RwLock::new(GraphState {
                entry: if meta.entry == NO_ENTRY {
                    None
                } else {
                    Some(meta.entry)
                },
                max_level: meta.max_level,
                count: meta.count,
                next_id: meta.next_node_id,
                node_tree,
                nodes,
            }),
            write_lock: Mutex::new(()),
        })
    }

    pub fn meta_page(&self) -> PageNo {
        self.meta_page
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> u64 {
        self.state.read().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_dim(&self, len: usize) -> Result<()> {
        if len != self.dim {
            return Err(TurError::DimensionMismatch {
                expected: self.dim,
                got: len,
            });
        }
        Ok(())
    }

    fn cap(&self, level: usize) -> usize {
        if level == 0 {
            self.params.m_max0
        } else {
            self.params.m
        }
    }

    /// Insert a vector for `rowid`. The vector is normalized here; the
    /// rowid's visibility remains the base table's business.
    pub fn insert(
        &self,
        pager: &Pager,
        epoch: &Arc<EpochManager>,
        cancel: &CancelToken,
        rowid: u64,
        vector: &[f32],
    ) -> Result<()> {
        self.check_dim(vector.len())?;
        cancel.check()?;
        let mut q = vector.to_vec();
        normalize(&mut q);

        let _writer = self.write_lock.lock();
        let level = sample_level(self.params.m);

        let page_no = pager.allocate_large()?;
        let id = self.state.read().next_id;

        // Phase 1: find neighbors under a shared lock so searches proceed.
        let selected: Vec<Vec<u64>> = {
            let state = self.state.read();
            match state.entry {
                None => vec![Vec::new(); level as usize + 1],
                Some(entry) => {
                    let mut cur = entry;
                    let top = state.max_level;
                    for lvl in ((level + 1)..=top).rev() {
                        cur = greedy_step(&state.nodes, &q, cur, lvl as usize, cancel)?;
                    }
                    let mut selected = vec![Vec::new(); level as usize + 1];
                    let mut entries = vec![cur];
                    for lvl in (0..=level.min(top)).rev() {
                        let found = search_layer(
                            &state.nodes,
                            &q,
                            &entries,
                            self.params.ef_construction,
                            lvl as usize,
                            cancel,
                        )?;
                        let keep =
                            select_neighbors(&state.nodes, &found, self.cap(lvl as usize));
                        entries = found.iter().map(|s| s.id).collect();
                        selected[lvl as usize] = keep;
                    }
                    selected
                }
            }
        };

        let node = Arc::new(Node {
            id,
            rowid,
            level,
            page: page_no,
            vector: q.clone(),
            neighbors: selected.iter().map(|l| RwLock::new(l.clone())).collect(),
        });

        // Phase 2: publish the node and its directory entry.
        {
            let mut state = self.state.write();
            state.nodes.insert(id, Arc::clone(&node));
            state.next_id = id + 1;
            state.count += 1;
            if state.entry.is_none() || level > state.max_level {
                state.entry = Some(id);
                state.max_level = state.max_level.max(level);
            }
            state
                .node_tree
                .insert(pager, epoch, cancel, &encode_u64(id), &page_no.to_be_bytes())?;
        }

        // Phase 3: backlinks, one neighbor list at a time.
        let mut touched: HashSet<u64> = HashSet::new();
        {
            let state = self.state.read();
            for (lvl, ids) in selected.iter().enumerate() {
                for &nid in ids {
                    let Some(neighbor) = state.nodes.get(&nid) else {
                        continue;
                    };
                    let cap = self.cap(lvl);
                    {
                        let mut list = neighbor.neighbors[lvl].write();
                        if !list.contains(&id) {
                            list.push(id);
                        }
                        if list.len() > cap {
                            let pruned = prune_list(&state.nodes, &neighbor.vector, &list, cap);
                            *list = pruned;
                        }
                    }
                    touched.insert(nid);
                }
            }

            // Phase 4: persistence. The new node, every touched neighbor,
            // and the metadata page.
            self.persist_node(pager, &node)?;
            for nid in &touched {
                if let Some(neighbor) = state.nodes.get(nid) {
                    self.persist_node(pager, neighbor)?;
                }
            }
            self.persist_meta(pager, &state)?;
        }
        Ok(())
    }

    /// k nearest neighbors by cosine distance, ascending. Pure in-memory.
    pub fn search(
        &self,
        cancel: &CancelToken,
        query: &[f32],
        k: usize,
        ef_search: usize,
    ) -> Result<Vec<(u64, f32)>> {
        self.check_dim(query.len())?;
        cancel.check()?;
        let mut q = query.to_vec();
        normalize(&mut q);

        let state = self.state.read();
        let Some(entry) = state.entry else {
            return Ok(Vec::new());
        };
        let mut cur = entry;
        for lvl in (1..=state.max_level).rev() {
            cur = greedy_step(&state.nodes, &q, cur, lvl as usize, cancel)?;
        }
        let beam = ef_search.max(k).max(1);
        let found = search_layer(&state.nodes, &q, &[cur], beam, 0, cancel)?;

        let mut results: Vec<(u64, f32)> = found
            .into_iter()
            .filter_map(|s| state.nodes.get(&s.id).map(|n| (n.rowid, s.dist)))
            .collect();
        results.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(k);
        Ok(results)
    }

    /// Build a replacement graph in fresh pages and atomically swap it in.
    /// Readers keep traversing the old graph until the swap; its pages are
    /// retired through the epoch manager afterwards.
    pub fn rebuild(
        &self,
        pager: &Pager,
        epoch: &Arc<EpochManager>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let _writer = self.write_lock.lock();

        // Snapshot the payload and the pages to retire.
        let (items, old_pages) = {
            let state = self.state.read();
            let mut items: Vec<(u64, Vec<f32>)> = state
                .nodes
                .values()
                .map(|n| (n.rowid, n.vector.clone()))
                .collect();
            items.sort_by_key(|&(rowid, _)| rowid);
            let mut old_pages = Vec::new();
            let chunks = (LARGE_PAGE_SIZE / self.page_size) as u32;
            for node in state.nodes.values() {
                for i in 0..chunks {
                    old_pages.push(node.page + i);
                }
            }
            old_pages.extend(state.node_tree.collect_pages(pager, cancel)?);
            (items, old_pages)
        };

        // Assemble the new graph offline.
        let mut fresh = GraphState {
            entry: None,
            max_level: 0,
            count: 0,
            next_id: 1,
            node_tree: BTree::create(pager)?,
            nodes: HashMap::with_capacity(items.len()),
        };
        for (rowid, vector) in items {
            cancel.check()?;
            let level = sample_level(self.params.m);
            let id = fresh.next_id;
            let page_no = pager.allocate_large()?;

            let selected: Vec<Vec<u64>> = match fresh.entry {
                None => vec![Vec::new(); level as usize + 1],
                Some(entry) => {
                    let mut cur = entry;
                    for lvl in ((level + 1)..=fresh.max_level).rev() {
                        cur = greedy_step(&fresh.nodes, &vector, cur, lvl as usize, cancel)?;
                    }
                    let mut selected = vec![Vec::new(); level as usize + 1];
                    let mut entries = vec![cur];
                    for lvl in (0..=level.min(fresh.max_level)).rev() {
                        let found = search_layer(
                            &fresh.nodes,
                            &vector,
                            &entries,
                            self.params.ef_construction,
                            lvl as usize,
                            cancel,
                        )?;
                        let keep =
                            select_neighbors(&fresh.nodes, &found, self.cap(lvl as usize));
                        entries = found.iter().map(|s| s.id).collect();
                        selected[lvl as usize] = keep;
                    }
                    selected
                }
            };

            let node = Arc::new(Node {
                id,
                rowid,
                level,
                page: page_no,
                vector,
                neighbors: selected.iter().map(|l| RwLock::new(l.clone())).collect(),
            });
            for (lvl, ids) in selected.iter().enumerate() {
                for nid in ids {
                    let Some(neighbor) = fresh.nodes.get(nid) else {
                        continue;
                    };
                    let cap = self.cap(lvl);
                    let mut list = neighbor.neighbors[lvl].write();
                    if !list.contains(&id) {
                        list.push(id);
                    }
                    if list.len() > cap {
                        let pruned = prune_list(&fresh.nodes, &neighbor.vector, &list, cap);
                        *list = pruned;
                    }
                }
            }
            if fresh.entry.is_none() || level > fresh.max_level {
                fresh.entry = Some(id);
                fresh.max_level = fresh.max_level.max(level);
            }
            fresh.nodes.insert(id, node);
            fresh.next_id = id + 1;
            fresh.count += 1;
        }

        // Persist the replacement, then swap.
        for node in fresh.nodes.values() {
            self.persist_node(pager, node)?;
            fresh.node_tree.insert(
                pager,
                epoch,
                cancel,
                &encode_u64(node.id),
                &node.page.to_be_bytes(),
            )?;
        }
        self.persist_meta(pager, &fresh)?;

        {
            let mut state = self.state.write();
            *state = fresh;
        }
        let retired = old_pages.len();
        epoch.retire(old_pages);
        info!("hnsw rebuild: swapped in fresh graph, retired {} pages", retired);
        Ok(())
    }

    fn persist_node(&self, pager: &Pager, node: &Node) -> Result<()> {
        let page = encode_node(node.page, &node.snapshot())?;
        pager.write_page(page)
    }

    fn persist_meta(&self, pager: &Pager, state: &GraphState) -> Result<()> {
        let meta = MetaRecord {
            dim: self.dim as u32,
            m: self.params.m as u32,
            m_max0: self.params.m_max0 as u32,
            ef_construction: self.params.ef_construction as u32,
            entry: state.entry.unwrap_or(NO_ENTRY),
            max_level: state.max_level,
            count: state.count,
            next_node_id: state.next_id,
            node_tree_root: state.node_tree.root(),
        };
        pager.write_page(encode_meta(self.meta_page, self.page_size, &meta))
    }
}

fn node_from_record(record: NodeRecord, page: PageNo) -> Node {
    Node {
        id: record.id,
        rowid: record.rowid,
        level: record.level,
        page,
        vector: record.vector,
        neighbors: record.neighbors.into_iter().map(RwLock::new).collect(),
    }
}

/// Geometric level sampling with parameter 1/ln(M).
fn sample_level(m: usize) -> u8 {
    let ml = 1.0 / (m.max(2) as f64).ln();
    let u: f64 = 1.0 - rand::thread_rng().gen::<f64>(); // (0, 1]
    let level = (-u.ln() * ml).floor();
    (level as u64).min(MAX_LEVEL as u64) as u8
}

fn node_dist(nodes: &HashMap<u64, Arc<Node>>, q: &[f32], id: u64) -> Result<f32> {
    let node = nodes
        .get(&id)
        .ok_or_else(|| TurError::Corruption(format!("HNSW graph references missing node {}", id)))?;
    Ok(cosine_distance(q, &node.vector))
}

/// Greedy ef=1 walk on one layer: hop to the closest neighbor until no
/// neighbor improves.
fn greedy_step(
    nodes: &HashMap<u64, Arc<Node>>,
    q: &[f32],
    start: u64,
    level: usize,
    cancel: &CancelToken,
) -> Result<u64> {
    let mut cur = start;
    let mut cur_dist = node_dist(nodes, q, cur)?;
    loop {
        cancel.check()?;
        let mut improved = false;
        let neighbor_ids: Vec<u64> = {
            let node = nodes.get(&cur).ok_or_else(|| {
                TurError::Corruption(format!("HNSW graph references missing node {}", cur))
            })?;
            match node.neighbors.get(level) {
                Some(list) => list.read().clone(),
                None => Vec::new(),
            }
        };
        for id in neighbor_ids {
            let dist = node_dist(nodes, q, id)?;
            if dist < cur_dist {
                cur = id;
                cur_dist = dist;
                improved = true;
            }
        }
        if !improved {
            return Ok(cur);
        }
    }
}

/// Bounded-beam search on one layer. Returns up to `ef` closest, ascending.
fn search_layer(
    nodes: &HashMap<u64, Arc<Node>>,
    q: &[f32],
    entries: &[u64],
    ef: usize,
    level: usize,
    cancel: &CancelToken,
) -> Result<Vec<Scored>> {
    let mut visited: HashSet<u64> = HashSet::new();
    let mut candidates: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
    let mut results: BinaryHeap<Scored> = BinaryHeap::new();

    for &id in entries {
        if !visited.insert(id) {
            continue;
        }
        let scored = Scored {
            dist: node_dist(nodes, q, id)?,
            id,
        };
        candidates.push(Reverse(scored));
        results.push(scored);
    }
    while results.len() > ef {
        results.pop();
    }

    while let Some(Reverse(closest)) = candidates.pop() {
        cancel.check()?;
        let bound = results.peek().map(|w| w.dist).unwrap_or(f32::INFINITY);
        if closest.dist > bound && results.len() >= ef {
            break;
        }
        let neighbor_ids: Vec<u64> = {
            let node = nodes.get(&closest.id).ok_or_else(|| {
                TurError::Corruption(format!("HNSW graph references missing node {}", closest.id))
            })?;
            match node.neighbors.get(level) {
                Some(list) => list.read().clone(),
                None => Vec::new(),
            }
        };
        for id in neighbor_ids {
            if !visited.insert(id) {
                continue;
            }
            let dist = node_dist(nodes, q, id)?;
            let bound = results.peek().map(|w| w.dist).unwrap_or(f32::INFINITY);
            if results.len() < ef || dist < bound {
                let scored = Scored { dist, id };
                candidates.push(Reverse(scored));
                results.push(scored);
                if results.len() > ef {
                    results.pop();
                }
            }
        }
    }

    let mut out = results.into_vec();
    out.sort();
    Ok(out)
}

/// Diversity heuristic: walk candidates closest-first (their `dist` is the
/// distance to the base vector), keep one when it is closer to the base than
/// to every already-kept neighbor, then fill any remaining slots with the
/// nearest discards.
fn select_neighbors(
    nodes: &HashMap<u64, Arc<Node>>,
    candidates: &[Scored],
    cap: usize,
) -> Vec<u64> {
    let mut kept: Vec<Scored> = Vec::with_capacity(cap);
    let mut discarded: Vec<Scored> = Vec::new();

    for &candidate in candidates {
        if kept.len() >= cap {
            break;
        }
        let Some(cand_node) = nodes.get(&candidate.id) else {
            continue;
        };
        let diverse = kept.iter().all(|s| {
            nodes
                .get(&s.id)
                .map(|kept_node| {
                    candidate.dist < cosine_distance(&cand_node.vector, &kept_node.vector)
                })
                .unwrap_or(true)
        });
        if diverse {
            kept.push(candidate);
        } else {
            discarded.push(candidate);
        }
    }
    for candidate in discarded {
        if kept.len() >= cap {
            break;
        }
        kept.push(candidate);
    }
    kept.into_iter().map(|s| s.id).collect()
}

/// Re-apply the selection heuristic to an over-full neighbor list.
fn prune_list(
    nodes: &HashMap<u64, Arc<Node>>,
    base: &[f32],
    list: &[u64],
    cap: usize,
) -> Vec<u64> {
    let mut scored: Vec<Scored> = list
        .iter()
        .filter_map(|&id| {
            nodes.get(&id).map(|n| Scored {
                dist: cosine_distance(base, &n.vector),
                id,
            })
        })
        .collect();
    scored.sort();
    let out = select_neighbors(nodes, &scored, cap);
    debug!("hnsw prune: {} -> {} neighbors", list.len(), out.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::DEFAULT_PAGE_SIZE;
    use crate::storage::pager::DEFAULT_CACHE_FRAMES;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        pager: Pager,
        epoch: Arc<EpochManager>,
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
        Fixture {
            _dir: dir,
            pager,
            epoch: EpochManager::new(),
        }
    }

    fn random_vectors(seed: u64, count: usize, dim: usize) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| (0..dim).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect())
            .collect()
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let f = fixture();
        let index = HnswIndex::create(&f.pager, 8, HnswParams::default()).unwrap();
        let err = index.insert(&f.pager, &f.epoch, &CancelToken::none(), 1, &[0.0; 4]);
        assert!(matches!(
            err,
            Err(TurError::DimensionMismatch { expected: 8, got: 4 })
        ));
        let err = index.search(&CancelToken::none(), &[0.0; 16], 1, 10);
        assert!(matches!(err, Err(TurError::DimensionMismatch { .. })));
    }

    #[test]
    fn empty_index_returns_no_hits() {
        let f = fixture();
        let index = HnswIndex::create(&f.pager, 4, HnswParams::default()).unwrap();
        assert!(index
            .search(&CancelToken::none(), &[1.0, 0.0, 0.0, 0.0], 5, 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn exact_vector_is_top_hit_with_near_zero_distance() {
        let f = fixture();
        let index = HnswIndex::create(&f.pager, 16, HnswParams::default()).unwrap();
        let vectors = random_vectors(42, 200, 16);
        for (rowid, v) in vectors.iter().enumerate() {
            index
                .insert(&f.pager, &f.epoch, &CancelToken::none(), rowid as u64, v)
                .unwrap();
        }

        let hits = index.search(&CancelToken::none(), &vectors[0], 5, 50).unwrap();
        assert_eq!(hits[0].0, 0, "query vector itself must rank first");
        assert!(hits[0].1.abs() < 1e-5);
        // Ascending distances.
        for pair in hits.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
    }

    #[test]
    fn sample_level_is_bounded_and_mostly_zero() {
        let mut zeros = 0;
        for _ in 0..1000 {
            let level = sample_level(16);
            assert!(level <= MAX_LEVEL);
            if level == 0 {
                zeros += 1;
            }
        }
        // With mL = 1/ln(16), P(level = 0) ≈ 1 − e^(−ln16) ≈ 0.94.
        assert!(zeros > 800, "only {} of 1000 at level 0", zeros);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.db");
        let epoch = EpochManager::new();
        let meta_page;
        let vectors = random_vectors(7, 50, 8);
        {
            let pager =
                Pager::create(&path, DEFAULT_PAGE_SIZE, DEFAULT_CACHE_FRAMES, false).unwrap();
            let index = HnswIndex::create(&pager, 8, HnswParams::default()).unwrap();
            meta_page = index.meta_page();
            for (rowid, v) in vectors.iter().enumerate() {
                index
                    .insert(&pager, &epoch, &CancelToken::none(), rowid as u64, v)
                    .unwrap();
            }
            pager.flush_dirty(&CancelToken::none()).unwrap();
            pager.sync().unwrap();
        }
        {
            let pager = Pager::open(&path, DEFAULT_CACHE_FRAMES, false, false).unwrap();
            let index = HnswIndex::open(&pager, &CancelToken::none(), meta_page).unwrap();
            assert_eq!(index.len(), 50);
            let hits = index.search(&CancelToken::none(), &vectors[3], 3, 40).unwrap();
            assert_eq!(hits[0].0, 3);
        }
    }

    #[test]
    fn rebuild_preserves_search_quality() {
        let f = fixture();
        let index = HnswIndex::create(&f.pager, 12, HnswParams::default()).unwrap();
        let vectors = random_vectors(99, 120, 12);
        for (rowid, v) in vectors.iter().enumerate() {
            index
                .insert(&f.pager, &f.epoch, &CancelToken::none(), rowid as u64, v)
                .unwrap();
        }
        index.rebuild(&f.pager, &f.epoch, &CancelToken::none()).unwrap();
        assert_eq!(index.len(), 120);
        assert!(f.epoch.retired_count() > 0, "old graph pages retired");

        let hits = index.search(&CancelToken::none(), &vectors[10], 5, 50).unwrap();
        assert_eq!(hits[0].0, 10);
    }

    #[test]
    fn neighbor_lists_respect_caps() {
        let f = fixture();
        let params = HnswParams {
            m: 4,
            m_max0: 6,
            ef_construction: 40,
        };
        let index = HnswIndex::create(&f.pager, 8, params).unwrap();
        for (rowid, v) in random_vectors(3, 100, 8).iter().enumerate() {
            index
                .insert(&f.pager, &f.epoch, &CancelToken::none(), rowid as u64, v)
                .unwrap();
        }
        let state = index.state.read();
        for node in state.nodes.values() {
            for (lvl, list) in node.neighbors.iter().enumerate() {
                let cap = if lvl == 0 { params.m_max0 } else { params.m };
                assert!(
                    list.read().len() <= cap,
                    "node {} level {} over cap",
                    node.id,
                    lvl
                );
            }
        }
    }
}
