use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use roaring::RoaringBitmap;

use annidx_core::{Error, Result};

use crate::distances::squared_l2;
use crate::engine::{Engine, SearchRow};

type NodeId = u32;

const DEFAULT_EF_CONSTRUCTION: usize = 100;
const DEFAULT_EF_SEARCH: usize = 100;

/// Hierarchical navigable small-world graph: the `HNSW<M>` factory token.
/// Supports add but, being append-only by construction, never physically
/// removes a node -- `delete` soft-marks it in the `deleted` bitmap and the
/// Index Controller is responsible for rebuilding this engine from the
/// Descriptor Store when a hard removal is required.
///
/// Node ids are the same dense internal indices the Bimap hands out, so the
/// node table is addressed directly by index; this caps a single HNSW
/// pipeline at `u32::MAX` live+tombstoned entries, the same limit this
/// engine's grounding code (`NodeId = u32`) already had.
#[derive(Debug)]
pub struct HnswEngine {
    dim: usize,
    m: usize,
    ef_construction: usize,
    ef_search: usize,
    seed: u64,
    nodes: RwLock<Vec<Node>>,
    vectors: RwLock<Vec<Vec<f32>>>,
    deleted: RwLock<RoaringBitmap>,
    entry_point: AtomicU32,
    max_layer: AtomicU32,
}

#[derive(Debug, Default, Clone)]
struct Node {
    present: bool,
    layers: Vec<RwLock<Vec<NodeId>>>,
}

#[derive(Debug, Copy, Clone, PartialEq)]
struct Candidate {
    id: NodeId,
    distance: f64,
}

impl Eq for Candidate {}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(CmpOrdering::Equal)
    }
}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct VisitedScratch {
    marks: Vec<u32>,
    generation: u32,
}

impl VisitedScratch {
    fn prepare(&mut self, len: usize) -> u32 {
        if self.marks.len() < len {
            self.marks.resize(len, 0);
        }
        self.generation = self.generation.wrapping_add(1);
        if self.generation == 0 {
            self.marks.fill(0);
            self.generation = 1;
        }
        self.generation
    }
}

#[inline]
fn mark_visited(marks: &mut [u32], generation: u32, id: NodeId) -> bool {
    let slot = &mut marks[id as usize];
    if *slot == generation {
        false
    } else {
        *slot = generation;
        true
    }
}

thread_local! {
    static VISITED_SCRATCH: RefCell<VisitedScratch> = RefCell::new(VisitedScratch::default());
}

#[derive(Archive, RkyvDeserialize, RkyvSerialize)]
#[archive(check_bytes)]
struct SnapshotNode {
    present: bool,
    layers: Vec<Vec<u32>>,
}

#[derive(Archive, RkyvDeserialize, RkyvSerialize)]
#[archive(check_bytes)]
struct SnapshotData {
    dim: u32,
    m: u32,
    ef_construction: u32,
    ef_search: u32,
    entry_point: u32,
    max_layer: u32,
    nodes: Vec<SnapshotNode>,
    vectors: Vec<Vec<f32>>,
    deleted: Vec<u8>,
}

impl HnswEngine {
    pub fn new(dim: usize, m: usize, seed: Option<u64>) -> Self {
        Self {
            dim,
            m: m.max(1),
            ef_construction: DEFAULT_EF_CONSTRUCTION,
            ef_search: DEFAULT_EF_SEARCH,
            seed: seed.unwrap_or(0),
            nodes: RwLock::new(Vec::new()),
            vectors: RwLock::new(Vec::new()),
            deleted: RwLock::new(RoaringBitmap::new()),
            entry_point: AtomicU32::new(0),
            max_layer: AtomicU32::new(0),
        }
    }

    fn check_dims(&self, vectors: &[Vec<f32>]) -> Result<()> {
        for v in vectors {
            if v.len() != self.dim {
                return Err(Error::DimensionMismatch {
                    expected: self.dim,
                    actual: v.len(),
                });
            }
        }
        Ok(())
    }

    fn random_level(&self) -> usize {
        thread_local! {
            static RNG: RefCell<Option<StdRng>> = RefCell::new(None);
        }
        RNG.with(|cell| {
            let mut rng = cell.borrow_mut();
            if rng.is_none() {
                *rng = Some(StdRng::seed_from_u64(self.seed ^ 0x9E3779B97F4A7C15));
            }
            let r = rng.as_mut().unwrap();
            let mut level = 0usize;
            // geometric distribution, mean level ~ 1/ln(M)
            let ml = 1.0 / (self.m.max(2) as f64).ln();
            while r.gen::<f64>() < (-1.0 / ml).exp() && level < 31 {
                level += 1;
            }
            level
        })
    }

    fn dist_to(&self, id: NodeId, query: &[f32]) -> f64 {
        let vectors = self.vectors.read();
        squared_l2(&vectors[id as usize], query)
    }

    fn dist_between(&self, a: NodeId, b: NodeId) -> f64 {
        let vectors = self.vectors.read();
        squared_l2(&vectors[a as usize], &vectors[b as usize])
    }

    fn search_layer0(&self, start: NodeId, query: &[f32], k: usize, ef: usize) -> Vec<(NodeId, f64)> {
        let nodes = self.nodes.read();
        let deleted = self.deleted.read();

        VISITED_SCRATCH.with(|cell| {
            let mut scratch = cell.borrow_mut();
            let generation = scratch.prepare(nodes.len());

            let ef_capacity = ef.max(k).max(16);
            let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef_capacity);
            let mut results: BinaryHeap<std::cmp::Reverse<Candidate>> =
                BinaryHeap::with_capacity(ef_capacity);

            let d = self.dist_to(start, query);
            let first = Candidate { id: start, distance: d };
            candidates.push(first);
            if !deleted.contains(start) {
                results.push(std::cmp::Reverse(first));
            }
            mark_visited(&mut scratch.marks, generation, start);

            while let Some(cand) = candidates.pop() {
                if let Some(std::cmp::Reverse(worst)) = results.peek() {
                    if results.len() >= ef && cand.distance > worst.distance {
                        break;
                    }
                }
                let node = &nodes[cand.id as usize];
                if node.layers.is_empty() {
                    continue;
                }
                let neighbors = node.layers[0].read();
                for &neighbor in neighbors.iter() {
                    if !mark_visited(&mut scratch.marks, generation, neighbor) {
                        continue;
                    }
                    let dist = self.dist_to(neighbor, query);
                    let mut add = true;
                    if let Some(std::cmp::Reverse(worst)) = results.peek() {
                        if results.len() >= ef && dist > worst.distance {
                            add = false;
                        }
                    }
                    if add {
                        let c = Candidate { id: neighbor, distance: dist };
                        candidates.push(c);
                        if !deleted.contains(neighbor) {
                            results.push(std::cmp::Reverse(c));
                            if results.len() > ef {
                                results.pop();
                            }
                        }
                    }
                }
            }

            let mut out = Vec::with_capacity(k.min(results.len()));
            while let Some(std::cmp::Reverse(c)) = results.pop() {
                out.push((c.id, c.distance));
            }
            out.reverse();
            out.truncate(k);
            out
        })
    }

    fn search_layer_candidates(
        &self,
        start: NodeId,
        query: &[f32],
        level: usize,
        ef: usize,
    ) -> BinaryHeap<Candidate> {
        let nodes = self.nodes.read();
        if nodes[start as usize].layers.len() <= level {
            return BinaryHeap::new();
        }

        VISITED_SCRATCH.with(|cell| {
            let mut scratch = cell.borrow_mut();
            let generation = scratch.prepare(nodes.len());

            let ef_capacity = ef.max(16);
            let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef_capacity);
            let mut results: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef_capacity);

            let d = self.dist_to(start, query);
            let first = Candidate { id: start, distance: d };
            candidates.push(first);
            results.push(first);
            mark_visited(&mut scratch.marks, generation, start);

            while let Some(cand) = candidates.pop() {
                let worst = results.peek().unwrap().distance;
                if cand.distance > worst && results.len() >= ef {
                    break;
                }
                let node = &nodes[cand.id as usize];
                if node.layers.len() <= level {
                    continue;
                }
                let neighbors = node.layers[level].read();
                for &neighbor in neighbors.iter() {
                    if !mark_visited(&mut scratch.marks, generation, neighbor) {
                        continue;
                    }
                    let dist = self.dist_to(neighbor, query);
                    if results.len() < ef || dist < worst {
                        let c = Candidate { id: neighbor, distance: dist };
                        candidates.push(c);
                        results.push(c);
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
            results
        })
    }

    fn select_neighbors(&self, candidates: BinaryHeap<Candidate>, m: usize) -> Vec<NodeId> {
        let mut result = Vec::with_capacity(m);
        let mut sorted = candidates.into_sorted_vec();
        while let Some(cand) = sorted.pop() {
            if result.len() >= m {
                break;
            }
            let mut is_good = true;
            for &existing in &result {
                if self.dist_between(cand.id, existing) < cand.distance {
                    is_good = false;
                    break;
                }
            }
            if is_good {
                result.push(cand.id);
            }
        }
        result
    }

    fn add_link(&self, src: NodeId, dst: NodeId, level: usize) {
        let nodes = self.nodes.read();
        let mut links = nodes[src as usize].layers[level].write();
        if !links.contains(&dst) {
            links.push(dst);
        }
    }

    fn prune_connections(&self, node_id: NodeId, level: usize, max_links: usize) {
        let initial: Vec<NodeId> = {
            let nodes = self.nodes.read();
            nodes[node_id as usize].layers[level].read().clone()
        };
        let candidates: BinaryHeap<Candidate> = initial
            .iter()
            .map(|&n| Candidate {
                id: n,
                distance: self.dist_between(node_id, n),
            })
            .collect();
        let mut keepers = self.select_neighbors(candidates, max_links);

        let nodes = self.nodes.read();
        let mut links = nodes[node_id as usize].layers[level].write();
        if links.len() > initial.len() {
            for &id in links.iter() {
                if !initial.contains(&id) && keepers.len() < max_links {
                    keepers.push(id);
                }
            }
        }
        *links = keepers;
    }

    fn insert_one(&self, idx: NodeId, vector: Vec<f32>) {
        {
            let mut vectors = self.vectors.write();
            if vectors.len() <= idx as usize {
                vectors.resize(idx as usize + 1, Vec::new());
            }
            vectors[idx as usize] = vector;
        }

        let new_level = self.random_level();
        let max_layer = self.max_layer.load(Ordering::Relaxed);
        let entry_point = self.entry_point.load(Ordering::Relaxed);

        {
            let mut nodes = self.nodes.write();
            if nodes.len() <= idx as usize {
                nodes.resize_with(idx as usize + 1, Node::default);
            }
            let layers = (0..=new_level).map(|_| RwLock::new(Vec::new())).collect();
            nodes[idx as usize] = Node { present: true, layers };
        }

        let first_insert = {
            let nodes = self.nodes.read();
            nodes.iter().filter(|n| n.present).count() == 1
        };
        if first_insert {
            self.entry_point.store(idx, Ordering::SeqCst);
            self.max_layer.store(new_level as u32, Ordering::SeqCst);
            return;
        }

        let vector = self.vectors.read()[idx as usize].clone();
        let mut curr_obj = entry_point;
        let mut curr_dist = self.dist_to(curr_obj, &vector);

        let start_layer = {
            let nodes = self.nodes.read();
            nodes[entry_point as usize].layers.len().saturating_sub(1)
        };
        let _ = max_layer;

        for level in (new_level + 1..=start_layer).rev() {
            let mut changed = true;
            while changed {
                changed = false;
                let nodes = self.nodes.read();
                if nodes[curr_obj as usize].layers.len() <= level {
                    break;
                }
                let neighbors = nodes[curr_obj as usize].layers[level].read().clone();
                drop(nodes);
                for n in neighbors {
                    let d = self.dist_to(n, &vector);
                    if d < curr_dist {
                        curr_dist = d;
                        curr_obj = n;
                        changed = true;
                    }
                }
            }
        }

        for level in (0..=new_level).rev() {
            let m_max = if level == 0 { self.m * 2 } else { self.m };
            let candidates_heap =
                self.search_layer_candidates(curr_obj, &vector, level, self.ef_construction);
            let selected = self.select_neighbors(candidates_heap, m_max);
            for &neighbor in &selected {
                self.add_link(idx, neighbor, level);
                self.add_link(neighbor, idx, level);
                let neighbor_len = self.nodes.read()[neighbor as usize].layers[level].read().len();
                if neighbor_len > m_max {
                    self.prune_connections(neighbor, level, m_max);
                }
            }
            if let Some(&first) = selected.first() {
                curr_obj = first;
            }
        }

        if new_level as u32 > max_layer {
            self.max_layer.store(new_level as u32, Ordering::SeqCst);
            self.entry_point.store(idx, Ordering::SeqCst);
        }
    }
}

impl Engine for HnswEngine {
    fn train(&self, _vectors: &[Vec<f32>]) -> Result<()> {
        Ok(())
    }

    fn is_trained(&self) -> bool {
        true
    }

    fn add_with_ids(&self, vectors: &[Vec<f32>], idxs: &[u64]) -> Result<()> {
        self.check_dims(vectors)?;
        for (v, &idx) in vectors.iter().zip(idxs) {
            let idx: NodeId = idx
                .try_into()
                .map_err(|_| Error::EngineFailure("internal id exceeds u32 range for HNSW".to_string()))?;
            self.insert_one(idx, v.clone());
        }
        Ok(())
    }

    fn search(&self, queries: &[Vec<f32>], k: usize) -> Result<Vec<SearchRow>> {
        self.check_dims(queries)?;
        let entry = self.entry_point.load(Ordering::Relaxed);
        let nodes_len = self.nodes.read().len();
        let mut rows = Vec::with_capacity(queries.len());
        for q in queries {
            if nodes_len == 0 {
                rows.push((Vec::new(), Vec::new()));
                continue;
            }
            let start_layer = self.nodes.read()[entry as usize].layers.len().saturating_sub(1);
            let mut curr = entry;
            let mut curr_dist = self.dist_to(curr, q);
            for level in (1..=start_layer).rev() {
                let mut changed = true;
                while changed {
                    changed = false;
                    let neighbors = self.nodes.read()[curr as usize].layers[level].read().clone();
                    for n in neighbors {
                        let d = self.dist_to(n, q);
                        if d < curr_dist {
                            curr_dist = d;
                            curr = n;
                            changed = true;
                        }
                    }
                }
            }
            let found = self.search_layer0(curr, q, k, self.ef_search.max(k));
            let ids = found.iter().map(|(id, _)| Some(*id as u64)).collect();
            let dists = found.iter().map(|(_, d)| *d).collect();
            rows.push((ids, dists));
        }
        Ok(rows)
    }

    fn supports_remove(&self) -> bool {
        false
    }

    fn remove(&self, idxs: &[u64]) -> Result<usize> {
        let mut deleted = self.deleted.write();
        let mut count = 0;
        for &idx in idxs {
            if let Ok(idx) = u32::try_from(idx) {
                if deleted.insert(idx) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let nodes = self.nodes.read();
        let snapshot_nodes: Vec<SnapshotNode> = nodes
            .iter()
            .map(|n| SnapshotNode {
                present: n.present,
                layers: n.layers.iter().map(|l| l.read().clone()).collect(),
            })
            .collect();
        let vectors = self.vectors.read().clone();
        let mut deleted_buf = Vec::new();
        self.deleted
            .read()
            .serialize_into(&mut deleted_buf)
            .map_err(|e| Error::EngineFailure(format!("failed to serialize tombstone bitmap: {e}")))?;

        let snapshot = SnapshotData {
            dim: self.dim as u32,
            m: self.m as u32,
            ef_construction: self.ef_construction as u32,
            ef_search: self.ef_search as u32,
            entry_point: self.entry_point.load(Ordering::Relaxed),
            max_layer: self.max_layer.load(Ordering::Relaxed),
            nodes: snapshot_nodes,
            vectors,
            deleted: deleted_buf,
        };
        let bytes = rkyv::to_bytes::<_, 1024>(&snapshot)
            .map_err(|e| Error::EngineFailure(format!("HNSW snapshot serialization failed: {e}")))?;
        Ok(bytes.into_vec())
    }

    fn len(&self) -> usize {
        self.nodes.read().iter().filter(|n| n.present).count() - self.deleted.read().len() as usize
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl HnswEngine {
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let archived = rkyv::check_archived_root::<SnapshotData>(bytes)
            .map_err(|e| Error::EngineFailure(format!("HNSW snapshot corrupt: {e}")))?;
        let data: SnapshotData = archived
            .deserialize(&mut rkyv::Infallible)
            .expect("infallible deserializer");

        let nodes = data
            .nodes
            .into_iter()
            .map(|n| Node {
                present: n.present,
                layers: n.layers.into_iter().map(RwLock::new).collect(),
            })
            .collect();
        let deleted = RoaringBitmap::deserialize_from(&data.deleted[..]).unwrap_or_default();

        Ok(Self {
            dim: data.dim as usize,
            m: data.m as usize,
            ef_construction: data.ef_construction as usize,
            ef_search: data.ef_search as usize,
            seed: 0,
            nodes: RwLock::new(nodes),
            vectors: RwLock::new(data.vectors),
            deleted: RwLock::new(deleted),
            entry_point: AtomicU32::new(data.entry_point),
            max_layer: AtomicU32::new(data.max_layer),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_is_nearest_neighbor_on_a_line() {
        let engine = HnswEngine::new(2, 16, Some(42));
        let n = 100;
        let vectors: Vec<Vec<f32>> = (0..n).map(|j| vec![j as f32, (2 * j) as f32]).collect();
        let idxs: Vec<u64> = (0..n as u64).collect();
        engine.add_with_ids(&vectors, &idxs).unwrap();

        for j in [0usize, 50, 99] {
            let rows = engine.search(&[vectors[j].clone()], 1).unwrap();
            assert_eq!(rows[0].0[0], Some(j as u64));
        }
    }

    #[test]
    fn soft_delete_removes_node_from_results() {
        let engine = HnswEngine::new(1, 8, Some(1));
        engine
            .add_with_ids(&[vec![0.0], vec![1.0], vec![2.0]], &[0, 1, 2])
            .unwrap();
        assert!(!engine.supports_remove());
        engine.remove(&[1]).unwrap();
        let rows = engine.search(&[vec![1.0]], 3).unwrap();
        assert!(!rows[0].0.contains(&Some(1)));
    }
}
