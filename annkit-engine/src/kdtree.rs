//! Randomized kd-forest.
//!
//! Each tree splits on a dimension drawn at random among the highest-variance
//! ones, at the mean of a small sample. Leaves hold a single point. Queries
//! descend every tree and then keep expanding the closest unexplored branches
//! across the whole forest until the check budget is spent.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ordered_float::OrderedFloat;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::result_set::KnnResultSet;
use crate::store::{squared_l2, PointStore};

/// Points used to estimate the split mean and variance.
const SAMPLE_MEAN: usize = 100;
/// Split dimension is drawn among this many top-variance dimensions.
const RAND_DIM: usize = 5;

const TAG_LEAF: u8 = 0;
const TAG_SPLIT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
enum KdNode {
    Leaf {
        point: u32,
    },
    Split {
        dim: u32,
        value: f32,
        left: u32,
        right: u32,
    },
}

#[derive(Debug, Clone, Default)]
struct KdTree {
    nodes: Vec<KdNode>,
    root: Option<u32>,
}

/// Branch waiting in the forest-wide priority queue.
type Pending = Reverse<(OrderedFloat<f32>, usize, u32)>;

struct Traversal<'a> {
    store: &'a PointStore,
    query: &'a [f32],
    result: &'a mut KnnResultSet,
    checked: Vec<bool>,
    checks: usize,
    max_checks: usize,
    pending: BinaryHeap<Pending>,
}

impl KdTree {
    fn build(store: &PointStore, ids: &mut [u32], rng: &mut ChaCha8Rng) -> Self {
        let mut tree = KdTree::default();
        if !ids.is_empty() {
            tree.root = Some(tree.divide(store, ids, rng));
        }
        tree
    }

    fn push(&mut self, node: KdNode) -> u32 {
        self.nodes.push(node);
        (self.nodes.len() - 1) as u32
    }

    fn divide(&mut self, store: &PointStore, ids: &mut [u32], rng: &mut ChaCha8Rng) -> u32 {
        if ids.len() == 1 {
            return self.push(KdNode::Leaf { point: ids[0] });
        }
        let dim = select_dimension(store, ids, rng);
        let (split, value) = plane_split(store, ids, dim);
        let (lower, upper) = ids.split_at_mut(split);
        let left = self.divide(store, lower, rng);
        let right = self.divide(store, upper, rng);
        self.push(KdNode::Split {
            dim: dim as u32,
            value,
            left,
            right,
        })
    }

    /// Routes the point to its leaf and splits that leaf in two.
    fn insert(&mut self, store: &PointStore, id: u32) {
        let Some(mut node) = self.root else {
            self.root = Some(self.push(KdNode::Leaf { point: id }));
            return;
        };
        let q = store.row(id as usize);
        loop {
            match self.nodes[node as usize] {
                KdNode::Split {
                    dim,
                    value,
                    left,
                    right,
                } => {
                    node = if q[dim as usize] < value { left } else { right };
                }
                KdNode::Leaf { point } => {
                    let p = store.row(point as usize);
                    let mut dim = 0;
                    let mut span = -1.0f32;
                    for (d, (a, b)) in q.iter().zip(p.iter()).enumerate() {
                        let s = (a - b).abs();
                        if s > span {
                            span = s;
                            dim = d;
                        }
                    }
                    let (value, low, high) = if p[dim] < q[dim] {
                        ((p[dim] + q[dim]) / 2.0, point, id)
                    } else if q[dim] < p[dim] {
                        ((p[dim] + q[dim]) / 2.0, id, point)
                    } else {
                        (q[dim], point, id)
                    };
                    let left = self.push(KdNode::Leaf { point: low });
                    let right = self.push(KdNode::Leaf { point: high });
                    self.nodes[node as usize] = KdNode::Split {
                        dim: dim as u32,
                        value,
                        left,
                        right,
                    };
                    return;
                }
            }
        }
    }

    fn search_level(&self, tree: usize, node: u32, mindist: f32, t: &mut Traversal<'_>) {
        if t.result.worst_dist() < mindist {
            return;
        }
        match self.nodes[node as usize] {
            KdNode::Leaf { point } => {
                let id = point as usize;
                if t.checked[id] {
                    return;
                }
                if t.checks >= t.max_checks && t.result.is_full() {
                    return;
                }
                t.checked[id] = true;
                if t.store.is_removed(id) {
                    return;
                }
                t.checks += 1;
                t.result.add_point(squared_l2(t.query, t.store.row(id)), id);
            }
            KdNode::Split {
                dim,
                value,
                left,
                right,
            } => {
                let diff = t.query[dim as usize] - value;
                let (best, other) = if diff < 0.0 { (left, right) } else { (right, left) };
                let other_dist = mindist + diff * diff;
                if other_dist < t.result.worst_dist() || !t.result.is_full() {
                    t.pending
                        .push(Reverse((OrderedFloat(other_dist), tree, other)));
                }
                self.search_level(tree, best, mindist, t);
            }
        }
    }

    /// Exact descent with per-dimension lower bounds.
    fn search_exact(
        &self,
        store: &PointStore,
        query: &[f32],
        node: u32,
        mindist: f32,
        offsets: &mut [f32],
        result: &mut KnnResultSet,
    ) {
        match self.nodes[node as usize] {
            KdNode::Leaf { point } => {
                let id = point as usize;
                if !store.is_removed(id) {
                    result.add_point(squared_l2(query, store.row(id)), id);
                }
            }
            KdNode::Split {
                dim,
                value,
                left,
                right,
            } => {
                let d = dim as usize;
                let diff = query[d] - value;
                let (best, other) = if diff < 0.0 { (left, right) } else { (right, left) };
                self.search_exact(store, query, best, mindist, offsets, result);

                let old = offsets[d];
                let other_dist = mindist - old * old + diff * diff;
                if other_dist <= result.worst_dist() {
                    offsets[d] = diff;
                    self.search_exact(store, query, other, other_dist, offsets, result);
                    offsets[d] = old;
                }
            }
        }
    }

    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        match self.root {
            Some(root) => {
                w.write_u8(1)?;
                w.write_u32::<LittleEndian>(root)?;
            }
            None => {
                w.write_u8(0)?;
                w.write_u32::<LittleEndian>(0)?;
            }
        }
        w.write_u64::<LittleEndian>(self.nodes.len() as u64)?;
        for node in &self.nodes {
            match *node {
                KdNode::Leaf { point } => {
                    w.write_u8(TAG_LEAF)?;
                    w.write_u32::<LittleEndian>(point)?;
                }
                KdNode::Split {
                    dim,
                    value,
                    left,
                    right,
                } => {
                    w.write_u8(TAG_SPLIT)?;
                    w.write_u32::<LittleEndian>(dim)?;
                    w.write_f32::<LittleEndian>(value)?;
                    w.write_u32::<LittleEndian>(left)?;
                    w.write_u32::<LittleEndian>(right)?;
                }
            }
        }
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R, num_points: usize, dim: usize) -> Result<Self> {
        let has_root = r.read_u8()? == 1;
        let root = r.read_u32::<LittleEndian>()?;
        let count = r.read_u64::<LittleEndian>()? as usize;
        let mut nodes = Vec::with_capacity(count.min(num_points * 2 + 1));
        for _ in 0..count {
            let node = match r.read_u8()? {
                TAG_LEAF => {
                    let point = r.read_u32::<LittleEndian>()?;
                    if point as usize >= num_points {
                        return Err(Error::CorruptedIndex(format!(
                            "kd leaf references point {} of {}",
                            point, num_points
                        )));
                    }
                    KdNode::Leaf { point }
                }
                TAG_SPLIT => {
                    let split_dim = r.read_u32::<LittleEndian>()?;
                    let value = r.read_f32::<LittleEndian>()?;
                    let left = r.read_u32::<LittleEndian>()?;
                    let right = r.read_u32::<LittleEndian>()?;
                    if split_dim as usize >= dim || left as usize >= count || right as usize >= count
                    {
                        return Err(Error::CorruptedIndex("kd split out of range".into()));
                    }
                    KdNode::Split {
                        dim: split_dim,
                        value,
                        left,
                        right,
                    }
                }
                tag => {
                    return Err(Error::CorruptedIndex(format!("unknown kd node tag {}", tag)));
                }
            };
            nodes.push(node);
        }
        if has_root && root as usize >= count {
            return Err(Error::CorruptedIndex("kd root out of range".into()));
        }
        Ok(Self {
            nodes,
            root: has_root.then_some(root),
        })
    }
}

/// Picks one of the highest-variance dimensions of a sample of `ids`.
fn select_dimension(store: &PointStore, ids: &[u32], rng: &mut ChaCha8Rng) -> usize {
    let dim = store.dim();
    let cnt = ids.len().min(SAMPLE_MEAN + 1);
    let mut mean = vec![0.0f64; dim];
    for &id in &ids[..cnt] {
        for (m, &v) in mean.iter_mut().zip(store.row(id as usize)) {
            *m += v as f64;
        }
    }
    mean.iter_mut().for_each(|m| *m /= cnt as f64);

    let mut var = vec![0.0f64; dim];
    for &id in &ids[..cnt] {
        for ((s, &m), &v) in var.iter_mut().zip(&mean).zip(store.row(id as usize)) {
            let d = v as f64 - m;
            *s += d * d;
        }
    }

    let mut order: Vec<usize> = (0..dim).collect();
    order.sort_by(|&a, &b| var[b].total_cmp(&var[a]));
    let top = RAND_DIM.min(dim);
    order[rng.gen_range(0..top)]
}

/// Partitions `ids` around the mean of `dim` and returns the left size and
/// the split value. Left points satisfy `v <= value`, right ones `v >= value`.
fn plane_split(store: &PointStore, ids: &mut [u32], dim: usize) -> (usize, f32) {
    let n = ids.len();
    let coord = |id: u32| store.row(id as usize)[dim];
    let cnt = n.min(SAMPLE_MEAN + 1);
    let value = (ids[..cnt].iter().map(|&id| coord(id) as f64).sum::<f64>() / cnt as f64) as f32;

    let mut left = 0;
    for i in 0..n {
        if coord(ids[i]) < value {
            ids.swap(i, left);
            left += 1;
        }
    }
    let lim1 = left;
    for i in lim1..n {
        if coord(ids[i]) == value {
            ids.swap(i, left);
            left += 1;
        }
    }
    let lim2 = left;

    let half = n / 2;
    if lim1 == n || lim2 == 0 {
        ids.select_nth_unstable_by(half, |&a, &b| coord(a).total_cmp(&coord(b)));
        return (half, coord(ids[half]));
    }
    let index = if lim1 > half {
        lim1
    } else if lim2 < half {
        lim2
    } else {
        half
    };
    (index, value)
}

/// Set of randomized kd-trees sharing one point store.
#[derive(Debug, Clone, Default)]
pub(crate) struct KdForest {
    trees: Vec<KdTree>,
}

impl KdForest {
    pub fn build(store: &PointStore, num_trees: usize, rng: &mut ChaCha8Rng) -> Self {
        let live = store.live_ids();
        let seeds: Vec<u64> = (0..num_trees.max(1)).map(|_| rng.gen()).collect();
        let trees = seeds
            .into_par_iter()
            .map(|seed| {
                let mut tree_rng = ChaCha8Rng::seed_from_u64(seed);
                let mut ids = live.clone();
                ids.shuffle(&mut tree_rng);
                KdTree::build(store, &mut ids, &mut tree_rng)
            })
            .collect();
        Self { trees }
    }

    pub fn insert(&mut self, store: &PointStore, id: u32) {
        for tree in &mut self.trees {
            tree.insert(store, id);
        }
    }

    /// `max_checks < 0` runs an exact search on the first tree.
    pub fn search(
        &self,
        store: &PointStore,
        query: &[f32],
        result: &mut KnnResultSet,
        max_checks: i32,
    ) {
        if max_checks < 0 {
            if let Some(first) = self.trees.first() {
                if let Some(root) = first.root {
                    let mut offsets = vec![0.0f32; store.dim()];
                    first.search_exact(store, query, root, 0.0, &mut offsets, result);
                }
            }
            return;
        }

        let mut t = Traversal {
            store,
            query,
            result,
            checked: vec![false; store.len()],
            checks: 0,
            max_checks: max_checks as usize,
            pending: BinaryHeap::new(),
        };
        for (i, tree) in self.trees.iter().enumerate() {
            if let Some(root) = tree.root {
                tree.search_level(i, root, 0.0, &mut t);
            }
        }
        while let Some(Reverse((dist, tree, node))) = t.pending.pop() {
            if t.checks >= t.max_checks && t.result.is_full() {
                break;
            }
            self.trees[tree].search_level(tree, node, dist.0, &mut t);
        }
    }

    pub fn used_memory(&self) -> usize {
        self.trees
            .iter()
            .map(|t| t.nodes.capacity() * std::mem::size_of::<KdNode>())
            .sum::<usize>()
            + self.trees.capacity() * std::mem::size_of::<KdTree>()
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<LittleEndian>(self.trees.len() as u32)?;
        for tree in &self.trees {
            tree.write_to(w)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R, num_points: usize, dim: usize) -> Result<Self> {
        let count = r.read_u32::<LittleEndian>()? as usize;
        let trees = (0..count)
            .map(|_| KdTree::read_from(r, num_points, dim))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { trees })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear;
    use ndarray::Array2;

    fn grid_store() -> PointStore {
        let mut pts = Array2::<f32>::zeros((100, 2));
        for i in 0..100 {
            pts[[i, 0]] = (i % 10) as f32;
            pts[[i, 1]] = (i / 10) as f32;
        }
        PointStore::from_view(pts.view())
    }

    #[test]
    fn test_exact_matches_linear() {
        let store = grid_store();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let forest = KdForest::build(&store, 2, &mut rng);

        for q in [[0.2f32, 0.1], [4.6, 5.4], [9.9, 9.9], [-3.0, 12.0]] {
            let mut exact = KnnResultSet::new(5);
            forest.search(&store, &q, &mut exact, -1);
            let mut brute = KnnResultSet::new(5);
            linear::search(&store, &q, &mut brute);
            let a: Vec<f32> = exact.into_sorted().iter().map(|r| r.0).collect();
            let b: Vec<f32> = brute.into_sorted().iter().map(|r| r.0).collect();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_self_query_finds_itself() {
        let store = grid_store();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let forest = KdForest::build(&store, 4, &mut rng);
        for id in 0..store.len() {
            let mut result = KnnResultSet::new(1);
            forest.search(&store, store.row(id), &mut result, 32);
            assert_eq!(result.into_sorted()[0], (0.0, id));
        }
    }

    #[test]
    fn test_insert_reaches_new_point() {
        let mut pts = Array2::<f32>::zeros((2, 2));
        pts[[1, 0]] = 1.0;
        let mut store = PointStore::from_view(pts.view());
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut forest = KdForest::build(&store, 1, &mut rng);

        let extra = ndarray::array![[5.0f32, 5.0], [5.0, 5.0]];
        let range = store.append(extra.view()).unwrap();
        for id in range {
            forest.insert(&store, id as u32);
        }
        let mut result = KnnResultSet::new(2);
        forest.search(&store, &[5.0, 5.0], &mut result, -1);
        let ids: Vec<usize> = result.into_sorted().iter().map(|r| r.1).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_identical_points_terminate() {
        let pts = Array2::<f32>::ones((33, 3));
        let store = PointStore::from_view(pts.view());
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let forest = KdForest::build(&store, 1, &mut rng);
        let mut result = KnnResultSet::new(33);
        forest.search(&store, &[1.0, 1.0, 1.0], &mut result, -1);
        assert_eq!(result.into_sorted().len(), 33);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let store = grid_store();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let forest = KdForest::build(&store, 3, &mut rng);
        let mut buf = Vec::new();
        forest.write_to(&mut buf).unwrap();
        let restored = KdForest::read_from(&mut buf.as_slice(), store.len(), store.dim()).unwrap();
        assert_eq!(restored.trees.len(), 3);
        for (a, b) in forest.trees.iter().zip(&restored.trees) {
            assert_eq!(a.nodes, b.nodes);
            assert_eq!(a.root, b.root);
        }
    }
}
