//! Hierarchical k-means tree.
//!
//! Every internal node splits its points into `branching` clusters with a
//! few Lloyd iterations. Nodes keep their pivot (cluster mean), radius and
//! variance; search uses them to prune balls and to rank unexplored
//! branches. The same tree provides cluster centers by cutting it where the
//! total variance is smallest.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ordered_float::OrderedFloat;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::params::{BuildParams, CentersInit};
use crate::result_set::KnnResultSet;
use crate::store::{squared_l2, PointStore};

/// Iteration ceiling when iterations are negative ("until convergence").
const CONVERGENCE_CAP: usize = 1000;

/// Squared distance under which two candidate centers count as the same point.
const DUPLICATE_EPS: f64 = 1e-16;

#[derive(Debug, Clone, PartialEq)]
struct KMeansNode {
    pivot: Vec<f32>,
    /// Largest squared distance from the pivot to a member.
    radius: f32,
    /// Mean squared distance from the pivot to the members.
    variance: f32,
    size: usize,
    children: Vec<u32>,
    points: Vec<u32>,
}

impl KMeansNode {
    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct KMeansTree {
    nodes: Vec<KMeansNode>,
    root: Option<u32>,
    branching: usize,
    iterations: i32,
    centers_init: CentersInit,
    cb_index: f32,
}

struct Exploration<'a> {
    store: &'a PointStore,
    query: &'a [f32],
    result: &'a mut KnnResultSet,
    checks: usize,
    max_checks: usize,
    pending: BinaryHeap<Reverse<(OrderedFloat<f32>, u32)>>,
}

impl KMeansTree {
    fn empty(params: &BuildParams) -> Result<Self> {
        if params.branching < 2 {
            return Err(Error::InvalidParameter(format!(
                "branching must be at least 2, got {}",
                params.branching
            )));
        }
        Ok(Self {
            nodes: Vec::new(),
            root: None,
            branching: params.branching,
            iterations: params.iterations,
            centers_init: params.centers_init,
            cb_index: params.cb_index,
        })
    }

    pub fn build(store: &PointStore, params: &BuildParams, rng: &mut ChaCha8Rng) -> Result<Self> {
        let mut tree = Self::empty(params)?;
        let mut ids = store.live_ids();
        if ids.is_empty() {
            return Ok(tree);
        }
        let (pivot, radius, variance) = node_statistics(store, &ids);
        let root = tree.push(KMeansNode {
            pivot,
            radius,
            variance,
            size: ids.len(),
            children: Vec::new(),
            points: Vec::new(),
        });
        tree.root = Some(root);
        tree.compute_clustering(store, root, &mut ids, rng);
        Ok(tree)
    }

    fn push(&mut self, node: KMeansNode) -> u32 {
        self.nodes.push(node);
        (self.nodes.len() - 1) as u32
    }

    fn make_leaf(&mut self, node: u32, ids: &[u32]) {
        let n = &mut self.nodes[node as usize];
        n.children.clear();
        n.points = ids.to_vec();
        n.points.sort_unstable();
    }

    fn compute_clustering(
        &mut self,
        store: &PointStore,
        node: u32,
        ids: &mut [u32],
        rng: &mut ChaCha8Rng,
    ) {
        let n = ids.len();
        let branching = self.branching;
        self.nodes[node as usize].size = n;

        if n < branching {
            self.make_leaf(node, ids);
            return;
        }
        let seeds = choose_centers(self.centers_init, store, ids, branching, rng);
        if seeds.len() < branching {
            self.make_leaf(node, ids);
            return;
        }

        let mut centers: Vec<Vec<f64>> = seeds
            .iter()
            .map(|&id| store.row(id as usize).iter().map(|&v| v as f64).collect())
            .collect();
        let mut belongs_to = vec![0usize; n];
        let mut counts = vec![0usize; branching];
        for (i, &id) in ids.iter().enumerate() {
            let c = nearest_center(store.row(id as usize), &centers);
            belongs_to[i] = c;
            counts[c] += 1;
        }
        fill_empty_clusters(&mut belongs_to, &mut counts);

        let max_iter = if self.iterations < 0 {
            CONVERGENCE_CAP
        } else {
            self.iterations as usize
        };
        let mut converged = false;
        let mut iteration = 0;
        while !converged && iteration < max_iter {
            converged = true;
            iteration += 1;

            for center in centers.iter_mut() {
                center.iter_mut().for_each(|v| *v = 0.0);
            }
            for (i, &id) in ids.iter().enumerate() {
                let center = &mut centers[belongs_to[i]];
                for (c, &v) in center.iter_mut().zip(store.row(id as usize)) {
                    *c += v as f64;
                }
            }
            for (center, &count) in centers.iter_mut().zip(&counts) {
                let inv = 1.0 / count as f64;
                center.iter_mut().for_each(|v| *v *= inv);
            }

            for (i, &id) in ids.iter().enumerate() {
                let c = nearest_center(store.row(id as usize), &centers);
                if c != belongs_to[i] {
                    counts[belongs_to[i]] -= 1;
                    counts[c] += 1;
                    belongs_to[i] = c;
                    converged = false;
                }
            }
            if fill_empty_clusters(&mut belongs_to, &mut counts) {
                converged = false;
            }
        }

        // Stable regroup so each cluster occupies a contiguous range.
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&i| belongs_to[i]);
        let regrouped: Vec<u32> = order.iter().map(|&i| ids[i]).collect();
        ids.copy_from_slice(&regrouped);

        let mut children = Vec::with_capacity(branching);
        let mut ranges = Vec::with_capacity(branching);
        let mut start = 0;
        for (c, &count) in counts.iter().enumerate() {
            let end = start + count;
            let pivot: Vec<f32> = centers[c].iter().map(|&v| v as f32).collect();
            let mut radius = 0.0f32;
            let mut variance = 0.0f64;
            for &id in &ids[start..end] {
                let d = squared_l2(store.row(id as usize), &pivot);
                radius = radius.max(d);
                variance += d as f64;
            }
            let child = self.push(KMeansNode {
                pivot,
                radius,
                variance: (variance / count as f64) as f32,
                size: count,
                children: Vec::new(),
                points: Vec::new(),
            });
            children.push(child);
            ranges.push(start..end);
            start = end;
        }
        {
            let parent = &mut self.nodes[node as usize];
            parent.children = children.clone();
            parent.points.clear();
        }
        for (child, range) in children.into_iter().zip(ranges) {
            self.compute_clustering(store, child, &mut ids[range], rng);
        }
    }

    /// Routes a new point to the closest leaf, reclustering it once full.
    pub fn insert(&mut self, store: &PointStore, id: u32, rng: &mut ChaCha8Rng) {
        let q = store.row(id as usize);
        let Some(mut node) = self.root else {
            let root = self.push(KMeansNode {
                pivot: q.to_vec(),
                radius: 0.0,
                variance: 0.0,
                size: 1,
                children: Vec::new(),
                points: vec![id],
            });
            self.root = Some(root);
            return;
        };
        loop {
            let n = &mut self.nodes[node as usize];
            let dist = squared_l2(q, &n.pivot);
            n.radius = n.radius.max(dist);
            n.variance = (n.variance * n.size as f32 + dist) / (n.size + 1) as f32;
            n.size += 1;
            if n.is_leaf() {
                n.points.push(id);
                if n.points.len() >= self.branching {
                    let mut ids = n.points.clone();
                    self.compute_clustering(store, node, &mut ids, rng);
                }
                return;
            }
            let children = n.children.clone();
            let mut best = children[0];
            let mut best_dist = f32::INFINITY;
            for &child in &children {
                let d = squared_l2(q, &self.nodes[child as usize].pivot);
                if d < best_dist {
                    best_dist = d;
                    best = child;
                }
            }
            node = best;
        }
    }

    /// Whether the query ball cannot intersect the node ball.
    fn prunable(node: &KMeansNode, query: &[f32], worst: f32) -> bool {
        let bsq = squared_l2(query, &node.pivot);
        let rsq = node.radius;
        let val = bsq - rsq - worst;
        let val2 = val * val - 4.0 * rsq * worst;
        val > 0.0 && val2 > 0.0
    }

    fn find_nn(&self, node: u32, e: &mut Exploration<'_>) {
        let n = &self.nodes[node as usize];
        if Self::prunable(n, e.query, e.result.worst_dist()) {
            return;
        }
        if n.is_leaf() {
            if e.checks >= e.max_checks && e.result.is_full() {
                return;
            }
            for &p in &n.points {
                let id = p as usize;
                if e.store.is_removed(id) {
                    continue;
                }
                e.result.add_point(squared_l2(e.query, e.store.row(id)), id);
                e.checks += 1;
            }
            return;
        }
        let dists: Vec<f32> = n
            .children
            .iter()
            .map(|&c| squared_l2(e.query, &self.nodes[c as usize].pivot))
            .collect();
        let best = dists
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        for (i, &child) in n.children.iter().enumerate() {
            if i != best {
                let priority = dists[i] - self.cb_index * self.nodes[child as usize].variance;
                e.pending.push(Reverse((OrderedFloat(priority), child)));
            }
        }
        self.find_nn(n.children[best], e);
    }

    fn find_exact(&self, store: &PointStore, query: &[f32], node: u32, result: &mut KnnResultSet) {
        let n = &self.nodes[node as usize];
        if Self::prunable(n, query, result.worst_dist()) {
            return;
        }
        if n.is_leaf() {
            for &p in &n.points {
                let id = p as usize;
                if !store.is_removed(id) {
                    result.add_point(squared_l2(query, store.row(id)), id);
                }
            }
            return;
        }
        let mut order: Vec<(f32, u32)> = n
            .children
            .iter()
            .map(|&c| (squared_l2(query, &self.nodes[c as usize].pivot), c))
            .collect();
        order.sort_by(|a, b| a.0.total_cmp(&b.0));
        for (_, child) in order {
            self.find_exact(store, query, child, result);
        }
    }

    /// `max_checks < 0` explores every non-prunable node.
    pub fn search(
        &self,
        store: &PointStore,
        query: &[f32],
        result: &mut KnnResultSet,
        max_checks: i32,
    ) {
        let Some(root) = self.root else {
            return;
        };
        if max_checks < 0 {
            self.find_exact(store, query, root, result);
            return;
        }
        let mut e = Exploration {
            store,
            query,
            result,
            checks: 0,
            max_checks: max_checks as usize,
            pending: BinaryHeap::new(),
        };
        self.find_nn(root, &mut e);
        while let Some(Reverse((_, node))) = e.pending.pop() {
            if e.checks >= e.max_checks && e.result.is_full() {
                break;
            }
            self.find_nn(node, &mut e);
        }
    }

    /// Pivots of the lowest-variance cut with at most `num_clusters` nodes.
    ///
    /// Starting from the root, the cluster whose split lowers the summed
    /// variance the most is replaced by its children, as long as the cut
    /// stays within `num_clusters`. With enough points this yields
    /// `(branching - 1) * m + 1` clusters for the largest fitting `m`.
    pub fn cluster_centers(&self, num_clusters: usize) -> Vec<Vec<f32>> {
        let Some(root) = self.root else {
            return Vec::new();
        };
        let weighted = |id: u32| {
            let n = &self.nodes[id as usize];
            n.variance as f64 * n.size as f64
        };
        let mut clusters = vec![root];
        let mut total_variance = weighted(root);

        while clusters.len() < num_clusters {
            let mut min_variance = f64::MAX;
            let mut split_index = None;
            for (i, &c) in clusters.iter().enumerate() {
                let node = &self.nodes[c as usize];
                if node.is_leaf() {
                    continue;
                }
                let variance = total_variance - weighted(c)
                    + node.children.iter().map(|&ch| weighted(ch)).sum::<f64>();
                if variance < min_variance {
                    min_variance = variance;
                    split_index = Some(i);
                }
            }
            let Some(index) = split_index else {
                break;
            };
            if self.branching + clusters.len() - 1 > num_clusters {
                break;
            }
            total_variance = min_variance;
            let children = self.nodes[clusters[index] as usize].children.clone();
            clusters[index] = children[0];
            clusters.extend_from_slice(&children[1..]);
        }

        clusters
            .into_iter()
            .map(|c| self.nodes[c as usize].pivot.clone())
            .collect()
    }

    pub fn used_memory(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| {
                std::mem::size_of::<KMeansNode>()
                    + n.pivot.capacity() * std::mem::size_of::<f32>()
                    + n.children.capacity() * std::mem::size_of::<u32>()
                    + n.points.capacity() * std::mem::size_of::<u32>()
            })
            .sum()
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u8(self.root.is_some() as u8)?;
        w.write_u32::<LittleEndian>(self.root.unwrap_or(0))?;
        w.write_u64::<LittleEndian>(self.nodes.len() as u64)?;
        for node in &self.nodes {
            for &v in &node.pivot {
                w.write_f32::<LittleEndian>(v)?;
            }
            w.write_f32::<LittleEndian>(node.radius)?;
            w.write_f32::<LittleEndian>(node.variance)?;
            w.write_u64::<LittleEndian>(node.size as u64)?;
            w.write_u32::<LittleEndian>(node.children.len() as u32)?;
            for &c in &node.children {
                w.write_u32::<LittleEndian>(c)?;
            }
            w.write_u32::<LittleEndian>(node.points.len() as u32)?;
            for &p in &node.points {
                w.write_u32::<LittleEndian>(p)?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(
        r: &mut R,
        params: &BuildParams,
        num_points: usize,
        dim: usize,
    ) -> Result<Self> {
        let mut tree = Self::empty(params)?;
        let has_root = r.read_u8()? == 1;
        let root = r.read_u32::<LittleEndian>()?;
        let count = r.read_u64::<LittleEndian>()? as usize;
        for _ in 0..count {
            let mut pivot = vec![0.0f32; dim];
            r.read_f32_into::<LittleEndian>(&mut pivot)?;
            let radius = r.read_f32::<LittleEndian>()?;
            let variance = r.read_f32::<LittleEndian>()?;
            let size = r.read_u64::<LittleEndian>()? as usize;
            let num_children = r.read_u32::<LittleEndian>()? as usize;
            let mut children = vec![0u32; num_children];
            r.read_u32_into::<LittleEndian>(&mut children)?;
            let num_leaf_points = r.read_u32::<LittleEndian>()? as usize;
            let mut points = vec![0u32; num_leaf_points];
            r.read_u32_into::<LittleEndian>(&mut points)?;

            if children.iter().any(|&c| c as usize >= count) {
                return Err(Error::CorruptedIndex("k-means child out of range".into()));
            }
            if points.iter().any(|&p| p as usize >= num_points) {
                return Err(Error::CorruptedIndex(
                    "k-means leaf references a missing point".into(),
                ));
            }
            tree.nodes.push(KMeansNode {
                pivot,
                radius,
                variance,
                size,
                children,
                points,
            });
        }
        if has_root {
            if root as usize >= count {
                return Err(Error::CorruptedIndex("k-means root out of range".into()));
            }
            tree.root = Some(root);
        }
        Ok(tree)
    }
}

/// Mean, largest squared distance and mean squared distance of `ids`.
fn node_statistics(store: &PointStore, ids: &[u32]) -> (Vec<f32>, f32, f32) {
    let mut mean = vec![0.0f64; store.dim()];
    for &id in ids {
        for (m, &v) in mean.iter_mut().zip(store.row(id as usize)) {
            *m += v as f64;
        }
    }
    let inv = 1.0 / ids.len() as f64;
    let pivot: Vec<f32> = mean.iter().map(|&m| (m * inv) as f32).collect();

    let mut radius = 0.0f32;
    let mut variance = 0.0f64;
    for &id in ids {
        let d = squared_l2(store.row(id as usize), &pivot);
        radius = radius.max(d);
        variance += d as f64;
    }
    (pivot, radius, (variance * inv) as f32)
}

fn squared_l2_f64(point: &[f32], center: &[f64]) -> f64 {
    point
        .iter()
        .zip(center)
        .map(|(&p, &c)| {
            let d = p as f64 - c;
            d * d
        })
        .sum()
}

/// Index of the closest center, first one on ties.
fn nearest_center(point: &[f32], centers: &[Vec<f64>]) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (c, center) in centers.iter().enumerate() {
        let d = squared_l2_f64(point, center);
        if d < best_dist {
            best_dist = d;
            best = c;
        }
    }
    best
}

/// Gives every empty cluster one point taken from the next cluster that has
/// more than one. Returns whether anything moved.
fn fill_empty_clusters(belongs_to: &mut [usize], counts: &mut [usize]) -> bool {
    let k = counts.len();
    let mut moved = false;
    for c in 0..k {
        if counts[c] != 0 {
            continue;
        }
        let mut j = (c + 1) % k;
        while counts[j] <= 1 {
            j = (j + 1) % k;
        }
        if let Some(slot) = belongs_to.iter_mut().find(|b| **b == j) {
            *slot = c;
            counts[j] -= 1;
            counts[c] += 1;
            moved = true;
        }
    }
    moved
}

fn choose_centers(
    method: CentersInit,
    store: &PointStore,
    ids: &[u32],
    k: usize,
    rng: &mut ChaCha8Rng,
) -> Vec<u32> {
    match method {
        CentersInit::Random => centers_random(store, ids, k, rng),
        CentersInit::Gonzales => centers_gonzales(store, ids, k, rng),
        CentersInit::KMeansPP => centers_kmeanspp(store, ids, k, rng),
    }
}

/// Distinct random points.
fn centers_random(store: &PointStore, ids: &[u32], k: usize, rng: &mut ChaCha8Rng) -> Vec<u32> {
    let mut candidates = ids.to_vec();
    candidates.shuffle(rng);
    let mut centers: Vec<u32> = Vec::with_capacity(k);
    for id in candidates {
        if centers.len() == k {
            break;
        }
        let row = store.row(id as usize);
        let duplicate = centers
            .iter()
            .any(|&c| (squared_l2(row, store.row(c as usize)) as f64) < DUPLICATE_EPS);
        if !duplicate {
            centers.push(id);
        }
    }
    centers
}

/// Farthest-first traversal from a random start.
fn centers_gonzales(store: &PointStore, ids: &[u32], k: usize, rng: &mut ChaCha8Rng) -> Vec<u32> {
    let first = ids[rng.gen_range(0..ids.len())];
    let mut centers = vec![first];
    let mut closest: Vec<f32> = ids
        .iter()
        .map(|&id| squared_l2(store.row(id as usize), store.row(first as usize)))
        .collect();
    while centers.len() < k {
        let (best, best_dist) = closest
            .iter()
            .enumerate()
            .fold((0, -1.0f32), |acc, (i, &d)| if d > acc.1 { (i, d) } else { acc });
        if (best_dist as f64) < DUPLICATE_EPS {
            break;
        }
        let chosen = ids[best];
        centers.push(chosen);
        for (slot, &id) in closest.iter_mut().zip(ids) {
            let d = squared_l2(store.row(id as usize), store.row(chosen as usize));
            *slot = slot.min(d);
        }
    }
    centers
}

/// k-means++ seeding: each new center drawn proportionally to the squared
/// distance from the closest existing one.
fn centers_kmeanspp(store: &PointStore, ids: &[u32], k: usize, rng: &mut ChaCha8Rng) -> Vec<u32> {
    let first = ids[rng.gen_range(0..ids.len())];
    let mut centers = vec![first];
    let mut closest: Vec<f64> = ids
        .iter()
        .map(|&id| squared_l2(store.row(id as usize), store.row(first as usize)) as f64)
        .collect();
    while centers.len() < k {
        let potential: f64 = closest.iter().sum();
        if potential <= DUPLICATE_EPS {
            break;
        }
        let mut target = rng.gen::<f64>() * potential;
        let mut index = ids.len() - 1;
        for (i, &d) in closest.iter().enumerate() {
            if target <= d {
                index = i;
                break;
            }
            target -= d;
        }
        let chosen = ids[index];
        centers.push(chosen);
        for (slot, &id) in closest.iter_mut().zip(ids) {
            let d = squared_l2(store.row(id as usize), store.row(chosen as usize)) as f64;
            *slot = slot.min(d);
        }
    }
    centers
}
