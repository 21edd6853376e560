//! Bounded k-best collector used by every search path.

use ordered_float::OrderedFloat;
use std::collections::BinaryHeap;

/// Keeps the `k` smallest distances seen so far.
pub(crate) struct KnnResultSet {
    k: usize,
    // Set when several structures may report the same point.
    dedup: bool,
    // Max-heap: the worst retained candidate sits on top.
    heap: BinaryHeap<(OrderedFloat<f32>, usize)>,
}

impl KnnResultSet {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            dedup: false,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    pub fn deduplicating(k: usize) -> Self {
        Self {
            dedup: true,
            ..Self::new(k)
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }

    /// Distance a candidate must beat to enter the set.
    #[inline]
    pub fn worst_dist(&self) -> f32 {
        if self.is_full() {
            self.heap.peek().map(|(d, _)| d.0).unwrap_or(f32::INFINITY)
        } else {
            f32::INFINITY
        }
    }

    #[inline]
    pub fn add_point(&mut self, dist: f32, id: usize) {
        if self.k == 0 {
            return;
        }
        if self.dedup && self.heap.iter().any(|&(_, existing)| existing == id) {
            return;
        }
        if !self.is_full() {
            self.heap.push((OrderedFloat(dist), id));
        } else if dist < self.worst_dist() {
            self.heap.pop();
            self.heap.push((OrderedFloat(dist), id));
        }
    }

    /// Ascending by distance, ties by id.
    pub fn into_sorted(self) -> Vec<(f32, usize)> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|(d, id)| (d.0, id))
            .collect()
    }
}
