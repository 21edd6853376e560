//! Owned point storage with removal flags.

use ndarray::ArrayView2;

use crate::error::{Error, Result};

/// Squared Euclidean distance between two equal-length slices.
#[inline]
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Row-major point matrix. Ids are row positions and never change.
#[derive(Debug, Clone)]
pub(crate) struct PointStore {
    data: Vec<f32>,
    dim: usize,
    removed: Vec<bool>,
    removed_count: usize,
}

impl PointStore {
    pub fn from_view(points: ArrayView2<f32>) -> Self {
        let dim = points.ncols();
        let data: Vec<f32> = points.iter().copied().collect();
        let removed = vec![false; points.nrows()];
        Self {
            data,
            dim,
            removed,
            removed_count: 0,
        }
    }

    pub fn with_removed(points: ArrayView2<f32>, removed_ids: &[usize]) -> Result<Self> {
        let mut store = Self::from_view(points);
        for &id in removed_ids {
            store.remove(id)?;
        }
        Ok(store)
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Total rows, removed ones included.
    #[inline]
    pub fn len(&self) -> usize {
        self.removed.len()
    }

    pub fn live_len(&self) -> usize {
        self.len() - self.removed_count
    }

    #[inline]
    pub fn row(&self, id: usize) -> &[f32] {
        &self.data[id * self.dim..(id + 1) * self.dim]
    }

    #[inline]
    pub fn is_removed(&self, id: usize) -> bool {
        self.removed[id]
    }

    pub fn live_ids(&self) -> Vec<u32> {
        (0..self.len())
            .filter(|&i| !self.removed[i])
            .map(|i| i as u32)
            .collect()
    }

    pub fn removed_ids(&self) -> Vec<usize> {
        (0..self.len()).filter(|&i| self.removed[i]).collect()
    }

    /// Appends rows and returns the id range they received.
    pub fn append(&mut self, points: ArrayView2<f32>) -> Result<std::ops::Range<usize>> {
        if points.ncols() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                got: points.ncols(),
            });
        }
        let start = self.len();
        self.data.extend(points.iter().copied());
        self.removed.extend(std::iter::repeat(false).take(points.nrows()));
        Ok(start..self.len())
    }

    pub fn remove(&mut self, id: usize) -> Result<()> {
        if id >= self.len() {
            return Err(Error::UnknownPoint(id));
        }
        if self.removed[id] {
            return Err(Error::PointAlreadyRemoved(id));
        }
        self.removed[id] = true;
        self.removed_count += 1;
        Ok(())
    }

    /// Bytes held by the vectors themselves.
    pub fn dataset_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    /// Bytes of bookkeeping beyond the vectors.
    pub fn overhead_bytes(&self) -> usize {
        self.removed.len() * std::mem::size_of::<bool>()
    }

    /// Copy of the selected rows as a fresh store.
    pub fn subset(&self, ids: &[u32]) -> Self {
        let mut data = Vec::with_capacity(ids.len() * self.dim);
        for &id in ids {
            data.extend_from_slice(self.row(id as usize));
        }
        Self {
            data,
            dim: self.dim,
            removed: vec![false; ids.len()],
            removed_count: 0,
        }
    }
}
