//! Built index: point store plus search structure.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::{Error, Result};
use crate::kdtree::KdForest;
use crate::kmeans_tree::KMeansTree;
use crate::linear;
use crate::params::{Algorithm, BuildParams};
use crate::result_set::KnnResultSet;
use crate::store::PointStore;

/// Search structure over a [`PointStore`].
#[derive(Debug, Clone)]
pub(crate) enum Structure {
    Linear,
    KdForest(KdForest),
    KMeans(KMeansTree),
    Composite { forest: KdForest, tree: KMeansTree },
}

impl Structure {
    /// Builds a concrete structure. Autotuning must be resolved beforehand.
    pub fn build(store: &PointStore, params: &BuildParams, rng: &mut ChaCha8Rng) -> Result<Self> {
        match params.algorithm {
            Algorithm::Linear => Ok(Structure::Linear),
            Algorithm::KdTree => Ok(Structure::KdForest(build_forest(store, params, rng)?)),
            Algorithm::KMeans => Ok(Structure::KMeans(KMeansTree::build(store, params, rng)?)),
            Algorithm::Composite => Ok(Structure::Composite {
                forest: build_forest(store, params, rng)?,
                tree: KMeansTree::build(store, params, rng)?,
            }),
            Algorithm::Autotuned => Err(Error::InvalidParameter(
                "autotuned parameters were not resolved to a concrete algorithm".into(),
            )),
        }
    }

    pub fn search(
        &self,
        store: &PointStore,
        query: &[f32],
        result: &mut KnnResultSet,
        checks: i32,
    ) {
        match self {
            Structure::Linear => linear::search(store, query, result),
            Structure::KdForest(forest) => forest.search(store, query, result, checks),
            Structure::KMeans(tree) => tree.search(store, query, result, checks),
            Structure::Composite { forest, tree } => {
                tree.search(store, query, result, checks);
                forest.search(store, query, result, checks);
            }
        }
    }

    pub fn insert(&mut self, store: &PointStore, id: u32, rng: &mut ChaCha8Rng) {
        match self {
            Structure::Linear => {}
            Structure::KdForest(forest) => forest.insert(store, id),
            Structure::KMeans(tree) => tree.insert(store, id, rng),
            Structure::Composite { forest, tree } => {
                forest.insert(store, id);
                tree.insert(store, id, rng);
            }
        }
    }

    pub fn used_memory(&self) -> usize {
        match self {
            Structure::Linear => 0,
            Structure::KdForest(forest) => forest.used_memory(),
            Structure::KMeans(tree) => tree.used_memory(),
            Structure::Composite { forest, tree } => forest.used_memory() + tree.used_memory(),
        }
    }

    fn needs_dedup(&self) -> bool {
        matches!(self, Structure::Composite { .. })
    }
}

fn build_forest(store: &PointStore, params: &BuildParams, rng: &mut ChaCha8Rng) -> Result<KdForest> {
    if params.trees == 0 {
        return Err(Error::InvalidParameter("trees must be at least 1".into()));
    }
    Ok(KdForest::build(store, params.trees, rng))
}

/// A built nearest-neighbor index owning a copy of its points.
#[derive(Debug, Clone)]
pub struct NnIndex {
    pub(crate) params: BuildParams,
    pub(crate) structure: Structure,
    pub(crate) store: PointStore,
    /// Row count at the last full build, used by the rebuild threshold.
    pub(crate) built_size: usize,
    pub(crate) rng: ChaCha8Rng,
}

impl NnIndex {
    pub(crate) fn build(store: PointStore, params: BuildParams) -> Result<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(params.random_seed);
        let structure = Structure::build(&store, &params, &mut rng)?;
        let built_size = store.len();
        Ok(Self {
            params,
            structure,
            store,
            built_size,
            rng,
        })
    }

    /// Rows held, removed ones included. Ids range over `0..len()`.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.len() == 0
    }

    /// Rows that are not removed.
    pub fn live_len(&self) -> usize {
        self.store.live_len()
    }

    pub fn dim(&self) -> usize {
        self.store.dim()
    }

    /// Parameters the structure was built with.
    pub fn params(&self) -> &BuildParams {
        &self.params
    }

    pub fn is_removed(&self, id: usize) -> bool {
        id < self.store.len() && self.store.is_removed(id)
    }

    /// Up to `k` (distance, id) pairs, nearest first.
    pub(crate) fn knn(&self, query: &[f32], k: usize, checks: i32) -> Vec<(f32, usize)> {
        let mut result = if self.structure.needs_dedup() {
            KnnResultSet::deduplicating(k)
        } else {
            KnnResultSet::new(k)
        };
        self.structure.search(&self.store, query, &mut result, checks);
        result.into_sorted()
    }

    pub(crate) fn rebuild(&mut self) -> Result<()> {
        self.structure = Structure::build(&self.store, &self.params, &mut self.rng)?;
        self.built_size = self.store.len();
        Ok(())
    }

    pub(crate) fn insert_range(&mut self, ids: std::ops::Range<usize>) {
        for id in ids {
            self.structure.insert(&self.store, id as u32, &mut self.rng);
        }
    }

    /// Bytes used by the structure and bookkeeping, excluding the vectors.
    pub fn used_memory(&self) -> usize {
        self.structure.used_memory() + self.store.overhead_bytes()
    }

    /// Bytes used by the stored vectors.
    pub fn dataset_memory(&self) -> usize {
        self.store.dataset_bytes()
    }
}
