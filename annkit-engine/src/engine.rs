//! Engine entry points.

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::borrow::Cow;
use std::path::Path;

use crate::autotune;
use crate::error::{Error, Result};
use crate::index::NnIndex;
use crate::kmeans_tree::KMeansTree;
use crate::params::{Algorithm, BuildParams, BuildReport, LogLevel};
use crate::persist;
use crate::store::PointStore;

/// Stateless native engine. Every index it builds is an owned [`NnIndex`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Engine;

fn check_points(points: &ArrayView2<f32>) -> Result<()> {
    if points.nrows() == 0 {
        return Err(Error::InvalidParameter("point set is empty".into()));
    }
    if points.ncols() == 0 {
        return Err(Error::InvalidParameter("points have zero dimensions".into()));
    }
    Ok(())
}

fn row_slice<'a>(row: &'a ArrayView1<'_, f32>) -> Cow<'a, [f32]> {
    match row.as_slice() {
        Some(slice) => Cow::Borrowed(slice),
        None => Cow::Owned(row.to_vec()),
    }
}

impl Engine {
    pub fn new() -> Self {
        Self
    }

    /// Builds an index over `points`, autotuning first when requested.
    ///
    /// # Returns
    ///
    /// The index and a report carrying the parameters actually used. When
    /// autotuning ran, `report.params.checks` is the estimated budget for
    /// the target precision and `report.speedup` the measured gain over a
    /// linear scan.
    pub fn build_index(
        &self,
        points: ArrayView2<f32>,
        params: &BuildParams,
    ) -> Result<(NnIndex, BuildReport)> {
        check_points(&points)?;
        let store = PointStore::from_view(points);

        if !params.wants_autotune() {
            let index = NnIndex::build(store, params.clone())?;
            if params.log_level.admits(LogLevel::Info) {
                tracing::info!(
                    algorithm = ?params.algorithm,
                    points = index.len(),
                    dim = index.dim(),
                    "engine.build.completed"
                );
            }
            let report = BuildReport {
                params: index.params.clone(),
                speedup: 0.0,
            };
            return Ok((index, report));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(params.random_seed);
        let tuned = autotune::tune(&store, params, &mut rng)?;
        let target = tuned.target_precision;
        let mut index = NnIndex::build(store, tuned)?;
        let (checks, speedup) = autotune::estimate_search_params(&index, target, &mut rng);
        index.params.checks = checks;
        if params.log_level.admits(LogLevel::Info) {
            tracing::info!(
                algorithm = ?index.params.algorithm,
                checks,
                speedup,
                points = index.len(),
                "engine.autotune.completed"
            );
        }
        let report = BuildReport {
            params: index.params.clone(),
            speedup,
        };
        Ok((index, report))
    }

    /// Releases an index. Consuming it makes a second release impossible.
    pub fn free_index(&self, index: NnIndex) {
        if index.params.log_level.admits(LogLevel::Debug) {
            tracing::debug!(points = index.len(), "engine.index.freed");
        }
        drop(index);
    }

    /// k nearest neighbors of every query row.
    ///
    /// # Returns
    ///
    /// `(ids, distances)`, both `queries.nrows() x k`, nearest first, with
    /// squared Euclidean distances. Rows are padded with `-1` / `+inf` when
    /// fewer than `k` live points exist.
    pub fn search(
        &self,
        index: &NnIndex,
        queries: ArrayView2<f32>,
        k: usize,
        checks: i32,
    ) -> Result<(Array2<i64>, Array2<f32>)> {
        if k == 0 {
            return Err(Error::InvalidParameter("k must be at least 1".into()));
        }
        if queries.ncols() != index.dim() {
            return Err(Error::DimensionMismatch {
                expected: index.dim(),
                got: queries.ncols(),
            });
        }

        let rows: Vec<Vec<(f32, usize)>> = queries
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|row| index.knn(&row_slice(&row), k, checks))
            .collect();

        let mut ids = Array2::<i64>::from_elem((queries.nrows(), k), -1);
        let mut dists = Array2::<f32>::from_elem((queries.nrows(), k), f32::INFINITY);
        for (q, neighbors) in rows.into_iter().enumerate() {
            for (j, (dist, id)) in neighbors.into_iter().enumerate() {
                ids[[q, j]] = id as i64;
                dists[[q, j]] = dist;
            }
        }
        Ok((ids, dists))
    }

    /// One-shot search without keeping an index.
    ///
    /// `linear` scans exhaustively; other algorithms build a throw-away
    /// index and search it with `params.checks`.
    pub fn search_brute_force(
        &self,
        points: ArrayView2<f32>,
        queries: ArrayView2<f32>,
        k: usize,
        params: &BuildParams,
    ) -> Result<(Array2<i64>, Array2<f32>)> {
        let (index, report) = self.build_index(points, params)?;
        let checks = match report.params.algorithm {
            Algorithm::Linear => -1,
            _ => report.params.checks,
        };
        let result = self.search(&index, queries, k, checks);
        self.free_index(index);
        result
    }

    /// Appends points, rebuilding when the row count exceeds
    /// `rebuild_threshold` times the size at the last build.
    ///
    /// # Returns
    ///
    /// Whether the structure was rebuilt.
    pub fn add_points(
        &self,
        index: &mut NnIndex,
        points: ArrayView2<f32>,
        rebuild_threshold: f32,
    ) -> Result<bool> {
        if points.nrows() == 0 {
            return Ok(false);
        }
        let range = index.store.append(points)?;
        let grown = index.store.len() as f64;
        let rebuild = rebuild_threshold > 1.0
            && (index.built_size as f64) * (rebuild_threshold as f64) < grown;
        if rebuild {
            index.rebuild()?;
            if index.params.log_level.admits(LogLevel::Info) {
                tracing::info!(points = index.len(), "engine.index.rebuilt");
            }
        } else {
            index.insert_range(range);
        }
        Ok(rebuild)
    }

    /// Flags a point as removed. Its id is never reused.
    pub fn remove_point(&self, index: &mut NnIndex, id: usize) -> Result<()> {
        index.store.remove(id)
    }

    pub fn save_index(&self, index: &NnIndex, path: &Path) -> Result<()> {
        persist::save(index, path)
    }

    /// Restores an index saved by [`Engine::save_index`] over the same points.
    pub fn load_index(&self, path: &Path, points: ArrayView2<f32>) -> Result<NnIndex> {
        persist::load(path, points)
    }

    /// Cluster centers from a k-means tree cut at minimum variance.
    ///
    /// # Returns
    ///
    /// `(centers, count)` where `count` is the number of rows in `centers`.
    /// It is the largest `(branching - 1) * m + 1` not above
    /// `num_clusters` that the data supports, so it may be smaller than
    /// requested.
    pub fn compute_cluster_centers(
        &self,
        points: ArrayView2<f32>,
        num_clusters: usize,
        params: &BuildParams,
    ) -> Result<(Array2<f32>, usize)> {
        check_points(&points)?;
        if num_clusters == 0 {
            return Err(Error::InvalidParameter(
                "number of clusters must be at least 1".into(),
            ));
        }
        let store = PointStore::from_view(points);
        let mut rng = ChaCha8Rng::seed_from_u64(params.random_seed);
        let tree = KMeansTree::build(&store, params, &mut rng)?;
        let pivots = tree.cluster_centers(num_clusters);

        let count = pivots.len();
        let dim = store.dim();
        let flat: Vec<f32> = pivots.into_iter().flatten().collect();
        let centers = Array2::from_shape_vec((count, dim), flat)
            .map_err(|e| Error::InvalidParameter(format!("cluster center shape: {}", e)))?;
        if params.log_level.admits(LogLevel::Info) {
            tracing::info!(
                requested = num_clusters,
                produced = count,
                branching = params.branching,
                "engine.clusters.computed"
            );
        }
        Ok((centers, count))
    }

    /// Structure and bookkeeping bytes of `index`.
    pub fn used_memory(&self, index: &NnIndex) -> usize {
        index.used_memory()
    }

    /// Bytes held by the vectors of `index`.
    pub fn used_memory_for_dataset(&self, index: &NnIndex) -> usize {
        index.dataset_memory()
    }
}
