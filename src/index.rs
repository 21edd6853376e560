//! Index handles.
//!
//! A [`Flann`] handle owns at most one engine index at a time. Building or
//! loading releases the previous index before creating the next one, and
//! the engine resource is released exactly once, when it is replaced,
//! deleted, or when the handle is dropped.
//!
//! Searches take the handle's slot for reading and may run concurrently.
//! Build, add, remove, load and delete take it for writing, so they never
//! overlap a search or each other.

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView2, Axis};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::clustering::{HierarchicalKMeans, Scalar};
use crate::engine::{NativeEngine, SearchEngine};
use crate::error::{Error, Result};
use crate::lock::IndexFileLock;
use crate::params::{IndexParams, Options};
use crate::seed::resolve_seed;

/// Growth factor past which [`Flann::add`] has the engine rebuild instead of
/// inserting incrementally.
pub const DEFAULT_REBUILD_THRESHOLD: f32 = 2.0;

/// Parameters an index was built with, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildInfo {
    /// Achieved parameters. After autotuning these are the selected ones.
    pub params: IndexParams,
    /// Measured speedup over a linear scan, when the engine reported one.
    pub speedup: Option<f32>,
}

/// Search results.
///
/// A search with `k == 1` returns one id and distance per query; any larger
/// `k` returns a `queries x k` matrix, nearest first.
#[derive(Debug, Clone, PartialEq)]
pub enum Neighbors {
    Single {
        ids: Array1<i64>,
        distances: Array1<f32>,
    },
    Multi {
        ids: Array2<i64>,
        distances: Array2<f32>,
    },
}

impl Neighbors {
    fn from_engine(ids: Array2<i64>, distances: Array2<f32>) -> Self {
        if ids.ncols() == 1 {
            Neighbors::Single {
                ids: ids.column(0).to_owned(),
                distances: distances.column(0).to_owned(),
            }
        } else {
            Neighbors::Multi { ids, distances }
        }
    }

    /// Number of neighbors per query.
    pub fn k(&self) -> usize {
        match self {
            Neighbors::Single { .. } => 1,
            Neighbors::Multi { ids, .. } => ids.ncols(),
        }
    }

    /// Results as `queries x k` matrices, whatever `k` was.
    pub fn into_matrices(self) -> (Array2<i64>, Array2<f32>) {
        match self {
            Neighbors::Single { ids, distances } => {
                (ids.insert_axis(Axis(1)), distances.insert_axis(Axis(1)))
            }
            Neighbors::Multi { ids, distances } => (ids, distances),
        }
    }
}

/// An engine index together with what the handle knows about it.
///
/// Dropping it hands the index back to the engine.
struct OwnedIndex<E: SearchEngine> {
    engine: Arc<E>,
    index: Option<E::Index>,
    num_points: usize,
    dim: usize,
    info: BuildInfo,
}

impl<E: SearchEngine> OwnedIndex<E> {
    fn new(engine: Arc<E>, index: E::Index, num_points: usize, dim: usize, info: BuildInfo) -> Self {
        Self {
            engine,
            index: Some(index),
            num_points,
            dim,
            info,
        }
    }

    fn get(&self) -> Result<&E::Index> {
        self.index
            .as_ref()
            .ok_or_else(|| Error::State("index has been released".into()))
    }

    fn get_mut(&mut self) -> Result<&mut E::Index> {
        self.index
            .as_mut()
            .ok_or_else(|| Error::State("index has been released".into()))
    }
}

impl<E: SearchEngine> Drop for OwnedIndex<E> {
    fn drop(&mut self) {
        if let Some(index) = self.index.take() {
            self.engine.free_index(index);
        }
    }
}

fn not_built() -> Error {
    Error::State("no index has been built or loaded".into())
}

fn check_points(points: &ArrayView2<f32>) -> Result<()> {
    if points.nrows() == 0 || points.ncols() == 0 {
        return Err(Error::Validation(format!(
            "points must be a non-empty matrix, got {}x{}",
            points.nrows(),
            points.ncols()
        )));
    }
    Ok(())
}

fn check_queries(queries: &ArrayView2<f32>, dim: usize) -> Result<()> {
    if queries.ncols() != dim {
        return Err(Error::Validation(format!(
            "queries have {} dimensions but the index has {}",
            queries.ncols(),
            dim
        )));
    }
    Ok(())
}

fn check_k(k: usize, num_points: usize) -> Result<()> {
    if k == 0 {
        return Err(Error::Validation("k must be at least 1".into()));
    }
    if k > num_points {
        return Err(Error::Validation(format!(
            "k ({}) exceeds the number of indexed points ({})",
            k, num_points
        )));
    }
    Ok(())
}

/// Owner of one mutable nearest-neighbor index.
pub struct Flann<E: SearchEngine = NativeEngine> {
    engine: Arc<E>,
    defaults: RwLock<IndexParams>,
    slot: RwLock<Option<OwnedIndex<E>>>,
}

impl Flann<NativeEngine> {
    /// A handle backed by the bundled engine.
    pub fn new() -> Self {
        Self::with_engine(NativeEngine::new())
    }
}

impl Default for Flann<NativeEngine> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: SearchEngine> Flann<E> {
    pub fn with_engine(engine: E) -> Self {
        Self {
            engine: Arc::new(engine),
            defaults: RwLock::new(IndexParams::default()),
            slot: RwLock::new(None),
        }
    }

    /// Merges `overrides` into the handle's defaults.
    ///
    /// The defaults are left unchanged when any override is invalid.
    pub fn set_defaults(&self, overrides: &Options) -> Result<()> {
        let mut defaults = self.defaults.write();
        *defaults = defaults.merged(overrides)?;
        Ok(())
    }

    pub fn defaults(&self) -> IndexParams {
        self.defaults.read().clone()
    }

    /// Builds an index over `points`, replacing any existing one.
    ///
    /// `overrides` are merged over the handle defaults. A negative
    /// `random_seed` draws a fresh seed from the shared generator.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for an empty point set and
    /// [`Error::Configuration`] for invalid overrides, both raised before
    /// the current index is touched.
    pub fn build(&self, points: ArrayView2<f32>, overrides: &Options) -> Result<BuildInfo> {
        check_points(&points)?;
        let params = self.defaults.read().merged(overrides)?;
        let seed = resolve_seed(params.explicit_seed());
        let build_params = params.to_build_params(seed);

        let mut slot = self.slot.write();
        *slot = None;

        let (index, report) = self.engine.build_index(points, &build_params)?;
        let info = BuildInfo {
            params: IndexParams::from_build_params(&report.params),
            speedup: (report.speedup > 0.0).then_some(report.speedup),
        };
        tracing::info!(
            points = points.nrows(),
            dim = points.ncols(),
            algorithm = ?info.params.algorithm,
            checks = info.params.checks,
            speedup = report.speedup,
            "index.build.completed"
        );
        *slot = Some(OwnedIndex::new(
            Arc::clone(&self.engine),
            index,
            points.nrows(),
            points.ncols(),
            info.clone(),
        ));
        Ok(info)
    }

    /// The `k` nearest indexed points of every query row.
    ///
    /// Uses the `checks` the index was built with unless `overrides`
    /// replaces it.
    pub fn search(&self, queries: ArrayView2<f32>, k: usize, overrides: &Options) -> Result<Neighbors> {
        let slot = self.slot.read();
        let owned = slot.as_ref().ok_or_else(not_built)?;
        check_queries(&queries, owned.dim)?;
        check_k(k, owned.num_points)?;
        let checks = owned.info.params.merged(overrides)?.checks;

        let (ids, distances) = self.engine.search(owned.get()?, queries, k, checks)?;
        Ok(Neighbors::from_engine(ids, distances))
    }

    /// One-shot search of `queries` against `points`, without touching the
    /// handle's index.
    pub fn nn(
        &self,
        points: ArrayView2<f32>,
        queries: ArrayView2<f32>,
        k: usize,
        overrides: &Options,
    ) -> Result<Neighbors> {
        check_points(&points)?;
        check_queries(&queries, points.ncols())?;
        check_k(k, points.nrows())?;
        let params = self.defaults.read().merged(overrides)?;
        let build_params = params.to_build_params(resolve_seed(params.explicit_seed()));

        let (ids, distances) = self
            .engine
            .search_brute_force(points, queries, k, &build_params)?;
        Ok(Neighbors::from_engine(ids, distances))
    }

    /// Appends `points` with [`DEFAULT_REBUILD_THRESHOLD`].
    pub fn add(&self, points: ArrayView2<f32>) -> Result<Range<usize>> {
        self.add_with_threshold(points, DEFAULT_REBUILD_THRESHOLD)
    }

    /// Appends `points` to the index.
    ///
    /// # Returns
    ///
    /// The ids assigned to the new points. They continue after the largest
    /// id handed out so far and are never reused.
    pub fn add_with_threshold(
        &self,
        points: ArrayView2<f32>,
        rebuild_threshold: f32,
    ) -> Result<Range<usize>> {
        let mut slot = self.slot.write();
        let owned = slot.as_mut().ok_or_else(not_built)?;
        check_queries(&points, owned.dim)?;
        let start = owned.num_points;
        if points.nrows() == 0 {
            return Ok(start..start);
        }

        let engine = Arc::clone(&owned.engine);
        engine.add_points(owned.get_mut()?, points, rebuild_threshold)?;
        owned.num_points += points.nrows();
        tracing::debug!(added = points.nrows(), total = owned.num_points, "index.points.added");
        Ok(start..owned.num_points)
    }

    /// Removes the point `id` from future results.
    ///
    /// # Errors
    ///
    /// [`Error::Index`] when `id` was never assigned or is already removed.
    pub fn remove(&self, id: usize) -> Result<()> {
        let mut slot = self.slot.write();
        let owned = slot.as_mut().ok_or_else(not_built)?;
        if id >= owned.num_points {
            return Err(Error::Index(format!(
                "point {} does not exist (index holds {} points)",
                id, owned.num_points
            )));
        }
        let engine = Arc::clone(&owned.engine);
        engine.remove_point(owned.get_mut()?, id)?;
        tracing::debug!(id, "index.point.removed");
        Ok(())
    }

    /// Writes the index to `path`.
    ///
    /// Points are not stored; [`Flann::load`] needs the same point set.
    pub fn save(&self, path: &Path) -> Result<()> {
        let slot = self.slot.read();
        let owned = slot.as_ref().ok_or_else(not_built)?;
        let _lock = IndexFileLock::exclusive(path)?;
        self.engine.save_index(owned.get()?, path)?;
        tracing::info!(path = %path.display(), points = owned.num_points, "index.saved");
        Ok(())
    }

    /// Replaces the current index with the one saved at `path`.
    ///
    /// `points` must be the point set the index was saved with, in the same
    /// order. The loaded index keeps the parameters it was saved with, so it
    /// answers searches exactly as it did before saving.
    pub fn load(&self, path: &Path, points: ArrayView2<f32>) -> Result<()> {
        check_points(&points)?;

        // Same order as `save`: slot first, then the file lock.
        let mut slot = self.slot.write();
        let _lock = IndexFileLock::shared(path)?;
        *slot = None;

        let (index, saved) = self.engine.load_index(path, points)?;
        let info = BuildInfo {
            params: IndexParams::from_build_params(&saved),
            speedup: None,
        };
        tracing::info!(
            path = %path.display(),
            points = points.nrows(),
            algorithm = ?info.params.algorithm,
            checks = info.params.checks,
            "index.loaded"
        );
        *slot = Some(OwnedIndex::new(
            Arc::clone(&self.engine),
            index,
            points.nrows(),
            points.ncols(),
            info,
        ));
        Ok(())
    }

    /// Releases the index, if any. Calling it again is a no-op.
    pub fn delete(&self) {
        if self.slot.write().take().is_some() {
            tracing::debug!("index.deleted");
        }
    }

    /// Structure bytes of the current index.
    pub fn used_memory(&self) -> Result<usize> {
        let slot = self.slot.read();
        let owned = slot.as_ref().ok_or_else(not_built)?;
        Ok(self.engine.used_memory(owned.get()?))
    }

    /// Dataset bytes held by the current index.
    pub fn used_memory_for_dataset(&self) -> Result<usize> {
        let slot = self.slot.read();
        let owned = slot.as_ref().ok_or_else(not_built)?;
        Ok(self.engine.used_memory_for_dataset(owned.get()?))
    }

    pub fn is_built(&self) -> bool {
        self.slot.read().is_some()
    }

    /// `(points, dim)` of the current index, counting removed points.
    pub fn shape(&self) -> Option<(usize, usize)> {
        self.slot.read().as_ref().map(|o| (o.num_points, o.dim))
    }

    pub fn build_info(&self) -> Option<BuildInfo> {
        self.slot.read().as_ref().map(|o| o.info.clone())
    }

    /// Hierarchical k-means over `points` using this handle's engine and
    /// defaults.
    pub fn hierarchical_kmeans<T: Scalar>(
        &self,
        points: ArrayView2<T>,
        config: &HierarchicalKMeans,
    ) -> Result<Array2<T>> {
        let base = self.defaults();
        Ok(config.run(self.engine.as_ref(), &base, points)?.centroids)
    }

    /// Flat k-means with `num_clusters` centroids.
    ///
    /// `config.branch_size` and `config.num_branches` are ignored.
    pub fn kmeans<T: Scalar>(
        &self,
        points: ArrayView2<T>,
        num_clusters: usize,
        config: &HierarchicalKMeans,
    ) -> Result<Array2<T>> {
        let base = self.defaults();
        Ok(config.kmeans(self.engine.as_ref(), &base, points, num_clusters)?.centroids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{options, ParamValue};
    use annkit_engine::{BuildParams, BuildReport};
    use ndarray::Array2;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Delegates to the native engine and counts builds and frees.
    #[derive(Default)]
    struct CountingEngine {
        inner: NativeEngine,
        built: AtomicUsize,
        freed: Arc<AtomicUsize>,
    }

    impl SearchEngine for CountingEngine {
        type Index = annkit_engine::NnIndex;

        fn build_index(
            &self,
            points: ArrayView2<f32>,
            params: &BuildParams,
        ) -> Result<(Self::Index, BuildReport)> {
            self.built.fetch_add(1, Ordering::SeqCst);
            SearchEngine::build_index(&self.inner, points, params)
        }

        fn free_index(&self, index: Self::Index) {
            self.freed.fetch_add(1, Ordering::SeqCst);
            SearchEngine::free_index(&self.inner, index)
        }

        fn search(
            &self,
            index: &Self::Index,
            queries: ArrayView2<f32>,
            k: usize,
            checks: i32,
        ) -> Result<(Array2<i64>, Array2<f32>)> {
            SearchEngine::search(&self.inner, index, queries, k, checks)
        }

        fn search_brute_force(
            &self,
            points: ArrayView2<f32>,
            queries: ArrayView2<f32>,
            k: usize,
            params: &BuildParams,
        ) -> Result<(Array2<i64>, Array2<f32>)> {
            SearchEngine::search_brute_force(&self.inner, points, queries, k, params)
        }

        fn add_points(
            &self,
            index: &mut Self::Index,
            points: ArrayView2<f32>,
            rebuild_threshold: f32,
        ) -> Result<()> {
            SearchEngine::add_points(&self.inner, index, points, rebuild_threshold)
        }

        fn remove_point(&self, index: &mut Self::Index, id: usize) -> Result<()> {
            SearchEngine::remove_point(&self.inner, index, id)
        }

        fn save_index(&self, index: &Self::Index, path: &Path) -> Result<()> {
            SearchEngine::save_index(&self.inner, index, path)
        }

        fn load_index(
            &self,
            path: &Path,
            points: ArrayView2<f32>,
        ) -> Result<(Self::Index, BuildParams)> {
            SearchEngine::load_index(&self.inner, path, points)
        }

        fn compute_cluster_centers(
            &self,
            points: ArrayView2<f32>,
            num_clusters: usize,
            params: &BuildParams,
        ) -> Result<(Array2<f32>, i64)> {
            SearchEngine::compute_cluster_centers(&self.inner, points, num_clusters, params)
        }

        fn used_memory(&self, index: &Self::Index) -> usize {
            SearchEngine::used_memory(&self.inner, index)
        }

        fn used_memory_for_dataset(&self, index: &Self::Index) -> usize {
            SearchEngine::used_memory_for_dataset(&self.inner, index)
        }
    }

    fn grid(n: usize) -> Array2<f32> {
        Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { i as f32 } else { (i % 3) as f32 })
    }

    fn seeded() -> Options {
        options([("random_seed", 3i64)])
    }

    #[test]
    fn test_index_released_exactly_once() {
        let engine = CountingEngine::default();
        let freed = Arc::clone(&engine.freed);
        let flann = Flann::with_engine(engine);
        let points = grid(20);

        flann.build(points.view(), &seeded()).unwrap();
        flann.build(points.view(), &seeded()).unwrap();
        assert_eq!(freed.load(Ordering::SeqCst), 1);

        flann.delete();
        flann.delete();
        assert_eq!(freed.load(Ordering::SeqCst), 2);

        flann.build(points.view(), &seeded()).unwrap();
        drop(flann);
        assert_eq!(freed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_invalid_build_keeps_current_index() {
        let engine = CountingEngine::default();
        let flann = Flann::with_engine(engine);
        let points = grid(10);
        flann.build(points.view(), &seeded()).unwrap();

        let empty = Array2::<f32>::zeros((0, 2));
        assert!(matches!(
            flann.build(empty.view(), &seeded()),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            flann.build(points.view(), &options([("algoritm", 1i64)])),
            Err(Error::Configuration(_))
        ));
        assert!(flann.is_built());
        assert_eq!(flann.engine.built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unbuilt_handle_reports_state_errors() {
        let flann = Flann::new();
        let q = grid(1);
        assert!(matches!(flann.search(q.view(), 1, &Options::new()), Err(Error::State(_))));
        assert!(matches!(flann.add(q.view()), Err(Error::State(_))));
        assert!(matches!(flann.remove(0), Err(Error::State(_))));
        assert!(matches!(flann.used_memory(), Err(Error::State(_))));
        assert!(matches!(flann.used_memory_for_dataset(), Err(Error::State(_))));
        assert!(flann.shape().is_none());
        flann.delete();
    }

    #[test]
    fn test_search_validates_queries() {
        let flann = Flann::new();
        let points = grid(8);
        flann.build(points.view(), &seeded()).unwrap();

        let wrong = Array2::<f32>::zeros((2, 3));
        assert!(matches!(
            flann.search(wrong.view(), 1, &Options::new()),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            flann.search(points.view(), 0, &Options::new()),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            flann.search(points.view(), 9, &Options::new()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_single_and_multi_neighbors() {
        let flann = Flann::new();
        let points = grid(12);
        flann
            .build(points.view(), &options([("algorithm", "linear")]))
            .unwrap();

        match flann.search(points.view(), 1, &Options::new()).unwrap() {
            Neighbors::Single { ids, distances } => {
                assert_eq!(ids.to_vec(), (0..12).collect::<Vec<i64>>());
                assert!(distances.iter().all(|&d| d == 0.0));
            }
            other => panic!("expected single neighbors, got {:?}", other),
        }

        let result = flann.search(points.view(), 3, &Options::new()).unwrap();
        assert_eq!(result.k(), 3);
        let (ids, distances) = result.into_matrices();
        assert_eq!(ids.dim(), (12, 3));
        for row in distances.rows() {
            assert!(row[0] <= row[1] && row[1] <= row[2]);
        }
    }

    #[test]
    fn test_remove_and_add_ids() {
        let flann = Flann::new();
        let points = grid(10);
        flann.build(points.view(), &seeded()).unwrap();

        flann.remove(4).unwrap();
        assert!(matches!(flann.remove(4), Err(Error::Index(_))));
        assert!(matches!(flann.remove(10), Err(Error::Index(_))));

        let extra = Array2::from_elem((2, 2), 50.0f32);
        assert_eq!(flann.add(extra.view()).unwrap(), 10..12);
        assert_eq!(flann.add(Array2::<f32>::zeros((0, 2)).view()).unwrap(), 12..12);
        assert_eq!(flann.shape(), Some((12, 2)));
    }

    #[test]
    fn test_checks_override_and_retained_params() {
        let flann = Flann::new();
        flann
            .set_defaults(&options([("trees", ParamValue::Int(4))]))
            .unwrap();
        let points = grid(30);
        let info = flann.build(points.view(), &seeded()).unwrap();
        assert_eq!(info.params.trees, 4);
        assert_eq!(info.params.random_seed, 3);
        assert_eq!(flann.build_info(), Some(info));

        let exact = flann
            .search(points.view(), 2, &options([("checks", -1i64)]))
            .unwrap();
        let (ids, _) = exact.into_matrices();
        for (i, row) in ids.rows().into_iter().enumerate() {
            assert_eq!(row[0], i as i64);
        }
        assert!(matches!(
            flann.search(points.view(), 2, &options([("checks", "many")])),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_set_defaults_is_atomic() {
        let flann = Flann::new();
        let result = flann.set_defaults(&options([
            ("checks", ParamValue::Int(64)),
            ("algorithm", ParamValue::from("quadtree")),
        ]));
        assert!(result.is_err());
        assert_eq!(flann.defaults(), IndexParams::default());
    }

    #[test]
    fn test_nn_without_index() {
        let flann = Flann::new();
        let points = grid(15);
        let result = flann
            .nn(points.view(), points.view(), 1, &options([("algorithm", "linear")]))
            .unwrap();
        let (ids, _) = result.into_matrices();
        assert_eq!(ids.column(0).to_vec(), (0..15).collect::<Vec<i64>>());
        assert!(!flann.is_built());
    }
}
