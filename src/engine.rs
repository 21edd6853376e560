//! The search engine collaborator.
//!
//! The handle and the clustering driver only reach the engine through
//! [`SearchEngine`]. [`NativeEngine`] is the bundled implementation; tests
//! substitute their own to exercise failure paths.

use std::path::Path;

use annkit_engine::{BuildParams, BuildReport};
use ndarray::{Array2, ArrayView2};

use crate::error::Result;

/// The bundled engine from `annkit-engine`.
pub type NativeEngine = annkit_engine::Engine;

/// Operations a search engine exposes. Points are `f32` and distances are
/// squared Euclidean.
pub trait SearchEngine: Send + Sync {
    /// Engine-owned index. Released only through [`SearchEngine::free_index`].
    type Index: Send + Sync;

    fn build_index(
        &self,
        points: ArrayView2<f32>,
        params: &BuildParams,
    ) -> Result<(Self::Index, BuildReport)>;

    fn free_index(&self, index: Self::Index);

    /// `(ids, distances)`, `queries.nrows() x k`, nearest first, padded with
    /// `-1` / `+inf`.
    fn search(
        &self,
        index: &Self::Index,
        queries: ArrayView2<f32>,
        k: usize,
        checks: i32,
    ) -> Result<(Array2<i64>, Array2<f32>)>;

    fn search_brute_force(
        &self,
        points: ArrayView2<f32>,
        queries: ArrayView2<f32>,
        k: usize,
        params: &BuildParams,
    ) -> Result<(Array2<i64>, Array2<f32>)>;

    fn add_points(
        &self,
        index: &mut Self::Index,
        points: ArrayView2<f32>,
        rebuild_threshold: f32,
    ) -> Result<()>;

    fn remove_point(&self, index: &mut Self::Index, id: usize) -> Result<()>;

    fn save_index(&self, index: &Self::Index, path: &Path) -> Result<()>;

    /// The restored index together with the parameters it was saved with.
    fn load_index(
        &self,
        path: &Path,
        points: ArrayView2<f32>,
    ) -> Result<(Self::Index, BuildParams)>;

    /// Centroids plus a status: the number of clusters produced, or a
    /// non-positive value when the engine failed to cluster.
    fn compute_cluster_centers(
        &self,
        points: ArrayView2<f32>,
        num_clusters: usize,
        params: &BuildParams,
    ) -> Result<(Array2<f32>, i64)>;

    fn used_memory(&self, index: &Self::Index) -> usize;

    fn used_memory_for_dataset(&self, index: &Self::Index) -> usize;
}

impl SearchEngine for NativeEngine {
    type Index = annkit_engine::NnIndex;

    fn build_index(
        &self,
        points: ArrayView2<f32>,
        params: &BuildParams,
    ) -> Result<(Self::Index, BuildReport)> {
        Ok(annkit_engine::Engine::build_index(self, points, params)?)
    }

    fn free_index(&self, index: Self::Index) {
        annkit_engine::Engine::free_index(self, index)
    }

    fn search(
        &self,
        index: &Self::Index,
        queries: ArrayView2<f32>,
        k: usize,
        checks: i32,
    ) -> Result<(Array2<i64>, Array2<f32>)> {
        Ok(annkit_engine::Engine::search(self, index, queries, k, checks)?)
    }

    fn search_brute_force(
        &self,
        points: ArrayView2<f32>,
        queries: ArrayView2<f32>,
        k: usize,
        params: &BuildParams,
    ) -> Result<(Array2<i64>, Array2<f32>)> {
        Ok(annkit_engine::Engine::search_brute_force(
            self, points, queries, k, params,
        )?)
    }

    fn add_points(
        &self,
        index: &mut Self::Index,
        points: ArrayView2<f32>,
        rebuild_threshold: f32,
    ) -> Result<()> {
        annkit_engine::Engine::add_points(self, index, points, rebuild_threshold)?;
        Ok(())
    }

    fn remove_point(&self, index: &mut Self::Index, id: usize) -> Result<()> {
        Ok(annkit_engine::Engine::remove_point(self, index, id)?)
    }

    fn save_index(&self, index: &Self::Index, path: &Path) -> Result<()> {
        Ok(annkit_engine::Engine::save_index(self, index, path)?)
    }

    fn load_index(
        &self,
        path: &Path,
        points: ArrayView2<f32>,
    ) -> Result<(Self::Index, BuildParams)> {
        let index = annkit_engine::Engine::load_index(self, path, points)?;
        let params = index.params().clone();
        Ok((index, params))
    }

    fn compute_cluster_centers(
        &self,
        points: ArrayView2<f32>,
        num_clusters: usize,
        params: &BuildParams,
    ) -> Result<(Array2<f32>, i64)> {
        let (centers, count) =
            annkit_engine::Engine::compute_cluster_centers(self, points, num_clusters, params)?;
        Ok((centers, count as i64))
    }

    fn used_memory(&self, index: &Self::Index) -> usize {
        annkit_engine::Engine::used_memory(self, index)
    }

    fn used_memory_for_dataset(&self, index: &Self::Index) -> usize {
        annkit_engine::Engine::used_memory_for_dataset(self, index)
    }
}
