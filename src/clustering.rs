//! Hierarchical k-means clustering.
//!
//! The engine computes cluster centers by cutting a k-means tree with
//! `branch_size` children per node. [`HierarchicalKMeans`] drives it:
//! it validates the request, seeds every attempt, optionally rejects
//! clusterings with empty clusters, and keeps the attempt with the lowest
//! objective value.

use annkit_engine::Algorithm;
use ndarray::{Array2, ArrayView2, Axis, NdFloat};
use serde::{Deserialize, Serialize};

pub use annkit_engine::CentersInit;

use crate::engine::SearchEngine;
use crate::error::{Error, Result};
use crate::evaluate::{self, ClusterEvidence};
use crate::params::IndexParams;
use crate::seed::{derive_seeds, draw_seed, retry_seeds};

/// Default number of tries per attempt when empty clusters are rejected.
pub const DEFAULT_MAX_RETRIES: usize = 100;

/// Floating-point element types accepted and produced by clustering.
///
/// The engine works in `f32`; inputs are converted on the way in and
/// centroids converted back.
pub trait Scalar: NdFloat + Into<f64> {
    fn from_f64(value: f64) -> Self;

    fn to_engine(self) -> f32 {
        let wide: f64 = self.into();
        wide as f32
    }
}

impl Scalar for f32 {
    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn to_engine(self) -> f32 {
        self
    }
}

impl Scalar for f64 {
    fn from_f64(value: f64) -> Self {
        value
    }
}

/// Where attempt seeds come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SeedSpec {
    /// Draw a base seed from the shared generator.
    #[default]
    Shared,
    /// The first attempt uses this seed; the rest are derived from it.
    Base(u64),
    /// One seed per attempt, exactly `best_of_n` of them.
    List(Vec<u64>),
}

/// Centroids of a clustering.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterResult<T> {
    /// `num_clusters x dim`
    pub centroids: Array2<T>,
    /// Sum of squared distances from each point to its nearest centroid.
    pub objective: f64,
    /// Seed of the retained attempt, `None` when the engine was not used.
    pub seed: Option<u64>,
}

impl<T: Scalar> ClusterResult<T> {
    /// Centroids converted to another element type.
    pub fn cast<O: Scalar>(&self) -> Array2<O> {
        self.centroids.mapv(|v| O::from_f64(v.into()))
    }
}

/// Hierarchical k-means configuration.
///
/// Produces `(branch_size - 1) * num_branches + 1` clusters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchicalKMeans {
    /// Children per split (>= 2)
    pub branch_size: usize,
    /// Number of splits (>= 1)
    pub num_branches: usize,
    /// Lloyd iterations per split, `None` runs until convergence
    pub max_iterations: Option<usize>,
    pub centers_init: CentersInit,
    /// Independent attempts; the lowest objective wins (default: 1)
    pub best_of_n: usize,
    /// Reject clusterings where some centroid has no points
    pub ensure_none_empty: bool,
    /// Tries per attempt when rejecting empty clusterings (default: 100)
    pub max_retries: usize,
    pub seed: SeedSpec,
}

impl Default for HierarchicalKMeans {
    fn default() -> Self {
        Self {
            branch_size: 32,
            num_branches: 1,
            max_iterations: None,
            centers_init: CentersInit::Random,
            best_of_n: 1,
            ensure_none_empty: false,
            max_retries: DEFAULT_MAX_RETRIES,
            seed: SeedSpec::Shared,
        }
    }
}

struct Attempt<T> {
    seed: u64,
    centroids: Array2<T>,
    objective: f64,
}

impl HierarchicalKMeans {
    pub fn new(branch_size: usize, num_branches: usize) -> Self {
        Self {
            branch_size,
            num_branches,
            ..Self::default()
        }
    }

    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = Some(iterations);
        self
    }

    pub fn with_centers_init(mut self, init: CentersInit) -> Self {
        self.centers_init = init;
        self
    }

    pub fn with_best_of_n(mut self, n: usize) -> Self {
        self.best_of_n = n;
        self
    }

    /// Rejects clusterings with empty clusters, trying each attempt up to
    /// `max_retries` times.
    pub fn with_none_empty(mut self, max_retries: usize) -> Self {
        self.ensure_none_empty = true;
        self.max_retries = max_retries;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = SeedSpec::Base(seed);
        self
    }

    pub fn with_seeds(mut self, seeds: Vec<u64>) -> Self {
        self.seed = SeedSpec::List(seeds);
        self
    }

    /// `(branch_size - 1) * num_branches + 1`
    pub fn num_clusters(&self) -> Result<usize> {
        if self.branch_size < 2 {
            return Err(Error::Validation(format!(
                "branch_size must be an integer >= 2, got {}",
                self.branch_size
            )));
        }
        if self.num_branches < 1 {
            return Err(Error::Validation(format!(
                "num_branches must be an integer >= 1, got {}",
                self.num_branches
            )));
        }
        (self.branch_size - 1)
            .checked_mul(self.num_branches)
            .and_then(|n| n.checked_add(1))
            .ok_or_else(|| Error::Validation("number of clusters overflows".into()))
    }

    fn validate<T>(&self, points: &ArrayView2<T>) -> Result<usize> {
        let num_clusters = self.num_clusters()?;
        if self.best_of_n < 1 {
            return Err(Error::Validation(format!(
                "best_of_n must be an integer >= 1, got {}",
                self.best_of_n
            )));
        }
        if self.ensure_none_empty && self.max_retries < 1 {
            return Err(Error::Validation(format!(
                "max_retries must be an integer >= 1, got {}",
                self.max_retries
            )));
        }
        if let SeedSpec::List(seeds) = &self.seed {
            if seeds.len() != self.best_of_n {
                return Err(Error::Validation(format!(
                    "expected {} seeds (one per attempt), got {}",
                    self.best_of_n,
                    seeds.len()
                )));
            }
        }
        if points.nrows() == 0 || points.ncols() == 0 {
            return Err(Error::Validation(format!(
                "points must be a non-empty matrix, got {}x{}",
                points.nrows(),
                points.ncols()
            )));
        }
        if points.nrows() < num_clusters {
            return Err(Error::Validation(format!(
                "{} points cannot form {} clusters",
                points.nrows(),
                num_clusters
            )));
        }
        Ok(num_clusters)
    }

    fn attempt_seeds(&self) -> Vec<u64> {
        let base = match &self.seed {
            SeedSpec::List(seeds) => return seeds.clone(),
            SeedSpec::Base(seed) => *seed,
            SeedSpec::Shared => draw_seed(),
        };
        std::iter::once(base)
            .chain(derive_seeds(base, self.best_of_n - 1))
            .collect()
    }

    fn engine_params(&self, base: &IndexParams) -> Result<IndexParams> {
        let iterations = match self.max_iterations {
            Some(n) => i32::try_from(n).map_err(|_| {
                Error::Validation(format!("max_iterations is out of range: {}", n))
            })?,
            None => -1,
        };
        Ok(IndexParams {
            algorithm: Algorithm::KMeans,
            branching: self.branch_size,
            iterations,
            centers_init: self.centers_init,
            ..base.clone()
        })
    }

    /// One engine call. Anything but exactly `num_clusters` centers is a
    /// failed clustering.
    fn compute<E: SearchEngine>(
        engine: &E,
        data: ArrayView2<f32>,
        num_clusters: usize,
        params: &IndexParams,
        seed: u64,
    ) -> Result<Array2<f32>> {
        let (centers, status) =
            engine.compute_cluster_centers(data, num_clusters, &params.to_build_params(seed))?;
        if status <= 0 {
            return Err(Error::Clustering(format!(
                "engine failed to cluster, status {}",
                status
            )));
        }
        if status as usize != num_clusters || centers.nrows() != num_clusters {
            return Err(Error::Clustering(format!(
                "engine produced {} clusters, {} requested",
                status, num_clusters
            )));
        }
        Ok(centers)
    }

    /// Centers for one attempt, retried while empty clusters are rejected.
    fn centers_for<E: SearchEngine>(
        &self,
        engine: &E,
        data: ArrayView2<f32>,
        num_clusters: usize,
        params: &IndexParams,
        seed: u64,
    ) -> Result<Array2<f32>> {
        if !self.ensure_none_empty {
            return Self::compute(engine, data, num_clusters, params, seed);
        }
        let tries = std::iter::once(seed).chain(retry_seeds(seed, self.max_retries - 1));
        for try_seed in tries {
            let centers = Self::compute(engine, data, num_clusters, params, try_seed)?;
            let evidence = ClusterEvidence::RawPoints {
                points: data.view(),
                centers: centers.view(),
            };
            if !evidence.has_empty_cluster()? {
                return Ok(centers);
            }
            tracing::debug!(seed = try_seed, "clustering.attempt.rejected");
        }
        Err(Error::Clustering(format!(
            "no clustering without empty clusters after {} tries",
            self.max_retries
        )))
    }

    /// Clusters `points` with `engine`, reusing the non-clustering
    /// parameters of `base` (log level, cb_index, ...).
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for invalid settings or points, raised before
    /// the engine is called. [`Error::Clustering`] when the engine fails or
    /// every try of an attempt has an empty cluster.
    pub fn run<T: Scalar, E: SearchEngine>(
        &self,
        engine: &E,
        base: &IndexParams,
        points: ArrayView2<T>,
    ) -> Result<ClusterResult<T>> {
        let num_clusters = self.validate(&points)?;
        if num_clusters == 1 {
            return mean_of(points);
        }

        let params = self.engine_params(base)?;
        let data = points.mapv(|v| v.to_engine());
        let seeds = self.attempt_seeds();
        let attempts = seeds.len();

        let best = seeds
            .into_iter()
            .map(|seed| -> Result<Attempt<T>> {
                let centers = self.centers_for(engine, data.view(), num_clusters, &params, seed)?;
                let centroids = centers.mapv(|v| T::from_f64(v as f64));
                let objective: f64 = evaluate::objective(points, centroids.view())?.into();
                tracing::debug!(seed, objective, "clustering.attempt.completed");
                Ok(Attempt {
                    seed,
                    centroids,
                    objective,
                })
            })
            .try_fold(None, |best: Option<Attempt<T>>, next| -> Result<_> {
                let next = next?;
                Ok(match best {
                    Some(kept) if kept.objective <= next.objective => Some(kept),
                    _ => Some(next),
                })
            })?
            .ok_or_else(|| Error::Clustering("no clustering attempt was made".into()))?;

        tracing::info!(
            clusters = num_clusters,
            attempts,
            objective = best.objective,
            "clustering.completed"
        );
        Ok(ClusterResult {
            centroids: best.centroids,
            objective: best.objective,
            seed: Some(best.seed),
        })
    }

    /// [`HierarchicalKMeans::run`] with centroids converted to `O`.
    pub fn run_as<T: Scalar, O: Scalar, E: SearchEngine>(
        &self,
        engine: &E,
        base: &IndexParams,
        points: ArrayView2<T>,
    ) -> Result<Array2<O>> {
        Ok(self.run(engine, base, points)?.cast())
    }

    /// Flat k-means with `num_clusters` centroids, using every setting of
    /// `self` except `branch_size` and `num_branches`.
    pub fn kmeans<T: Scalar, E: SearchEngine>(
        &self,
        engine: &E,
        base: &IndexParams,
        points: ArrayView2<T>,
        num_clusters: usize,
    ) -> Result<ClusterResult<T>> {
        match num_clusters {
            0 => Err(Error::Validation(
                "num_clusters must be an integer >= 1, got 0".into(),
            )),
            1 => {
                if points.nrows() == 0 || points.ncols() == 0 {
                    return Err(Error::Validation("points must be a non-empty matrix".into()));
                }
                mean_of(points)
            }
            n => Self {
                branch_size: n,
                num_branches: 1,
                ..self.clone()
            }
            .run(engine, base, points),
        }
    }
}

fn mean_of<T: Scalar>(points: ArrayView2<T>) -> Result<ClusterResult<T>> {
    let count = T::from_f64(points.nrows() as f64);
    let centroids = (points.sum_axis(Axis(0)) / count).insert_axis(Axis(0));
    let objective: f64 = evaluate::objective(points, centroids.view())?.into();
    Ok(ClusterResult {
        centroids,
        objective,
        seed: None,
    })
}
