//! annkit: nearest-neighbor index handles and hierarchical k-means
//! clustering.
//!
//! [`Flann`] owns one mutable index per handle (build, search, add, remove,
//! save, load). [`HierarchicalKMeans`] computes cluster centers with
//! best-of-n restarts and empty-cluster rejection, and [`evaluate`] scores
//! clusterings. Options arrive as loosely typed [`Options`] maps and are
//! normalized by the [`params`] registry. The heavy lifting is done by a
//! [`SearchEngine`], by default the bundled `annkit-engine`.
//!
//! ```no_run
//! use annkit::{options, Flann, HierarchicalKMeans, Options};
//! use ndarray::Array2;
//!
//! let points = Array2::<f32>::from_shape_fn((1000, 16), |(i, j)| ((i * 31 + j * 7) % 97) as f32);
//! let flann = Flann::new();
//! flann.build(points.view(), &options([("algorithm", "kdtree"), ("trees", "4")]))?;
//! let neighbors = flann.search(points.view(), 5, &Options::new())?;
//!
//! let centroids = flann.hierarchical_kmeans(
//!     points.view(),
//!     &HierarchicalKMeans::new(5, 2).with_seed(42),
//! )?;
//! assert_eq!(centroids.nrows(), 9);
//! # let _ = neighbors;
//! # Ok::<(), annkit::Error>(())
//! ```

pub mod clustering;
pub mod engine;
pub mod error;
pub mod evaluate;
pub mod index;
pub mod lock;
pub mod params;
pub mod seed;

pub use annkit_engine::{Algorithm, LogLevel};
pub use clustering::{CentersInit, ClusterResult, HierarchicalKMeans, Scalar, SeedSpec};
pub use engine::{NativeEngine, SearchEngine};
pub use error::{Error, Result};
pub use evaluate::ClusterEvidence;
pub use index::{BuildInfo, Flann, Neighbors, DEFAULT_REBUILD_THRESHOLD};
pub use params::{options, IndexParams, Options, ParamValue};
