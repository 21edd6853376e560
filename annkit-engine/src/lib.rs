//! Native nearest-neighbor engine.
//!
//! Builds kd-forests, hierarchical k-means trees or a linear scan over an
//! owned copy of a point set, optionally autotuning the choice for a target
//! precision. Distances are squared Euclidean. The same k-means tree also
//! produces cluster centers for hierarchical clustering.
//!
//! # Example
//!
//! ```no_run
//! use annkit_engine::{BuildParams, Engine};
//! use ndarray::Array2;
//!
//! let points = Array2::<f32>::zeros((100, 8));
//! let engine = Engine::new();
//! let (index, _report) = engine.build_index(points.view(), &BuildParams::default()).unwrap();
//! let (ids, dists) = engine.search(&index, points.view(), 5, 32).unwrap();
//! ```

pub mod engine;
pub mod error;
pub mod index;
pub mod params;

mod autotune;
mod kdtree;
mod kmeans_tree;
mod linear;
mod persist;
mod result_set;
mod store;

pub use autotune::DEFAULT_TARGET_PRECISION;
pub use engine::Engine;
pub use error::{Error, Result};
pub use index::NnIndex;
pub use params::{Algorithm, BuildParams, BuildReport, CentersInit, LogLevel, CHECKS_UNLIMITED};
pub use store::squared_l2;
