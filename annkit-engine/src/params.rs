//! Engine-native build parameters.
//!
//! Enumerated options carry the integer codes the engine has always used on
//! its wire (`algorithm = 1` is a kd-forest, and so on). String names are a
//! concern of the caller-facing layer, not of this crate.

use serde::{Deserialize, Serialize};

/// Search budget meaning "visit everything" (exact search).
pub const CHECKS_UNLIMITED: i32 = -1;

/// Index structure selected at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    Linear,
    KdTree,
    KMeans,
    Composite,
    Autotuned,
}

impl Algorithm {
    /// Engine-native integer code.
    pub fn code(self) -> i64 {
        match self {
            Algorithm::Linear => 0,
            Algorithm::KdTree => 1,
            Algorithm::KMeans => 2,
            Algorithm::Composite => 3,
            Algorithm::Autotuned => 255,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Algorithm::Linear),
            1 => Some(Algorithm::KdTree),
            2 => Some(Algorithm::KMeans),
            3 => Some(Algorithm::Composite),
            255 => Some(Algorithm::Autotuned),
            _ => None,
        }
    }
}

/// Seeding method for k-means splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CentersInit {
    Random,
    Gonzales,
    KMeansPP,
}

impl CentersInit {
    pub fn code(self) -> i64 {
        match self {
            CentersInit::Random => 0,
            CentersInit::Gonzales => 1,
            CentersInit::KMeansPP => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(CentersInit::Random),
            1 => Some(CentersInit::Gonzales),
            2 => Some(CentersInit::KMeansPP),
            _ => None,
        }
    }
}

/// Verbosity of the engine's own progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    None,
    Fatal,
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    pub fn code(self) -> i64 {
        match self {
            LogLevel::None => 0,
            LogLevel::Fatal => 1,
            LogLevel::Error => 2,
            LogLevel::Warning => 3,
            LogLevel::Info => 4,
            LogLevel::Debug => 5,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(LogLevel::None),
            1 => Some(LogLevel::Fatal),
            2 => Some(LogLevel::Error),
            3 => Some(LogLevel::Warning),
            4 => Some(LogLevel::Info),
            5 => Some(LogLevel::Debug),
            _ => None,
        }
    }

    /// Whether an event of `level` should be emitted under this setting.
    pub fn admits(self, level: LogLevel) -> bool {
        level != LogLevel::None && level <= self
    }
}

/// Parameters for building an index or computing cluster centers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildParams {
    /// Index structure (default: kd-forest)
    pub algorithm: Algorithm,
    /// Leaves visited per query, or [`CHECKS_UNLIMITED`] (default: 32)
    pub checks: i32,
    /// Cluster-boundary index weighting k-means tree exploration (default: 0.5)
    pub cb_index: f32,
    /// Number of randomized kd-trees (default: 1)
    pub trees: usize,
    /// Children per k-means node (default: 32)
    pub branching: usize,
    /// Lloyd iterations per split, negative = until convergence (default: 5)
    pub iterations: i32,
    /// Seeding method of each k-means split (default: random)
    pub centers_init: CentersInit,
    /// Autotuning recall target, non-positive disables it (default: -1)
    pub target_precision: f32,
    /// Weight of build time in the autotuning cost (default: 0.01)
    pub build_weight: f32,
    /// Weight of memory in the autotuning cost (default: 0.0)
    pub memory_weight: f32,
    /// Fraction of the dataset sampled while autotuning (default: 0.1)
    pub sample_fraction: f32,
    /// Engine progress verbosity (default: warning)
    pub log_level: LogLevel,
    /// Seed of every randomized step
    pub random_seed: u64,
}

impl Default for BuildParams {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::KdTree,
            checks: 32,
            cb_index: 0.5,
            trees: 1,
            branching: 32,
            iterations: 5,
            centers_init: CentersInit::Random,
            target_precision: -1.0,
            build_weight: 0.01,
            memory_weight: 0.0,
            sample_fraction: 0.1,
            log_level: LogLevel::Warning,
            random_seed: 0,
        }
    }
}

impl BuildParams {
    /// Whether building with these parameters runs the autotuner.
    pub fn wants_autotune(&self) -> bool {
        self.algorithm == Algorithm::Autotuned || self.target_precision > 0.0
    }
}

/// Parameters actually used by a built index, plus its measured speedup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub params: BuildParams,
    /// Search speedup over a linear scan (0 when not measured)
    pub speedup: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_roundtrip() {
        for algo in [
            Algorithm::Linear,
            Algorithm::KdTree,
            Algorithm::KMeans,
            Algorithm::Composite,
            Algorithm::Autotuned,
        ] {
            assert_eq!(Algorithm::from_code(algo.code()), Some(algo));
        }
        assert_eq!(Algorithm::from_code(7), None);
        assert_eq!(CentersInit::from_code(2), Some(CentersInit::KMeansPP));
    }

    #[test]
    fn test_log_level_admits() {
        assert!(LogLevel::Info.admits(LogLevel::Warning));
        assert!(!LogLevel::Warning.admits(LogLevel::Info));
        assert!(!LogLevel::None.admits(LogLevel::Fatal));
        assert!(!LogLevel::Debug.admits(LogLevel::None));
    }

    #[test]
    fn test_autotune_trigger() {
        let mut params = BuildParams::default();
        assert!(!params.wants_autotune());
        params.target_precision = 0.9;
        assert!(params.wants_autotune());
    }
}
