//! Error types for the engine crate.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error of the index header.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Dimension mismatch between points and index.
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Point count mismatch when restoring an index.
    #[error("Point count mismatch: expected {expected}, got {got}")]
    PointCountMismatch { expected: usize, got: usize },

    /// Invalid parameter value.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Point id outside of the indexed range.
    #[error("Point {0} does not exist in the index")]
    UnknownPoint(usize),

    /// Point id that was already removed.
    #[error("Point {0} was already removed")]
    PointAlreadyRemoved(usize),

    /// Index file is corrupted or not an index file.
    #[error("Index file corrupted: {0}")]
    CorruptedIndex(String),
}
