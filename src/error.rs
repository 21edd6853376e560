//! Error types for the annkit library

use thiserror::Error;

/// Result type alias for annkit operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur during annkit operations
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown option or unresolvable option value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Shape, dimension or argument mismatch
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation requires a built index, or the handle is in the wrong state
    #[error("State error: {0}")]
    State(String),

    /// Invalid or duplicate point-id operation
    #[error("Index error: {0}")]
    Index(String),

    /// Degenerate or failed clustering result
    #[error("Clustering error: {0}")]
    Clustering(String),

    /// Unclassified engine failure
    #[error("Operation failed: {0}")]
    Operation(String),

    /// Error reading/writing files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<annkit_engine::Error> for Error {
    fn from(err: annkit_engine::Error) -> Self {
        use annkit_engine::Error as Engine;
        match err {
            Engine::Io(e) => Error::Io(e),
            e @ (Engine::DimensionMismatch { .. } | Engine::PointCountMismatch { .. }) => {
                Error::Validation(e.to_string())
            }
            e @ (Engine::UnknownPoint(_) | Engine::PointAlreadyRemoved(_)) => {
                Error::Index(e.to_string())
            }
            e => Error::Operation(e.to_string()),
        }
    }
}
