//! Common error types for twinsync.

use thiserror::Error;

/// Top-level error type for twinsync operations.
///
/// Divergence between replicas is not an error; these variants cover misuse
/// of the tree API, malformed input and I/O failures.
#[derive(Debug, Error)]
pub enum Error {
    /// Replica tree structure would be violated.
    #[error("Invalid tree: {0}")]
    InvalidTree(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
