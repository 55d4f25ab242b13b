// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types shared by the embedding provider and the interaction store.

use thiserror::Error;

/// Errors surfaced by convomem operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The embedding model could not be initialized or failed during inference.
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    /// The interaction database could not be opened, read, or written.
    #[error("interaction storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A stored embedding could not be decoded.
    ///
    /// Retrieval recovers from this by skipping the affected row.
    #[error("malformed embedding: {0}")]
    MalformedEmbedding(String),

    /// A caller passed an argument that is rejected before any I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration file or environment override is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for MemoryError {
    fn from(err: rusqlite::Error) -> Self {
        MemoryError::StorageUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
