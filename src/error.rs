//! Cache Error Types
//!
//! Structured error handling for cache store operations.
//! A cache miss is not an error; everything here is a storage failure
//! that the caller has to decide about (retry, bypass the cache, abort).

use std::path::PathBuf;

/// Cache store error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to persist blob {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to initialize metadata index at {path}: {source}")]
    IndexInit {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Metadata index error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error("Blocking cache task failed: {0}")]
    Join(String),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the failure came from the metadata index rather than the blob directory
    pub fn is_index_error(&self) -> bool {
        matches!(self, CacheError::Index(_) | CacheError::IndexInit { .. })
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        CacheError::Join(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, CacheError>;
