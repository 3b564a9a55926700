//! Storage error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid offset {offset} for path: {path}")]
    InvalidOffset { path: String, offset: u64 },

    #[error("operation not supported by driver: {0}")]
    Unsupported(&'static str),

    #[error("writer already closed: {0}")]
    WriterClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether a retry of the same operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Io(_))
    }
}
