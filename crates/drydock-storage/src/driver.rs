//! Storage driver contract
//!
//! A driver exposes a narrow capability set over an abstract object
//! namespace. Paths are slash-delimited, case-sensitive, and opaque to the
//! driver; the layout above them is owned by [`crate::paths`]. Implementations
//! must provide strong read-your-writes consistency on a single key once
//! `put_content` or `rename` returns.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::pin::Pin;

use crate::error::StorageError;

/// Type alias for a boxed stream of bytes
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send>>;

/// Metadata for a stored object or directory
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub is_dir: bool,
}

/// Storage driver trait
///
/// The registry core addresses all durable state through this interface.
/// An incomplete `put_content` must leave the prior content (or absence)
/// intact; drivers that cannot guarantee that natively write to a temporary
/// key and rename on completion.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Short driver name for logs ("filesystem", "inmemory", ...)
    fn name(&self) -> &'static str;

    /// Read the full content at `path`
    async fn get_content(&self, path: &str) -> Result<Bytes, StorageError>;

    /// Atomically replace the content at `path`
    async fn put_content(&self, path: &str, content: Bytes) -> Result<(), StorageError>;

    /// Stream the content at `path` starting at `offset`
    async fn reader(&self, path: &str, offset: u64) -> Result<ByteStream, StorageError>;

    /// Open a resumable writer at `path`
    ///
    /// With `append` set the writer continues after the existing bytes;
    /// otherwise any existing content is replaced. Only committed writers are
    /// observable through `get_content`/`stat`.
    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>, StorageError>;

    /// Stat a single path
    async fn stat(&self, path: &str) -> Result<FileInfo, StorageError>;

    /// List the direct children of `path`, lexicographically sorted
    async fn list(&self, path: &str) -> Result<Vec<String>, StorageError>;

    /// Move an object from `from` to `to`, replacing any existing target
    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// Delete the object or subtree at `path`
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// Produce a direct-download URL for `path`, if the driver supports it
    ///
    /// Drivers without signed-URL support return `Ok(None)` and the registry
    /// serves the bytes itself.
    async fn redirect_url(&self, method: &str, path: &str)
    -> Result<Option<String>, StorageError>;
}

/// Resumable writer handle returned by [`StorageDriver::writer`]
///
/// The durable position advances only on a successful `commit`; `cancel`
/// discards the file. Dropping a writer without committing leaves the path in
/// an unspecified but recoverable state: a subsequent `stat` reports the
/// bytes that reached the driver.
#[async_trait]
pub trait FileWriter: Send {
    /// Append a chunk to the writer
    async fn write(&mut self, chunk: Bytes) -> Result<(), StorageError>;

    /// Total bytes accepted so far, including pre-existing bytes in append mode
    fn size(&self) -> u64;

    /// Flush and make the written bytes durable
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Abort the write and remove the file
    async fn cancel(self: Box<Self>) -> Result<(), StorageError>;
}

/// Reject paths that could escape the registry tree or embed empty segments.
pub(crate) fn validate_path(path: &str) -> Result<(), StorageError> {
    if !path.starts_with('/') || path.len() > 4096 {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    for segment in path.trim_start_matches('/').split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
    }
    Ok(())
}
