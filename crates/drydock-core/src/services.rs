//! Service boundaries
//!
//! The registry core is composed behind these traits so decorators (the
//! pull-through controller, the event-emitting wrapper) can stack without the
//! HTTP layer knowing which composition it talks to. Decorators must preserve
//! the error taxonomy and cancellation behavior of the services they wrap.

use async_trait::async_trait;
use bytes::Bytes;
use drydock_storage::ByteStream;
use std::sync::Arc;

use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::CoreError;
use crate::reference::{ManifestRef, RepositoryName, Tag};

/// A manifest as stored: the exact bytes presented at put time plus the
/// detected media type and the digest over those bytes.
#[derive(Debug, Clone)]
pub struct StoredManifest {
    pub bytes: Bytes,
    pub media_type: String,
    pub digest: Digest,
}

/// One page of the repository catalog
#[derive(Debug, Clone)]
pub struct CatalogPage {
    pub repositories: Vec<String>,
    /// Set when the page filled and enumeration can continue from the last
    /// returned name.
    pub has_more: bool,
}

/// Blob access scoped to one repository
#[async_trait]
pub trait BlobService: Send + Sync {
    /// Resolve a digest to its descriptor; `BlobUnknown` when the repository
    /// holds no link for it.
    async fn stat(&self, digest: &Digest) -> Result<Descriptor, CoreError>;

    /// Stream blob content from `offset`
    async fn open(&self, digest: &Digest, offset: u64) -> Result<(ByteStream, Descriptor), CoreError>;

    /// Store a complete blob and link it into the repository
    async fn put(&self, media_type: &str, data: Bytes) -> Result<Descriptor, CoreError>;

    /// Link a blob already present in `from` without re-transferring bytes
    async fn mount(&self, from: &RepositoryName, digest: &Digest) -> Result<Descriptor, CoreError>;

    /// Remove the repository's link; never the physical blob
    async fn delete(&self, digest: &Digest) -> Result<(), CoreError>;

    /// Signed-URL offload for a blob download, when the driver supports it
    async fn redirect_url(
        &self,
        method: &str,
        digest: &Digest,
    ) -> Result<Option<String>, CoreError>;
}

/// Manifest access scoped to one repository
#[async_trait]
pub trait ManifestService: Send + Sync {
    async fn get(&self, reference: &ManifestRef) -> Result<StoredManifest, CoreError>;

    /// Validate and persist a manifest; returns the digest of the canonical
    /// bytes. A tag reference atomically updates the tag's current pointer.
    async fn put(
        &self,
        payload: Bytes,
        media_type: Option<&str>,
        tag: Option<&Tag>,
    ) -> Result<Digest, CoreError>;

    /// Remove a revision link (digest ref) or a tag (tag ref)
    async fn delete(&self, reference: &ManifestRef) -> Result<(), CoreError>;
}

/// Tag index scoped to one repository
#[async_trait]
pub trait TagService: Send + Sync {
    /// All tags, lexicographically sorted
    async fn all(&self) -> Result<Vec<String>, CoreError>;

    /// Tags whose current pointer resolves to `digest`
    async fn lookup(&self, digest: &Digest) -> Result<Vec<String>, CoreError>;
}

/// Freshly created upload session
#[derive(Debug, Clone)]
pub struct UploadSessionInfo {
    pub id: String,
    pub offset: u64,
}

/// Resumable blob upload sessions scoped to one repository
#[async_trait]
pub trait UploadService: Send + Sync {
    async fn create(&self) -> Result<UploadSessionInfo, CoreError>;

    /// Current committed offset of a session
    async fn status(&self, id: &str) -> Result<u64, CoreError>;

    /// Append a chunk at `offset` (when the client declared one); returns the
    /// new committed offset. An offset that disagrees with the session is
    /// `RangeInvalid`.
    async fn append(&self, id: &str, offset: Option<u64>, data: Bytes) -> Result<u64, CoreError>;

    /// Finish the session: verify the digest, publish the blob, link it
    async fn commit(
        &self,
        id: &str,
        digest: &Digest,
        final_chunk: Bytes,
    ) -> Result<Descriptor, CoreError>;

    async fn cancel(&self, id: &str) -> Result<(), CoreError>;
}

/// Per-repository handle produced by a [`Namespace`]
#[derive(Clone)]
pub struct Repository {
    pub name: RepositoryName,
    pub blobs: Arc<dyn BlobService>,
    pub manifests: Arc<dyn ManifestService>,
    pub tags: Arc<dyn TagService>,
    pub uploads: Arc<dyn UploadService>,
}

/// Factory for repository handles plus catalog enumeration
#[async_trait]
pub trait Namespace: Send + Sync {
    /// Pure constructor; performs no I/O
    fn repository(&self, name: &str) -> Result<Repository, CoreError>;

    /// Enumerate repository names lexicographically, starting after `last`
    async fn repositories(&self, last: Option<&str>, n: usize) -> Result<CatalogPage, CoreError>;
}
