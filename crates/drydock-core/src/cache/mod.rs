//! Blob descriptor cache
//!
//! Two layers share one interface: a global `digest → descriptor` map and a
//! repository-scoped view that additionally records which repositories link a
//! digest. The cache is an accelerator, never a source of truth; every
//! implementation tolerates loss and treats errors as misses.

mod memory;
mod redis;

pub use memory::InMemoryDescriptorCache;
pub use redis::RedisDescriptorCache;

use async_trait::async_trait;

use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::reference::RepositoryName;

/// Shared descriptor cache interface
///
/// A repository-scoped hit implies a global hit, so `set_repository` must
/// also populate the global layer.
#[async_trait]
pub trait BlobDescriptorCache: Send + Sync {
    async fn get(&self, digest: &Digest) -> Option<Descriptor>;

    async fn set(&self, descriptor: &Descriptor);

    async fn get_repository(&self, repo: &RepositoryName, digest: &Digest) -> Option<Descriptor>;

    async fn set_repository(&self, repo: &RepositoryName, descriptor: &Descriptor);

    /// Drop a digest from the global layer (and implicitly invalidate any
    /// scoped entries on their next read-through).
    async fn evict(&self, digest: &Digest);

    /// Drop a digest from one repository's scoped view
    async fn evict_repository(&self, repo: &RepositoryName, digest: &Digest);
}

fn scoped_key(repo: &RepositoryName, digest: &Digest) -> String {
    format!("repository::{repo}::blobs::{digest}")
}

fn global_key(digest: &Digest) -> String {
    format!("blobs::{digest}")
}
