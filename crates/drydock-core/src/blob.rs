//! Content-addressed blob store
//!
//! [`BlobStore`] is the global store: bytes live once under
//! `/blobs/<alg>/<prefix>/<hex>/data` regardless of how many repositories
//! reference them. [`LinkedBlobStore`] scopes it to one repository through
//! link files; a blob is accessible in a repository iff its link exists.

use async_trait::async_trait;
use bytes::Bytes;
use drydock_storage::{ByteStream, StorageDriver, StorageError, paths};
use futures::StreamExt;
use std::sync::Arc;
use tracing::debug;

use crate::cache::BlobDescriptorCache;
use crate::descriptor::Descriptor;
use crate::digest::{Digest, Digester};
use crate::error::CoreError;
use crate::reference::RepositoryName;
use crate::services::BlobService;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Global content-addressed store over a storage driver
#[derive(Clone)]
pub struct BlobStore {
    driver: Arc<dyn StorageDriver>,
    cache: Option<Arc<dyn BlobDescriptorCache>>,
}

impl BlobStore {
    pub fn new(
        driver: Arc<dyn StorageDriver>,
        cache: Option<Arc<dyn BlobDescriptorCache>>,
    ) -> Self {
        Self { driver, cache }
    }

    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    fn data_path(digest: &Digest) -> String {
        paths::blob_data_path(digest.algorithm().as_str(), digest.hex())
    }

    /// Stat a blob in the global store
    pub async fn stat(&self, digest: &Digest) -> Result<Descriptor, CoreError> {
        if let Some(cache) = &self.cache
            && let Some(desc) = cache.get(digest).await
        {
            return Ok(desc);
        }
        let info = self
            .driver
            .stat(&Self::data_path(digest))
            .await
            .map_err(|e| CoreError::blob_from_storage(e, digest))?;
        let desc = Descriptor::new(OCTET_STREAM, info.size, digest.clone());
        if let Some(cache) = &self.cache {
            cache.set(&desc).await;
        }
        Ok(desc)
    }

    /// Read a complete blob and verify its digest
    pub async fn get(&self, digest: &Digest) -> Result<Bytes, CoreError> {
        let data = self
            .driver
            .get_content(&Self::data_path(digest))
            .await
            .map_err(|e| CoreError::blob_from_storage(e, digest))?;
        let actual = Digest::from_bytes(digest.algorithm(), &data);
        if actual != *digest {
            return Err(CoreError::DigestInvalid(format!(
                "content at {digest} hashes to {actual}"
            )));
        }
        Ok(data)
    }

    /// Stream a blob from `offset`
    ///
    /// Whole-blob reads are verified as they stream: a trailing digest
    /// mismatch surfaces as a stream error rather than silent bytes. Ranged
    /// reads cannot be verified and are passed through.
    pub async fn open(
        &self,
        digest: &Digest,
        offset: u64,
    ) -> Result<(ByteStream, Descriptor), CoreError> {
        let path = Self::data_path(digest);
        let info = self
            .driver
            .stat(&path)
            .await
            .map_err(|e| CoreError::blob_from_storage(e, digest))?;
        // The cache must never contradict the durable store; a stale size is
        // evicted and replaced by what we just observed.
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(digest).await
                && cached.size != info.size
            {
                cache.evict(digest).await;
            }
            cache
                .set(&Descriptor::new(OCTET_STREAM, info.size, digest.clone()))
                .await;
        }
        let stream = self
            .driver
            .reader(&path, offset)
            .await
            .map_err(|e| CoreError::blob_from_storage(e, digest))?;
        let stream = if offset == 0 {
            verify_stream(stream, digest.clone())
        } else {
            stream
        };
        Ok((stream, Descriptor::new(OCTET_STREAM, info.size, digest.clone())))
    }

    /// Store a complete blob; idempotent by digest
    pub async fn put(&self, media_type: &str, data: Bytes) -> Result<Descriptor, CoreError> {
        let digest = {
            let mut digester = Digester::new(crate::digest::Algorithm::Sha256);
            digester.update(&data);
            digester.finalize()
        };
        let desc = Descriptor::new(media_type, data.len() as u64, digest.clone());
        let path = Self::data_path(&digest);
        match self.driver.stat(&path).await {
            // Existing identical content: replacing it would be a no-op.
            Ok(_) => {}
            Err(StorageError::PathNotFound(_)) => {
                self.driver.put_content(&path, data).await?;
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(cache) = &self.cache {
            cache.set(&desc).await;
        }
        Ok(desc)
    }

    /// Publish an already-spooled upload file as a blob
    pub(crate) async fn adopt(&self, from_path: &str, digest: &Digest) -> Result<(), CoreError> {
        let path = Self::data_path(digest);
        match self.driver.stat(&path).await {
            Ok(_) => {
                // Deduplicated: drop the spooled copy.
                match self.driver.delete(from_path).await {
                    Ok(()) | Err(StorageError::PathNotFound(_)) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Err(StorageError::PathNotFound(_)) => {
                self.driver.rename(from_path, &path).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn redirect_url(
        &self,
        method: &str,
        digest: &Digest,
    ) -> Result<Option<String>, CoreError> {
        Ok(self
            .driver
            .redirect_url(method, &Self::data_path(digest))
            .await?)
    }
}

/// Repository-scoped view of the blob store
#[derive(Clone)]
pub struct LinkedBlobStore {
    store: BlobStore,
    repo: RepositoryName,
    cache: Option<Arc<dyn BlobDescriptorCache>>,
    delete_enabled: bool,
    read_only: bool,
}

impl LinkedBlobStore {
    pub fn new(
        store: BlobStore,
        repo: RepositoryName,
        cache: Option<Arc<dyn BlobDescriptorCache>>,
        delete_enabled: bool,
        read_only: bool,
    ) -> Self {
        Self {
            store,
            repo,
            cache,
            delete_enabled,
            read_only,
        }
    }

    pub fn global(&self) -> &BlobStore {
        &self.store
    }

    fn link_path(&self, digest: &Digest) -> String {
        paths::layer_link_path(
            self.repo.as_str(),
            digest.algorithm().as_str(),
            digest.hex(),
        )
    }

    /// Whether this repository links `digest`
    pub async fn has_link(&self, digest: &Digest) -> Result<bool, CoreError> {
        match self.store.driver.get_content(&self.link_path(digest)).await {
            Ok(content) => Ok(content.as_ref() == digest.to_string().as_bytes()),
            Err(StorageError::PathNotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the repository's link for `digest`
    pub async fn link(&self, descriptor: &Descriptor) -> Result<(), CoreError> {
        let link = descriptor.digest.to_string();
        self.store
            .driver
            .put_content(&self.link_path(&descriptor.digest), Bytes::from(link))
            .await?;
        if let Some(cache) = &self.cache {
            cache.set_repository(&self.repo, descriptor).await;
        }
        debug!("linked {} into {}", descriptor.digest, self.repo);
        Ok(())
    }

    fn check_writable(&self) -> Result<(), CoreError> {
        if self.read_only {
            return Err(CoreError::Unsupported);
        }
        Ok(())
    }
}

#[async_trait]
impl BlobService for LinkedBlobStore {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor, CoreError> {
        if let Some(cache) = &self.cache
            && let Some(desc) = cache.get_repository(&self.repo, digest).await
        {
            return Ok(desc);
        }
        if !self.has_link(digest).await? {
            return Err(CoreError::BlobUnknown(digest.clone()));
        }
        let desc = self.store.stat(digest).await?;
        if let Some(cache) = &self.cache {
            cache.set_repository(&self.repo, &desc).await;
        }
        Ok(desc)
    }

    async fn open(&self, digest: &Digest, offset: u64) -> Result<(ByteStream, Descriptor), CoreError> {
        // Link check first so an unlinked digest is indistinguishable from an
        // absent one.
        self.stat(digest).await?;
        self.store.open(digest, offset).await
    }

    async fn put(&self, media_type: &str, data: Bytes) -> Result<Descriptor, CoreError> {
        self.check_writable()?;
        let desc = self.store.put(media_type, data).await?;
        self.link(&desc).await?;
        Ok(desc)
    }

    async fn mount(&self, from: &RepositoryName, digest: &Digest) -> Result<Descriptor, CoreError> {
        self.check_writable()?;
        let source = LinkedBlobStore::new(
            self.store.clone(),
            from.clone(),
            self.cache.clone(),
            self.delete_enabled,
            self.read_only,
        );
        if !source.has_link(digest).await? {
            return Err(CoreError::BlobUnknown(digest.clone()));
        }
        let desc = self.store.stat(digest).await?;
        self.link(&desc).await?;
        debug!("mounted {} from {} into {}", digest, from, self.repo);
        Ok(desc)
    }

    async fn delete(&self, digest: &Digest) -> Result<(), CoreError> {
        self.check_writable()?;
        if !self.delete_enabled {
            return Err(CoreError::Unsupported);
        }
        if !self.has_link(digest).await? {
            return Err(CoreError::BlobUnknown(digest.clone()));
        }
        // Only the repository's link goes away; the blob file is offline
        // garbage collection's to reclaim.
        self.store.driver.delete(&self.link_path(digest)).await?;
        if let Some(cache) = &self.cache {
            cache.evict_repository(&self.repo, digest).await;
        }
        Ok(())
    }

    async fn redirect_url(
        &self,
        method: &str,
        digest: &Digest,
    ) -> Result<Option<String>, CoreError> {
        self.store.redirect_url(method, digest).await
    }
}

/// Wrap a full-content stream so a trailing digest mismatch surfaces as an
/// error item instead of silently truncated or corrupted bytes.
fn verify_stream(inner: ByteStream, expected: Digest) -> ByteStream {
    struct State {
        inner: ByteStream,
        digester: Option<Digester>,
        expected: Digest,
    }
    let state = State {
        inner,
        digester: Some(Digester::new(expected.algorithm())),
        expected,
    };
    Box::pin(futures::stream::unfold(state, |mut st| async move {
        match st.inner.next().await {
            Some(Ok(chunk)) => {
                if let Some(d) = st.digester.as_mut() {
                    d.update(&chunk);
                }
                Some((Ok(chunk), st))
            }
            Some(Err(e)) => {
                st.digester = None;
                Some((Err(e), st))
            }
            None => match st.digester.take() {
                Some(d) => {
                    let actual = d.finalize();
                    if actual == st.expected {
                        None
                    } else {
                        let err = std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("blob {} hashes to {actual}", st.expected),
                        );
                        Some((Err(StorageError::Io(err)), st))
                    }
                }
                None => None,
            },
        }
    }))
}
