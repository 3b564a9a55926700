//! Pull-through cache controller
//!
//! Wraps the local namespace so that missing blobs and manifests are fetched
//! from an upstream registry, streamed to the caller while being spooled
//! locally, and committed for future requests. Writes through the proxy are
//! `Unsupported`.
//!
//! At most one upstream fetch runs per `(repository, reference)`: late
//! callers wait on the same flight and are then served from the local copy
//! the first fetch committed. A partial transfer commits nothing.

use async_trait::async_trait;
use bytes::Bytes;
use drydock_proxy::RemoteClient;
use drydock_storage::{ByteStream, StorageDriver, StorageError, paths};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blob::{LinkedBlobStore, OCTET_STREAM};
use crate::descriptor::Descriptor;
use crate::digest::{Digest, Digester};
use crate::error::CoreError;
use crate::manifest::ManifestStore;
use crate::reference::{ManifestRef, RepositoryName, Tag};
use crate::registry::Registry;
use crate::scheduler::ProxyScheduler;
use crate::services::{
    BlobService, CatalogPage, ManifestService, Namespace, Repository, StoredManifest,
    UploadService, UploadSessionInfo,
};

type FlightMap = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Shared pieces every proxied service carries
#[derive(Clone)]
struct ProxyShared {
    remote: Arc<RemoteClient>,
    scheduler: Arc<ProxyScheduler>,
    ttl: Option<Duration>,
    flights: FlightMap,
}

impl ProxyShared {
    /// One lock per in-flight `(repository, reference)` key. Entries whose
    /// flight finished are pruned opportunistically.
    fn flight(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut flights = self.flights.lock();
        flights.retain(|_, lock| Arc::strong_count(lock) > 1);
        flights
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn schedule_blob(&self, repo: &RepositoryName, digest: &Digest) {
        if let Some(ttl) = self.ttl {
            self.scheduler.schedule_blob(repo, digest, ttl).await;
        }
    }

    async fn schedule_manifest(&self, repo: &RepositoryName, digest: &Digest) {
        if let Some(ttl) = self.ttl {
            self.scheduler.schedule_manifest(repo, digest, ttl).await;
        }
    }
}

/// Namespace decorator turning the registry into a read-through proxy
pub struct ProxyRegistry {
    local: Registry,
    shared: ProxyShared,
}

impl ProxyRegistry {
    pub fn new(
        local: Registry,
        remote: Arc<RemoteClient>,
        scheduler: Arc<ProxyScheduler>,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            local,
            shared: ProxyShared {
                remote,
                scheduler,
                ttl,
                flights: Arc::new(Mutex::new(HashMap::new())),
            },
        }
    }
}

#[async_trait]
impl Namespace for ProxyRegistry {
    fn repository(&self, name: &str) -> Result<Repository, CoreError> {
        let repo: RepositoryName = name.parse()?;
        let blobs = ProxyBlobService {
            shared: self.shared.clone(),
            local: self.local.linked_blobs(&repo),
            repo: repo.clone(),
        };
        let manifests = ProxyManifestService {
            shared: self.shared.clone(),
            local: self.local.manifest_store(&repo, false),
            tags: self.local.tag_store(&repo),
            repo: repo.clone(),
        };
        Ok(Repository {
            blobs: Arc::new(blobs),
            manifests: Arc::new(manifests),
            tags: Arc::new(self.local.tag_store(&repo)),
            uploads: Arc::new(DisabledUploads),
            name: repo,
        })
    }

    async fn repositories(&self, last: Option<&str>, n: usize) -> Result<CatalogPage, CoreError> {
        self.local.repositories(last, n).await
    }
}

struct ProxyBlobService {
    shared: ProxyShared,
    local: LinkedBlobStore,
    repo: RepositoryName,
}

impl ProxyBlobService {
    fn driver(&self) -> Arc<dyn StorageDriver> {
        self.local.global().driver().clone()
    }

    /// Fetch a blob from upstream, spooling it locally while streaming the
    /// bytes out through a bounded channel. Commit happens only after the
    /// full transfer verified against the digest. The flight guard travels
    /// into the spool task so the key stays locked until commit or abort.
    async fn fetch_teed(
        &self,
        digest: &Digest,
        guard: tokio::sync::OwnedMutexGuard<()>,
    ) -> Result<(ByteStream, Descriptor), CoreError> {
        let (upstream, size) = self
            .shared
            .remote
            .get_blob(self.repo.as_str(), &digest.to_string())
            .await
            .map_err(map_remote(digest))?;

        let session = Uuid::new_v4().to_string();
        let data_path = paths::upload_data_path(self.repo.as_str(), &session);
        let driver = self.driver();
        // A startedat file keeps the purger honest about this spool's age.
        driver
            .put_content(
                &paths::upload_started_at_path(self.repo.as_str(), &session),
                Bytes::from(chrono::Utc::now().to_rfc3339()),
            )
            .await?;
        let writer = driver.writer(&data_path, false).await?;

        let (tx, rx) = mpsc::channel::<Result<Bytes, StorageError>>(8);
        let local = self.local.clone();
        let shared = self.shared.clone();
        let repo = self.repo.clone();
        let expected = digest.clone();
        let session_dir = paths::upload_path(self.repo.as_str(), &session);

        tokio::spawn(async move {
            let _flight = guard;
            let mut upstream = upstream;
            let mut writer = writer;
            let mut digester = Digester::new(expected.algorithm());
            let mut failed = false;

            while let Some(chunk) = upstream.next().await {
                match chunk {
                    Ok(chunk) => {
                        digester.update(&chunk);
                        if let Err(e) = writer.write(chunk.clone()).await {
                            warn!("local spool write failed for {}: {}", expected, e);
                            let _ = tx.send(Err(e)).await;
                            failed = true;
                            break;
                        }
                        // A disconnected client does not abort the cache fill.
                        let _ = tx.send(Ok(chunk)).await;
                    }
                    Err(e) => {
                        warn!("upstream stream failed for {}: {}", expected, e);
                        let _ = tx
                            .send(Err(StorageError::Io(std::io::Error::other(e.to_string()))))
                            .await;
                        failed = true;
                        break;
                    }
                }
            }

            let actual = digester.finalize();
            if failed || actual != expected {
                if !failed {
                    warn!("upstream blob {} hashed to {}", expected, actual);
                }
                let _ = writer.cancel().await;
                let _ = local.global().driver().delete(&session_dir).await;
                return;
            }
            if let Err(e) = writer.commit().await {
                warn!("failed to commit spooled blob {}: {}", expected, e);
                let _ = local.global().driver().delete(&session_dir).await;
                return;
            }
            let size = match local.global().driver().stat(&data_path).await {
                Ok(info) => info.size,
                Err(e) => {
                    warn!("failed to stat spooled blob {}: {}", expected, e);
                    return;
                }
            };
            let publish = async {
                local.global().adopt(&data_path, &expected).await?;
                local
                    .link(&Descriptor::new(OCTET_STREAM, size, expected.clone()))
                    .await
            };
            match publish.await {
                Ok(()) => {
                    info!("cached upstream blob {} into {}", expected, repo);
                    shared.schedule_blob(&repo, &expected).await;
                }
                Err(e) => warn!("failed to publish spooled blob {}: {}", expected, e),
            }
            let _ = local.global().driver().delete(&session_dir).await;
        });

        let stream: ByteStream =
            Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx));
        Ok((stream, Descriptor::new(OCTET_STREAM, size, digest.clone())))
    }

    /// Buffer-free full fetch used before serving ranged reads locally
    async fn fetch_committed(
        &self,
        digest: &Digest,
        guard: tokio::sync::OwnedMutexGuard<()>,
    ) -> Result<(), CoreError> {
        let (mut stream, _) = self.fetch_teed(digest, guard).await?;
        while let Some(chunk) = stream.next().await {
            chunk?;
        }
        // The spool task commits asynchronously after the last chunk; poll
        // briefly for the link to appear.
        for _ in 0..50 {
            if self.local.has_link(digest).await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(CoreError::BlobUnknown(digest.clone()))
    }
}

#[async_trait]
impl BlobService for ProxyBlobService {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor, CoreError> {
        match self.local.stat(digest).await {
            Ok(desc) => return Ok(desc),
            Err(CoreError::BlobUnknown(_)) => {}
            Err(e) => return Err(e),
        }
        match self
            .shared
            .remote
            .head_blob(self.repo.as_str(), &digest.to_string())
            .await?
        {
            Some(size) => Ok(Descriptor::new(OCTET_STREAM, size, digest.clone())),
            None => Err(CoreError::BlobUnknown(digest.clone())),
        }
    }

    async fn open(&self, digest: &Digest, offset: u64) -> Result<(ByteStream, Descriptor), CoreError> {
        match self.local.open(digest, offset).await {
            Ok(found) => return Ok(found),
            Err(CoreError::BlobUnknown(_)) => {}
            Err(e) => return Err(e),
        }

        let flight = self.shared.flight(&format!("{}@{}", self.repo, digest));
        let guard = flight.lock_owned().await;

        // A finished flight may have materialized the blob while we waited.
        match self.local.open(digest, offset).await {
            Ok(found) => return Ok(found),
            Err(CoreError::BlobUnknown(_)) => {}
            Err(e) => return Err(e),
        }

        if offset == 0 {
            self.fetch_teed(digest, guard).await
        } else {
            // Ranged miss: fill the cache first, then serve the range.
            self.fetch_committed(digest, guard).await?;
            self.local.open(digest, offset).await
        }
    }

    async fn put(&self, _media_type: &str, _data: Bytes) -> Result<Descriptor, CoreError> {
        Err(CoreError::Unsupported)
    }

    async fn mount(&self, _from: &RepositoryName, _digest: &Digest) -> Result<Descriptor, CoreError> {
        Err(CoreError::Unsupported)
    }

    async fn delete(&self, _digest: &Digest) -> Result<(), CoreError> {
        Err(CoreError::Unsupported)
    }

    async fn redirect_url(
        &self,
        _method: &str,
        _digest: &Digest,
    ) -> Result<Option<String>, CoreError> {
        // Proxied blobs are always served through the registry.
        Ok(None)
    }
}

struct ProxyManifestService {
    shared: ProxyShared,
    local: ManifestStore,
    tags: crate::tags::TagStore,
    repo: RepositoryName,
}

impl ProxyManifestService {
    /// Fetch by reference from upstream, store locally, and tag when asked.
    async fn fetch_and_store(
        &self,
        reference: &str,
        tag: Option<&Tag>,
        expected: Option<&Digest>,
    ) -> Result<StoredManifest, CoreError> {
        let (bytes, content_type, _) = self
            .shared
            .remote
            .get_manifest(self.repo.as_str(), reference)
            .await
            .map_err(|e| match e {
                drydock_proxy::ProxyError::NotFound(_) => CoreError::ManifestUnknown {
                    reference: reference.to_string(),
                },
                other => CoreError::Upstream(other),
            })?;

        let digest = self
            .local
            .put(bytes.clone(), Some(&content_type), tag)
            .await?;
        if let Some(expected) = expected
            && digest != *expected
        {
            return Err(CoreError::DigestInvalid(format!(
                "upstream manifest for {reference} hashed to {digest}"
            )));
        }
        self.shared.schedule_manifest(&self.repo, &digest).await;
        debug!("cached upstream manifest {}:{} as {}", self.repo, reference, digest);
        Ok(StoredManifest {
            bytes,
            media_type: content_type,
            digest,
        })
    }

    async fn get_by_digest(&self, digest: &Digest) -> Result<StoredManifest, CoreError> {
        match self.local.get(&ManifestRef::Digest(digest.clone())).await {
            Ok(found) => return Ok(found),
            Err(CoreError::ManifestUnknown { .. }) => {}
            Err(e) => return Err(e),
        }
        let flight = self.shared.flight(&format!("{}@{}", self.repo, digest));
        let _guard = flight.lock().await;
        match self.local.get(&ManifestRef::Digest(digest.clone())).await {
            Ok(found) => return Ok(found),
            Err(CoreError::ManifestUnknown { .. }) => {}
            Err(e) => return Err(e),
        }
        self.fetch_and_store(&digest.to_string(), None, Some(digest))
            .await
    }

    async fn get_by_tag(&self, tag: &Tag) -> Result<StoredManifest, CoreError> {
        // Tags are mutable: resolve upstream on every request so a moved tag
        // is noticed immediately.
        let upstream = self
            .shared
            .remote
            .head_manifest(self.repo.as_str(), tag.as_str())
            .await;

        match upstream {
            Ok(Some((_, Some(digest_header), _))) => {
                let digest: Digest = digest_header.parse()?;
                // Serve the local revision when we already hold what the
                // upstream tag points at, keeping the tag link current.
                match self.local.get(&ManifestRef::Digest(digest.clone())).await {
                    Ok(found) => {
                        self.tags.tag(tag, &digest).await?;
                        return Ok(found);
                    }
                    Err(CoreError::ManifestUnknown { .. }) => {}
                    Err(e) => return Err(e),
                }
                let flight = self.shared.flight(&format!("{}@{}", self.repo, tag));
                let _guard = flight.lock().await;
                self.fetch_and_store(tag.as_str(), Some(tag), Some(&digest))
                    .await
            }
            Ok(Some((_, None, _))) => {
                let flight = self.shared.flight(&format!("{}@{}", self.repo, tag));
                let _guard = flight.lock().await;
                self.fetch_and_store(tag.as_str(), Some(tag), None).await
            }
            Ok(None) => Err(CoreError::ManifestUnknown {
                reference: tag.to_string(),
            }),
            Err(e) => {
                // Upstream unreachable: serve what we have rather than
                // nothing.
                warn!("upstream tag resolution failed for {}:{}: {}", self.repo, tag, e);
                match self.local.get(&ManifestRef::Tag(tag.clone())).await {
                    Ok(found) => Ok(found),
                    Err(CoreError::ManifestUnknown { .. }) => Err(CoreError::Upstream(e)),
                    Err(local_err) => Err(local_err),
                }
            }
        }
    }
}

#[async_trait]
impl ManifestService for ProxyManifestService {
    async fn get(&self, reference: &ManifestRef) -> Result<StoredManifest, CoreError> {
        match reference {
            ManifestRef::Digest(digest) => self.get_by_digest(digest).await,
            ManifestRef::Tag(tag) => self.get_by_tag(tag).await,
        }
    }

    async fn put(
        &self,
        _payload: Bytes,
        _media_type: Option<&str>,
        _tag: Option<&Tag>,
    ) -> Result<Digest, CoreError> {
        Err(CoreError::Unsupported)
    }

    async fn delete(&self, _reference: &ManifestRef) -> Result<(), CoreError> {
        Err(CoreError::Unsupported)
    }
}

/// Upload surface of a pull-through registry: everything is `Unsupported`,
/// including digest resumption.
struct DisabledUploads;

#[async_trait]
impl UploadService for DisabledUploads {
    async fn create(&self) -> Result<UploadSessionInfo, CoreError> {
        Err(CoreError::Unsupported)
    }

    async fn status(&self, _id: &str) -> Result<u64, CoreError> {
        Err(CoreError::Unsupported)
    }

    async fn append(&self, _id: &str, _offset: Option<u64>, _data: Bytes) -> Result<u64, CoreError> {
        Err(CoreError::Unsupported)
    }

    async fn commit(
        &self,
        _id: &str,
        _digest: &Digest,
        _final_chunk: Bytes,
    ) -> Result<Descriptor, CoreError> {
        Err(CoreError::Unsupported)
    }

    async fn cancel(&self, _id: &str) -> Result<(), CoreError> {
        Err(CoreError::Unsupported)
    }
}

fn map_remote(digest: &Digest) -> impl Fn(drydock_proxy::ProxyError) -> CoreError + '_ {
    move |e| match e {
        drydock_proxy::ProxyError::NotFound(_) => CoreError::BlobUnknown(digest.clone()),
        other => CoreError::Upstream(other),
    }
}
