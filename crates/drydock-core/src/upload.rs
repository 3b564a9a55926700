//! Resumable blob uploads
//!
//! One session spools client chunks into `_uploads/<uuid>/data` and keeps a
//! running digest. Appends must arrive at exactly the committed offset;
//! anything else is rejected without moving the session. Commit verifies the
//! client digest, publishes the spooled file into the blob store, and links
//! it into the repository.
//!
//! Session access is exclusive: a second concurrent append/commit (or a
//! second resumer of the same session) fails immediately with
//! `BlobUploadInvalid` instead of queueing. The committed offset is always
//! the durable length of the data file, so a torn write is re-observed on the
//! next operation and the digest state caught up by re-reading the delta.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use drydock_storage::{StorageDriver, StorageError, paths};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};
use uuid::Uuid;

use crate::blob::{BlobStore, LinkedBlobStore, OCTET_STREAM};
use crate::descriptor::Descriptor;
use crate::digest::{Algorithm, Digest, Digester};
use crate::error::CoreError;
use crate::reference::RepositoryName;
use crate::services::{UploadService, UploadSessionInfo};

struct SessionState {
    digester: Digester,
    size: u64,
}

/// Process-wide upload session registry
pub struct UploadManager {
    store: BlobStore,
    sessions: Mutex<HashMap<String, Arc<tokio::sync::Mutex<SessionState>>>>,
}

impl UploadManager {
    pub fn new(store: BlobStore) -> Self {
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn driver(&self) -> &Arc<dyn StorageDriver> {
        self.store.driver()
    }

    async fn create(&self, repo: &RepositoryName) -> Result<UploadSessionInfo, CoreError> {
        let id = Uuid::new_v4().to_string();
        let started_at = Utc::now().to_rfc3339();
        self.driver()
            .put_content(
                &paths::upload_started_at_path(repo.as_str(), &id),
                Bytes::from(started_at),
            )
            .await?;
        self.driver()
            .put_content(
                &paths::upload_uuid_path(repo.as_str(), &id),
                Bytes::from(id.clone()),
            )
            .await?;
        self.sessions.lock().insert(
            id.clone(),
            Arc::new(tokio::sync::Mutex::new(SessionState {
                digester: Digester::new(Algorithm::Sha256),
                size: 0,
            })),
        );
        debug!("started upload {} in {}", id, repo);
        Ok(UploadSessionInfo { id, offset: 0 })
    }

    /// Acquire the session exclusively; a contended session is an invalid
    /// concurrent use, not something to wait on.
    async fn acquire(
        &self,
        repo: &RepositoryName,
        id: &str,
    ) -> Result<OwnedMutexGuard<SessionState>, CoreError> {
        if Uuid::parse_str(id).is_err() {
            return Err(CoreError::BlobUploadInvalid(format!(
                "malformed upload id: {id}"
            )));
        }
        let entry = self.sessions.lock().get(id).cloned();
        let entry = match entry {
            Some(entry) => entry,
            None => self.restore(repo, id).await?,
        };
        let mut guard = entry
            .try_lock_owned()
            .map_err(|_| CoreError::BlobUploadInvalid(format!("upload {id} is busy")))?;
        self.resync(repo, id, &mut guard).await?;
        Ok(guard)
    }

    /// Rebuild a session after a restart from what the driver holds
    async fn restore(
        &self,
        repo: &RepositoryName,
        id: &str,
    ) -> Result<Arc<tokio::sync::Mutex<SessionState>>, CoreError> {
        match self
            .driver()
            .get_content(&paths::upload_started_at_path(repo.as_str(), id))
            .await
        {
            Ok(_) => {}
            Err(StorageError::PathNotFound(_)) => {
                return Err(CoreError::BlobUploadUnknown(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        let entry = Arc::new(tokio::sync::Mutex::new(SessionState {
            digester: Digester::new(Algorithm::Sha256),
            size: 0,
        }));
        // First resumer wins the map slot; a racing resumer reuses it and
        // then loses the try_lock.
        Ok(self
            .sessions
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| entry.clone())
            .clone())
    }

    /// Align the in-memory state with the durable data file, catching the
    /// digest up over any bytes it has not seen.
    async fn resync(
        &self,
        repo: &RepositoryName,
        id: &str,
        state: &mut SessionState,
    ) -> Result<(), CoreError> {
        let data_path = paths::upload_data_path(repo.as_str(), id);
        let durable = match self.driver().stat(&data_path).await {
            Ok(info) => info.size,
            Err(StorageError::PathNotFound(_)) => 0,
            Err(e) => return Err(e.into()),
        };
        if state.digester.offset() > durable {
            // The file shrank under us (external interference); start over.
            state.digester = Digester::new(state.digester.algorithm());
        }
        if state.digester.offset() < durable {
            let mut stream = self
                .driver()
                .reader(&data_path, state.digester.offset())
                .await?;
            while let Some(chunk) = stream.next().await {
                state.digester.update(&chunk?);
            }
        }
        state.size = durable;
        Ok(())
    }

    async fn append(
        &self,
        repo: &RepositoryName,
        id: &str,
        offset: Option<u64>,
        data: Bytes,
    ) -> Result<u64, CoreError> {
        let mut state = self.acquire(repo, id).await?;
        self.append_locked(repo, id, &mut state, offset, data).await?;
        Ok(state.size)
    }

    async fn append_locked(
        &self,
        repo: &RepositoryName,
        id: &str,
        state: &mut SessionState,
        offset: Option<u64>,
        data: Bytes,
    ) -> Result<(), CoreError> {
        if let Some(offset) = offset
            && offset != state.size
        {
            return Err(CoreError::RangeInvalid {
                expected: state.size,
                provided: offset,
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        let data_path = paths::upload_data_path(repo.as_str(), id);
        let mut writer = self.driver().writer(&data_path, true).await?;
        if writer.size() != state.size {
            // Stale tail from an earlier failure already re-observed by
            // resync; reaching here means the file moved between resync and
            // now, which only a concurrent writer can cause.
            return Err(CoreError::BlobUploadInvalid(format!(
                "upload {id} changed size concurrently"
            )));
        }
        // Hash into a checkpoint copy so a failed write leaves the session
        // digest at the last durable offset.
        let mut digester = state.digester.clone();
        digester.update(&data);
        writer.write(data.clone()).await?;
        writer.commit().await?;

        state.digester = digester;
        state.size += data.len() as u64;
        // Checkpoint marker for cross-process resumption; the chunk itself is
        // already durable, so a failed marker only costs a re-hash later.
        if let Err(e) = self
            .driver()
            .put_content(
                &paths::upload_hash_state_path(
                    repo.as_str(),
                    id,
                    state.digester.algorithm().as_str(),
                    state.size,
                ),
                Bytes::new(),
            )
            .await
        {
            tracing::warn!("failed to persist hash state for upload {}: {}", id, e);
        }
        Ok(())
    }

    async fn commit(
        &self,
        linked: &LinkedBlobStore,
        repo: &RepositoryName,
        id: &str,
        expected: &Digest,
        final_chunk: Bytes,
    ) -> Result<Descriptor, CoreError> {
        let mut state = self.acquire(repo, id).await?;
        if !final_chunk.is_empty() {
            self.append_locked(repo, id, &mut state, None, final_chunk)
                .await?;
        }

        let data_path = paths::upload_data_path(repo.as_str(), id);
        let actual = if expected.algorithm() == state.digester.algorithm() {
            state.digester.clone().finalize()
        } else {
            // Client declared a different algorithm; re-hash the spooled file.
            self.rehash(&data_path, expected.algorithm(), state.size).await?
        };
        if actual != *expected {
            return Err(CoreError::DigestInvalid(format!(
                "upload content hashes to {actual}, client declared {expected}"
            )));
        }

        if state.size == 0 {
            // Zero-byte blob: nothing was ever spooled, so materialize the
            // empty data file before publication.
            self.driver().put_content(&data_path, Bytes::new()).await?;
        }
        self.store.adopt(&data_path, expected).await?;
        let desc = Descriptor::new(OCTET_STREAM, state.size, expected.clone());
        linked.link(&desc).await?;
        self.driver()
            .delete(&paths::upload_path(repo.as_str(), id))
            .await
            .ok();
        self.sessions.lock().remove(id);
        info!("upload {} committed as {} in {}", id, expected, repo);
        Ok(desc)
    }

    async fn rehash(
        &self,
        path: &str,
        algorithm: Algorithm,
        size: u64,
    ) -> Result<Digest, CoreError> {
        let mut digester = Digester::new(algorithm);
        if size > 0 {
            let mut stream = self.driver().reader(path, 0).await?;
            while let Some(chunk) = stream.next().await {
                digester.update(&chunk?);
            }
        }
        Ok(digester.finalize())
    }

    async fn cancel(&self, repo: &RepositoryName, id: &str) -> Result<(), CoreError> {
        let _state = self.acquire(repo, id).await?;
        match self
            .driver()
            .delete(&paths::upload_path(repo.as_str(), id))
            .await
        {
            Ok(()) | Err(StorageError::PathNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.sessions.lock().remove(id);
        debug!("upload {} cancelled in {}", id, repo);
        Ok(())
    }

    async fn status(&self, repo: &RepositoryName, id: &str) -> Result<u64, CoreError> {
        let state = self.acquire(repo, id).await?;
        Ok(state.size)
    }
}

/// [`UploadService`] for one repository
#[derive(Clone)]
pub struct RepositoryUploads {
    manager: Arc<UploadManager>,
    linked: LinkedBlobStore,
    repo: RepositoryName,
    read_only: bool,
}

impl RepositoryUploads {
    pub fn new(
        manager: Arc<UploadManager>,
        linked: LinkedBlobStore,
        repo: RepositoryName,
        read_only: bool,
    ) -> Self {
        Self {
            manager,
            linked,
            repo,
            read_only,
        }
    }

    fn check_writable(&self) -> Result<(), CoreError> {
        if self.read_only {
            return Err(CoreError::Unsupported);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl UploadService for RepositoryUploads {
    async fn create(&self) -> Result<UploadSessionInfo, CoreError> {
        self.check_writable()?;
        self.manager.create(&self.repo).await
    }

    async fn status(&self, id: &str) -> Result<u64, CoreError> {
        self.manager.status(&self.repo, id).await
    }

    async fn append(&self, id: &str, offset: Option<u64>, data: Bytes) -> Result<u64, CoreError> {
        self.check_writable()?;
        self.manager.append(&self.repo, id, offset, data).await
    }

    async fn commit(
        &self,
        id: &str,
        digest: &Digest,
        final_chunk: Bytes,
    ) -> Result<Descriptor, CoreError> {
        self.check_writable()?;
        self.manager
            .commit(&self.linked, &self.repo, id, digest, final_chunk)
            .await
    }

    async fn cancel(&self, id: &str) -> Result<(), CoreError> {
        self.manager.cancel(&self.repo, id).await
    }
}

/// Parse the text of an upload `startedat` file
pub(crate) fn parse_started_at(raw: &[u8]) -> Option<DateTime<Utc>> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::BlobService;
    use drydock_storage::InMemoryDriver;

    fn setup(repo: &str) -> (RepositoryUploads, LinkedBlobStore) {
        let driver: Arc<dyn StorageDriver> = Arc::new(InMemoryDriver::new());
        let store = BlobStore::new(driver, None);
        let repo: RepositoryName = repo.parse().unwrap();
        let linked = LinkedBlobStore::new(store.clone(), repo.clone(), None, true, false);
        let manager = Arc::new(UploadManager::new(store));
        (
            RepositoryUploads::new(manager, linked.clone(), repo, false),
            linked,
        )
    }

    #[tokio::test]
    async fn single_chunk_upload_commits_and_links() {
        let (uploads, linked) = setup("alice/app");
        let session = uploads.create().await.unwrap();
        assert_eq!(session.offset, 0);

        let digest = Digest::from_bytes(Algorithm::Sha256, b"");
        let desc = uploads.commit(&session.id, &digest, Bytes::new()).await.unwrap();
        assert_eq!(desc.size, 0);
        assert_eq!(linked.stat(&digest).await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn chunked_upload_accumulates_offsets() {
        let (uploads, linked) = setup("alice/app");
        let session = uploads.create().await.unwrap();

        let n = uploads
            .append(&session.id, Some(0), Bytes::from_static(b"hello "))
            .await
            .unwrap();
        assert_eq!(n, 6);
        let n = uploads
            .append(&session.id, Some(6), Bytes::from_static(b"world"))
            .await
            .unwrap();
        assert_eq!(n, 11);

        let digest = Digest::from_bytes(Algorithm::Sha256, b"hello world");
        uploads.commit(&session.id, &digest, Bytes::new()).await.unwrap();
        let (stream, _) = linked.open(&digest, 0).await.unwrap();
        let mut collected = Vec::new();
        let mut stream = stream;
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"hello world");
    }

    #[tokio::test]
    async fn bad_offset_is_rejected_without_moving_the_session() {
        let (uploads, _) = setup("alice/app");
        let session = uploads.create().await.unwrap();
        uploads
            .append(&session.id, Some(0), Bytes::from_static(&[0u8; 100]))
            .await
            .unwrap();

        let err = uploads
            .append(&session.id, Some(50), Bytes::from_static(&[0u8; 100]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::RangeInvalid {
                expected: 100,
                provided: 50
            }
        ));
        assert_eq!(uploads.status(&session.id).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn digest_mismatch_keeps_session_open() {
        let (uploads, _) = setup("alice/app");
        let session = uploads.create().await.unwrap();
        uploads
            .append(&session.id, Some(0), Bytes::from_static(b"payload"))
            .await
            .unwrap();

        let wrong = Digest::from_bytes(Algorithm::Sha256, b"other");
        assert!(matches!(
            uploads.commit(&session.id, &wrong, Bytes::new()).await,
            Err(CoreError::DigestInvalid(_))
        ));
        // Still open at the same offset; the right digest succeeds.
        assert_eq!(uploads.status(&session.id).await.unwrap(), 7);
        let right = Digest::from_bytes(Algorithm::Sha256, b"payload");
        uploads.commit(&session.id, &right, Bytes::new()).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_purges_session_data() {
        let (uploads, _) = setup("alice/app");
        let session = uploads.create().await.unwrap();
        uploads
            .append(&session.id, None, Bytes::from_static(b"junk"))
            .await
            .unwrap();
        uploads.cancel(&session.id).await.unwrap();
        assert!(matches!(
            uploads.status(&session.id).await,
            Err(CoreError::BlobUploadUnknown(_))
        ));
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids() {
        let (uploads, _) = setup("alice/app");
        assert!(matches!(
            uploads.status("550e8400-e29b-41d4-a716-446655440000").await,
            Err(CoreError::BlobUploadUnknown(_))
        ));
        assert!(matches!(
            uploads.status("../../etc/passwd").await,
            Err(CoreError::BlobUploadInvalid(_))
        ));
    }

    #[tokio::test]
    async fn session_survives_manager_restart() {
        let driver: Arc<dyn StorageDriver> = Arc::new(InMemoryDriver::new());
        let store = BlobStore::new(driver.clone(), None);
        let repo: RepositoryName = "alice/app".parse().unwrap();
        let linked = LinkedBlobStore::new(store.clone(), repo.clone(), None, true, false);

        let first = Arc::new(UploadManager::new(store.clone()));
        let uploads = RepositoryUploads::new(first, linked.clone(), repo.clone(), false);
        let session = uploads.create().await.unwrap();
        uploads
            .append(&session.id, Some(0), Bytes::from_static(b"persisted "))
            .await
            .unwrap();

        // A new manager (fresh process) picks the session up from the driver.
        let second = Arc::new(UploadManager::new(store));
        let uploads = RepositoryUploads::new(second, linked.clone(), repo, false);
        assert_eq!(uploads.status(&session.id).await.unwrap(), 10);
        uploads
            .append(&session.id, Some(10), Bytes::from_static(b"state"))
            .await
            .unwrap();
        let digest = Digest::from_bytes(Algorithm::Sha256, b"persisted state");
        uploads.commit(&session.id, &digest, Bytes::new()).await.unwrap();
        assert_eq!(linked.stat(&digest).await.unwrap().size, 15);
    }
}
