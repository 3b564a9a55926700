//! Manifest persistence
//!
//! Manifests are blobs: the canonical bytes live in the content-addressed
//! store and a revision link under `_manifests/revisions` ties them into the
//! repository. Tags are a separate link layer on top.

use async_trait::async_trait;
use bytes::Bytes;
use drydock_storage::{StorageDriver, StorageError, paths};
use std::sync::Arc;
use tracing::{debug, info};

use super::{ManifestPolicy, ParsedManifest, parse};
use crate::blob::LinkedBlobStore;
use crate::digest::Digest;
use crate::error::CoreError;
use crate::reference::{ManifestRef, RepositoryName, Tag};
use crate::services::{ManifestService, StoredManifest};
use crate::tags::TagStore;

/// Manifest service for one repository
#[derive(Clone)]
pub struct ManifestStore {
    blobs: LinkedBlobStore,
    tags: TagStore,
    repo: RepositoryName,
    policy: Arc<ManifestPolicy>,
    delete_enabled: bool,
    read_only: bool,
    verify_links: bool,
}

impl ManifestStore {
    pub fn new(
        blobs: LinkedBlobStore,
        tags: TagStore,
        repo: RepositoryName,
        policy: Arc<ManifestPolicy>,
        delete_enabled: bool,
        read_only: bool,
    ) -> Self {
        Self {
            blobs,
            tags,
            repo,
            policy,
            delete_enabled,
            read_only,
            verify_links: true,
        }
    }

    /// The pull-through controller materializes referenced blobs on demand,
    /// so it stores upstream manifests without requiring local links.
    pub(crate) fn with_link_verification(mut self, verify_links: bool) -> Self {
        self.verify_links = verify_links;
        self
    }

    fn driver(&self) -> &Arc<dyn StorageDriver> {
        self.blobs.global().driver()
    }

    fn revision_link_path(&self, digest: &Digest) -> String {
        paths::manifest_revision_link_path(
            self.repo.as_str(),
            digest.algorithm().as_str(),
            digest.hex(),
        )
    }

    async fn revision_exists(&self, digest: &Digest) -> Result<bool, CoreError> {
        match self.driver().get_content(&self.revision_link_path(digest)).await {
            Ok(_) => Ok(true),
            Err(StorageError::PathNotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every blob and sub-manifest a manifest references must already be in
    /// the repository before the manifest can be accepted.
    async fn verify(&self, manifest: &ParsedManifest) -> Result<(), CoreError> {
        let mut missing = Vec::new();
        match manifest {
            ParsedManifest::Image { config, layers, .. } => {
                self.policy.check_urls(std::slice::from_ref(config))?;
                self.policy.check_urls(layers)?;
                if !self.verify_links {
                    return Ok(());
                }
                if !self.blobs.has_link(&config.digest).await? {
                    missing.push(config.digest.clone());
                }
                for layer in layers {
                    // Layers with external URLs may legitimately be absent.
                    if layer.urls.is_empty() && !self.blobs.has_link(&layer.digest).await? {
                        missing.push(layer.digest.clone());
                    }
                }
            }
            ParsedManifest::Index { manifests, .. } => {
                if !self.verify_links {
                    return Ok(());
                }
                for entry in manifests {
                    if self.policy.platform_required(entry.platform.as_ref())
                        && !self.revision_exists(&entry.descriptor.digest).await?
                    {
                        missing.push(entry.descriptor.digest.clone());
                    }
                }
            }
            ParsedManifest::Schema1 { .. } => {}
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CoreError::ManifestBlobsUnknown(missing))
        }
    }
}

#[async_trait]
impl ManifestService for ManifestStore {
    async fn get(&self, reference: &ManifestRef) -> Result<StoredManifest, CoreError> {
        let digest = match reference {
            ManifestRef::Tag(tag) => self.tags.resolve(tag).await?,
            ManifestRef::Digest(digest) => digest.clone(),
        };
        if !self.revision_exists(&digest).await? {
            return Err(CoreError::ManifestUnknown {
                reference: reference.to_string(),
            });
        }
        // The global store re-hashes the bytes; corruption is a hard error,
        // never silently served.
        let bytes = match self.blobs.global().get(&digest).await {
            Ok(bytes) => bytes,
            Err(CoreError::BlobUnknown(_)) => {
                return Err(CoreError::ManifestUnknown {
                    reference: reference.to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        let media_type = parse(&bytes, None)?.media_type().to_string();
        Ok(StoredManifest {
            bytes,
            media_type,
            digest,
        })
    }

    async fn put(
        &self,
        payload: Bytes,
        media_type: Option<&str>,
        tag: Option<&Tag>,
    ) -> Result<Digest, CoreError> {
        if self.read_only {
            return Err(CoreError::Unsupported);
        }
        let manifest = parse(&payload, media_type)?;
        if matches!(manifest, ParsedManifest::Schema1 { .. }) {
            return Err(CoreError::ManifestInvalid(
                "schema 1 manifests are read-only in this registry".to_string(),
            ));
        }
        self.verify(&manifest).await?;

        let descriptor = self
            .blobs
            .global()
            .put(manifest.media_type(), payload)
            .await?;
        let digest = descriptor.digest.clone();
        self.driver()
            .put_content(
                &self.revision_link_path(&digest),
                Bytes::from(digest.to_string()),
            )
            .await?;
        if let Some(tag) = tag {
            self.tags.tag(tag, &digest).await?;
        }
        info!("stored manifest {} in {}", digest, self.repo);
        Ok(digest)
    }

    async fn delete(&self, reference: &ManifestRef) -> Result<(), CoreError> {
        if self.read_only || !self.delete_enabled {
            return Err(CoreError::Unsupported);
        }
        match reference {
            ManifestRef::Digest(digest) => {
                if !self.revision_exists(digest).await? {
                    return Err(CoreError::ManifestUnknown {
                        reference: reference.to_string(),
                    });
                }
                self.driver().delete(&self.revision_link_path(digest)).await?;
                debug!("deleted manifest revision {} from {}", digest, self.repo);
                Ok(())
            }
            ManifestRef::Tag(tag) => self.tags.untag(tag).await,
        }
    }
}
