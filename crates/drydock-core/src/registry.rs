//! Registry namespace
//!
//! [`Registry`] is the local, storage-backed namespace: a factory handing out
//! per-repository handles that share one driver, one descriptor cache, one
//! upload manager, and one validation policy. Handle construction is pure;
//! all I/O happens behind the service traits.

use async_trait::async_trait;
use drydock_storage::{StorageDriver, StorageError, paths};
use std::sync::Arc;

use crate::blob::{BlobStore, LinkedBlobStore};
use crate::cache::BlobDescriptorCache;
use crate::error::CoreError;
use crate::manifest::{ManifestPolicy, ManifestStore};
use crate::reference::RepositoryName;
use crate::services::{CatalogPage, Namespace, Repository};
use crate::tags::TagStore;
use crate::upload::{RepositoryUploads, UploadManager};

/// Behavior switches shared by every repository handle
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub delete_enabled: bool,
    /// Reject every write with `Unsupported` while still serving reads
    pub read_only: bool,
    /// Bound on concurrent tag link reads during reverse lookup; 0 = unbounded
    pub tag_concurrency_limit: usize,
}

/// The local registry namespace
pub struct Registry {
    driver: Arc<dyn StorageDriver>,
    store: BlobStore,
    cache: Option<Arc<dyn BlobDescriptorCache>>,
    uploads: Arc<UploadManager>,
    policy: Arc<ManifestPolicy>,
    config: RegistryConfig,
}

impl Registry {
    pub fn new(
        driver: Arc<dyn StorageDriver>,
        cache: Option<Arc<dyn BlobDescriptorCache>>,
        policy: Arc<ManifestPolicy>,
        config: RegistryConfig,
    ) -> Self {
        let store = BlobStore::new(driver.clone(), cache.clone());
        let uploads = Arc::new(UploadManager::new(store.clone()));
        Self {
            driver,
            store,
            cache,
            uploads,
            policy,
            config,
        }
    }

    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    pub(crate) fn linked_blobs(&self, repo: &RepositoryName) -> LinkedBlobStore {
        LinkedBlobStore::new(
            self.store.clone(),
            repo.clone(),
            self.cache.clone(),
            self.config.delete_enabled,
            self.config.read_only,
        )
    }

    pub(crate) fn tag_store(&self, repo: &RepositoryName) -> TagStore {
        TagStore::new(
            self.driver.clone(),
            repo.clone(),
            self.config.tag_concurrency_limit,
        )
    }

    pub(crate) fn manifest_store(
        &self,
        repo: &RepositoryName,
        verify_links: bool,
    ) -> ManifestStore {
        ManifestStore::new(
            self.linked_blobs(repo),
            self.tag_store(repo),
            repo.clone(),
            self.policy.clone(),
            self.config.delete_enabled,
            self.config.read_only,
        )
        .with_link_verification(verify_links)
    }

    pub(crate) fn repository_uploads(&self, repo: &RepositoryName) -> RepositoryUploads {
        RepositoryUploads::new(
            self.uploads.clone(),
            self.linked_blobs(repo),
            repo.clone(),
            self.config.read_only,
        )
    }
}

#[async_trait]
impl Namespace for Registry {
    fn repository(&self, name: &str) -> Result<Repository, CoreError> {
        let repo: RepositoryName = name.parse()?;
        Ok(Repository {
            blobs: Arc::new(self.linked_blobs(&repo)),
            manifests: Arc::new(self.manifest_store(&repo, true)),
            tags: Arc::new(self.tag_store(&repo)),
            uploads: Arc::new(self.repository_uploads(&repo)),
            name: repo,
        })
    }

    async fn repositories(&self, last: Option<&str>, n: usize) -> Result<CatalogPage, CoreError> {
        let all = walk_repositories(&self.driver).await?;
        let mut remaining = all
            .into_iter()
            .filter(|name| last.is_none_or(|l| name.as_str() > l));
        let repositories: Vec<String> = remaining.by_ref().take(n).collect();
        let has_more = remaining.next().is_some();
        Ok(CatalogPage {
            repositories,
            has_more,
        })
    }
}

/// Enumerate every repository under the storage root, lexicographically.
///
/// A directory is a repository when it holds any of the reserved `_manifests`
/// / `_layers` / `_uploads` subtrees; other directories are path components
/// and are descended into.
pub(crate) async fn walk_repositories(
    driver: &Arc<dyn StorageDriver>,
) -> Result<Vec<String>, CoreError> {
    let root = paths::repositories_root();
    let mut found = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(dir) = stack.pop() {
        let children = match driver.list(&dir).await {
            Ok(children) => children,
            Err(StorageError::PathNotFound(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        let mut is_repo = false;
        for child in children {
            let base = child.rsplit('/').next().unwrap_or_default();
            if base.starts_with('_') {
                is_repo = true;
            } else {
                stack.push(child);
            }
        }
        if is_repo && dir != root {
            found.push(dir[root.len() + 1..].to_string());
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::BlobService;
    use bytes::Bytes;
    use drydock_storage::InMemoryDriver;

    fn registry() -> Registry {
        let driver: Arc<dyn StorageDriver> = Arc::new(InMemoryDriver::new());
        Registry::new(
            driver,
            None,
            Arc::new(ManifestPolicy::default()),
            RegistryConfig {
                delete_enabled: true,
                ..RegistryConfig::default()
            },
        )
    }

    async fn seed(registry: &Registry, name: &str) {
        let repo = registry.repository(name).unwrap();
        repo.blobs
            .put("application/octet-stream", Bytes::from_static(b"seed"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn repository_rejects_invalid_names() {
        let registry = registry();
        assert!(matches!(
            registry.repository("Bad/Name"),
            Err(CoreError::NameInvalid(_))
        ));
    }

    #[tokio::test]
    async fn catalog_is_sorted_and_paginated() {
        let registry = registry();
        for name in ["zoo/app", "alice/app", "alice/web", "bob/svc"] {
            seed(&registry, name).await;
        }

        let page = registry.repositories(None, 3).await.unwrap();
        assert_eq!(page.repositories, vec!["alice/app", "alice/web", "bob/svc"]);
        assert!(page.has_more);

        let page = registry.repositories(Some("bob/svc"), 3).await.unwrap();
        assert_eq!(page.repositories, vec!["zoo/app"]);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn empty_registry_has_empty_catalog() {
        let registry = registry();
        let page = registry.repositories(None, 10).await.unwrap();
        assert!(page.repositories.is_empty());
        assert!(!page.has_more);
    }
}
