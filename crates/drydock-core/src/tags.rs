//! Tag index
//!
//! A tag is a single `current/link` file naming a manifest revision, plus an
//! `index/` directory preserving every revision the tag ever pointed at.
//! Updates are a lone `put_content`, so readers see the old or the new
//! pointer and never a torn one.

use async_trait::async_trait;
use bytes::Bytes;
use drydock_storage::{StorageDriver, StorageError, paths};
use futures::{StreamExt, stream};
use std::sync::Arc;
use tracing::debug;

use crate::digest::Digest;
use crate::error::CoreError;
use crate::reference::{RepositoryName, Tag};
use crate::services::TagService;

/// Tag service for one repository
#[derive(Clone)]
pub struct TagStore {
    driver: Arc<dyn StorageDriver>,
    repo: RepositoryName,
    /// Bound on concurrent link reads during reverse lookup; 0 means
    /// unbounded.
    concurrency_limit: usize,
}

impl TagStore {
    pub fn new(
        driver: Arc<dyn StorageDriver>,
        repo: RepositoryName,
        concurrency_limit: usize,
    ) -> Self {
        Self {
            driver,
            repo,
            concurrency_limit,
        }
    }

    /// Resolve a tag to its current revision digest
    pub async fn resolve(&self, tag: &Tag) -> Result<Digest, CoreError> {
        let path = paths::tag_current_link_path(self.repo.as_str(), tag.as_str());
        let content = self.driver.get_content(&path).await.map_err(|e| match e {
            StorageError::PathNotFound(_) => CoreError::ManifestUnknown {
                reference: tag.to_string(),
            },
            other => CoreError::Storage(other),
        })?;
        std::str::from_utf8(&content)
            .map_err(|_| CoreError::DigestInvalid("tag link is not UTF-8".to_string()))?
            .trim()
            .parse()
    }

    /// Point a tag at a revision, preserving the old revision in the tag's
    /// history index. Last writer wins at link-file granularity.
    pub async fn tag(&self, tag: &Tag, digest: &Digest) -> Result<(), CoreError> {
        let link = Bytes::from(digest.to_string());
        self.driver
            .put_content(
                &paths::tag_index_link_path(
                    self.repo.as_str(),
                    tag.as_str(),
                    digest.algorithm().as_str(),
                    digest.hex(),
                ),
                link.clone(),
            )
            .await?;
        self.driver
            .put_content(
                &paths::tag_current_link_path(self.repo.as_str(), tag.as_str()),
                link,
            )
            .await?;
        debug!("tagged {}:{} -> {}", self.repo, tag, digest);
        Ok(())
    }

    /// Remove a tag entirely (current pointer and history)
    pub async fn untag(&self, tag: &Tag) -> Result<(), CoreError> {
        let path = paths::manifest_tag_path(self.repo.as_str(), tag.as_str());
        self.driver.delete(&path).await.map_err(|e| match e {
            StorageError::PathNotFound(_) => CoreError::ManifestUnknown {
                reference: tag.to_string(),
            },
            other => CoreError::Storage(other),
        })
    }
}

#[async_trait]
impl TagService for TagStore {
    async fn all(&self) -> Result<Vec<String>, CoreError> {
        let path = paths::manifest_tags_path(self.repo.as_str());
        let children = self.driver.list(&path).await.map_err(|e| match e {
            StorageError::PathNotFound(_) => CoreError::NameUnknown(self.repo.to_string()),
            other => CoreError::Storage(other),
        })?;
        // Driver listing is sorted; keep only the leaf names.
        Ok(children
            .into_iter()
            .filter_map(|child| child.rsplit('/').next().map(str::to_string))
            .collect())
    }

    async fn lookup(&self, digest: &Digest) -> Result<Vec<String>, CoreError> {
        let tags = match self.all().await {
            Ok(tags) => tags,
            Err(CoreError::NameUnknown(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let limit = if self.concurrency_limit == 0 {
            tags.len().max(1)
        } else {
            self.concurrency_limit
        };
        let matches: Vec<Option<String>> = stream::iter(tags)
            .map(|name| async move {
                let tag: Tag = name.parse().ok()?;
                match self.resolve(&tag).await {
                    Ok(current) if current == *digest => Some(name),
                    _ => None,
                }
            })
            .buffer_unordered(limit)
            .collect()
            .await;
        let mut found: Vec<String> = matches.into_iter().flatten().collect();
        found.sort();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Algorithm;
    use drydock_storage::InMemoryDriver;

    fn store() -> TagStore {
        let driver: Arc<dyn StorageDriver> = Arc::new(InMemoryDriver::new());
        TagStore::new(driver, "alice/app".parse().unwrap(), 2)
    }

    fn digest(data: &[u8]) -> Digest {
        Digest::from_bytes(Algorithm::Sha256, data)
    }

    #[tokio::test]
    async fn tag_resolve_roundtrip() {
        let tags = store();
        let tag: Tag = "latest".parse().unwrap();
        let d = digest(b"rev1");
        tags.tag(&tag, &d).await.unwrap();
        assert_eq!(tags.resolve(&tag).await.unwrap(), d);
    }

    #[tokio::test]
    async fn retag_preserves_history() {
        let tags = store();
        let tag: Tag = "latest".parse().unwrap();
        let first = digest(b"rev1");
        let second = digest(b"rev2");
        tags.tag(&tag, &first).await.unwrap();
        tags.tag(&tag, &second).await.unwrap();

        assert_eq!(tags.resolve(&tag).await.unwrap(), second);
        // Both revisions remain in the history index.
        let index = paths::manifest_tag_path("alice/app", "latest") + "/index/sha256";
        assert_eq!(tags.driver.list(&index).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn all_is_lexicographic() {
        let tags = store();
        for name in ["zeta", "alpha", "mid"] {
            tags.tag(&name.parse().unwrap(), &digest(b"rev")).await.unwrap();
        }
        assert_eq!(tags.all().await.unwrap(), vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn all_on_untagged_repository_is_name_unknown() {
        let tags = store();
        assert!(matches!(tags.all().await, Err(CoreError::NameUnknown(_))));
    }

    #[tokio::test]
    async fn lookup_finds_tags_for_digest() {
        let tags = store();
        let wanted = digest(b"wanted");
        let other = digest(b"other");
        tags.tag(&"v1".parse().unwrap(), &wanted).await.unwrap();
        tags.tag(&"v2".parse().unwrap(), &other).await.unwrap();
        tags.tag(&"also-v1".parse().unwrap(), &wanted).await.unwrap();

        assert_eq!(tags.lookup(&wanted).await.unwrap(), vec!["also-v1", "v1"]);
    }

    #[tokio::test]
    async fn untag_removes_current_and_history() {
        let tags = store();
        let tag: Tag = "gone".parse().unwrap();
        tags.tag(&tag, &digest(b"rev")).await.unwrap();
        tags.untag(&tag).await.unwrap();
        assert!(matches!(
            tags.resolve(&tag).await,
            Err(CoreError::ManifestUnknown { .. })
        ));
    }
}
