//! Redis-backed descriptor cache
//!
//! Stores descriptors as JSON under `blobs::<digest>` keys in an
//! out-of-process store so a fleet of registries shares one cache. Redis
//! failures degrade to misses; they never fail the request.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::warn;

use super::{BlobDescriptorCache, global_key, scoped_key};
use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::CoreError;
use crate::reference::RepositoryName;

/// Descriptor cache backed by a Redis instance
pub struct RedisDescriptorCache {
    conn: ConnectionManager,
}

impl RedisDescriptorCache {
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let client = redis::Client::open(url).map_err(|e| CoreError::Cache(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| CoreError::Cache(e.to_string()))?;
        Ok(Self { conn })
    }

    async fn fetch(&self, key: &str) -> Option<Descriptor> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = match conn.get(key).await {
            Ok(v) => v,
            Err(e) => {
                warn!("descriptor cache read failed for {key}: {e}");
                return None;
            }
        };
        raw.and_then(|json| match serde_json::from_str(&json) {
            Ok(desc) => Some(desc),
            Err(e) => {
                warn!("dropping undecodable descriptor cache entry {key}: {e}");
                None
            }
        })
    }

    async fn store(&self, key: &str, descriptor: &Descriptor) {
        let json = match serde_json::to_string(descriptor) {
            Ok(json) => json,
            Err(e) => {
                warn!("failed to encode descriptor for {key}: {e}");
                return;
            }
        };
        let mut conn = self.conn.clone();
        if let Err(e) = conn.set::<_, _, ()>(key, json).await {
            warn!("descriptor cache write failed for {key}: {e}");
        }
    }

    async fn remove(&self, key: &str) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn.del::<_, ()>(key).await {
            warn!("descriptor cache delete failed for {key}: {e}");
        }
    }
}

#[async_trait]
impl BlobDescriptorCache for RedisDescriptorCache {
    async fn get(&self, digest: &Digest) -> Option<Descriptor> {
        self.fetch(&global_key(digest)).await
    }

    async fn set(&self, descriptor: &Descriptor) {
        self.store(&global_key(&descriptor.digest), descriptor).await;
    }

    async fn get_repository(&self, repo: &RepositoryName, digest: &Digest) -> Option<Descriptor> {
        self.fetch(&scoped_key(repo, digest)).await
    }

    async fn set_repository(&self, repo: &RepositoryName, descriptor: &Descriptor) {
        self.store(&scoped_key(repo, &descriptor.digest), descriptor)
            .await;
        self.set(descriptor).await;
    }

    async fn evict(&self, digest: &Digest) {
        self.remove(&global_key(digest)).await;
    }

    async fn evict_repository(&self, repo: &RepositoryName, digest: &Digest) {
        self.remove(&scoped_key(repo, digest)).await;
    }
}
