//! In-memory LRU descriptor cache

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

use super::{BlobDescriptorCache, global_key, scoped_key};
use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::reference::RepositoryName;

/// Default entry bound, shared between the global and scoped layers
pub const DEFAULT_CAPACITY: usize = 10_000;

/// LRU-bounded in-process descriptor cache
pub struct InMemoryDescriptorCache {
    global: Mutex<LruCache<String, Descriptor>>,
    scoped: Mutex<LruCache<String, Descriptor>>,
}

impl InMemoryDescriptorCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            global: Mutex::new(LruCache::new(capacity)),
            scoped: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl Default for InMemoryDescriptorCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl BlobDescriptorCache for InMemoryDescriptorCache {
    async fn get(&self, digest: &Digest) -> Option<Descriptor> {
        self.global.lock().get(&global_key(digest)).cloned()
    }

    async fn set(&self, descriptor: &Descriptor) {
        self.global
            .lock()
            .put(global_key(&descriptor.digest), descriptor.clone());
    }

    async fn get_repository(&self, repo: &RepositoryName, digest: &Digest) -> Option<Descriptor> {
        self.scoped.lock().get(&scoped_key(repo, digest)).cloned()
    }

    async fn set_repository(&self, repo: &RepositoryName, descriptor: &Descriptor) {
        self.scoped
            .lock()
            .put(scoped_key(repo, &descriptor.digest), descriptor.clone());
        self.set(descriptor).await;
    }

    async fn evict(&self, digest: &Digest) {
        self.global.lock().pop(&global_key(digest));
    }

    async fn evict_repository(&self, repo: &RepositoryName, digest: &Digest) {
        self.scoped.lock().pop(&scoped_key(repo, digest));
    }
}
