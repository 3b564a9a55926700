//! Proxied-content expiry
//!
//! Pull-through mode materializes upstream content locally with a bounded
//! lifetime. Each fetch schedules an expiry entry; a background task removes
//! the repository links once the TTL lapses, leaving the physical bytes for
//! offline garbage collection. State is persisted as JSON in the driver so
//! expirations survive restarts.

use chrono::{DateTime, Utc};
use drydock_storage::{StorageDriver, StorageError, paths};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::digest::Digest;
use crate::error::CoreError;
use crate::reference::RepositoryName;

const STATE_PATH: &str = "/scheduler-state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EntryKind {
    Blob,
    Manifest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExpiryEntry {
    repository: String,
    digest: String,
    kind: EntryKind,
    expires: DateTime<Utc>,
}

/// TTL bookkeeping for proxied content
pub struct ProxyScheduler {
    driver: Arc<dyn StorageDriver>,
    entries: Mutex<HashMap<String, ExpiryEntry>>,
}

impl ProxyScheduler {
    /// Load persisted state, tolerating a missing or corrupt file.
    pub async fn load(driver: Arc<dyn StorageDriver>) -> Self {
        let entries = match driver.get_content(STATE_PATH).await {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("discarding unreadable scheduler state: {}", e);
                    HashMap::new()
                }
            },
            Err(StorageError::PathNotFound(_)) => HashMap::new(),
            Err(e) => {
                warn!("failed to load scheduler state: {}", e);
                HashMap::new()
            }
        };
        info!("proxy scheduler loaded {} pending expirations", entries.len());
        Self {
            driver,
            entries: Mutex::new(entries),
        }
    }

    fn key(kind: EntryKind, repo: &RepositoryName, digest: &Digest) -> String {
        let kind = match kind {
            EntryKind::Blob => "blob",
            EntryKind::Manifest => "manifest",
        };
        format!("{kind}::{repo}@{digest}")
    }

    async fn schedule(
        &self,
        kind: EntryKind,
        repo: &RepositoryName,
        digest: &Digest,
        ttl: Duration,
    ) {
        let expires = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::MAX);
        self.entries.lock().insert(
            Self::key(kind, repo, digest),
            ExpiryEntry {
                repository: repo.to_string(),
                digest: digest.to_string(),
                kind,
                expires,
            },
        );
        self.save().await;
    }

    pub async fn schedule_blob(&self, repo: &RepositoryName, digest: &Digest, ttl: Duration) {
        self.schedule(EntryKind::Blob, repo, digest, ttl).await;
    }

    pub async fn schedule_manifest(&self, repo: &RepositoryName, digest: &Digest, ttl: Duration) {
        self.schedule(EntryKind::Manifest, repo, digest, ttl).await;
    }

    async fn save(&self) {
        let snapshot = self.entries.lock().clone();
        match serde_json::to_vec(&snapshot) {
            Ok(json) => {
                if let Err(e) = self.driver.put_content(STATE_PATH, json.into()).await {
                    warn!("failed to persist scheduler state: {}", e);
                }
            }
            Err(e) => warn!("failed to encode scheduler state: {}", e),
        }
    }

    /// Remove links for every lapsed entry.
    pub async fn expire_due(&self) -> Result<usize, CoreError> {
        let now = Utc::now();
        let due: Vec<(String, ExpiryEntry)> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.expires <= now)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut expired = 0;
        for (key, entry) in due {
            let digest: Digest = match entry.digest.parse() {
                Ok(digest) => digest,
                Err(_) => {
                    self.entries.lock().remove(&key);
                    continue;
                }
            };
            let link = match entry.kind {
                EntryKind::Blob => paths::layer_link_path(
                    &entry.repository,
                    digest.algorithm().as_str(),
                    digest.hex(),
                ),
                EntryKind::Manifest => paths::manifest_revision_link_path(
                    &entry.repository,
                    digest.algorithm().as_str(),
                    digest.hex(),
                ),
            };
            match self.driver.delete(&link).await {
                Ok(()) | Err(StorageError::PathNotFound(_)) => {
                    debug!("expired proxied {:?} {} in {}", entry.kind, digest, entry.repository);
                    self.entries.lock().remove(&key);
                    expired += 1;
                }
                Err(e) => warn!("failed to expire {}: {}", key, e),
            }
        }
        if expired > 0 {
            self.save().await;
        }
        Ok(expired)
    }
}

/// Run expiry sweeps on a fixed cadence until process shutdown.
pub fn spawn_ttl_scheduler(
    scheduler: Arc<ProxyScheduler>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match scheduler.expire_due().await {
                Ok(n) if n > 0 => info!("proxy scheduler expired {} entries", n),
                Ok(_) => {}
                Err(e) => warn!("proxy scheduler sweep failed: {}", e),
            }
        }
    })
}
