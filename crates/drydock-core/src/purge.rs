//! Upload purging
//!
//! Abandoned upload sessions hold spooled bytes that nothing references. A
//! background sweeper enumerates `_uploads/` across all repositories and
//! deletes sessions older than the configured age. Start time is jittered so
//! a fleet restarting together does not sweep in lockstep.

use chrono::Utc;
use drydock_storage::{StorageDriver, StorageError, paths};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::registry::walk_repositories;
use crate::upload::parse_started_at;

/// Configuration for the background upload purger
#[derive(Debug, Clone)]
pub struct UploadPurgeConfig {
    pub enabled: bool,
    /// Sessions older than this are deleted
    pub age: Duration,
    /// Sweep period
    pub interval: Duration,
    /// Log what would be deleted without deleting it
    pub dry_run: bool,
}

impl Default for UploadPurgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            age: Duration::from_secs(168 * 3600),
            interval: Duration::from_secs(24 * 3600),
            dry_run: false,
        }
    }
}

/// Spawn the periodic purge task; returns `None` when purging is disabled.
pub fn spawn_upload_purger(
    driver: Arc<dyn StorageDriver>,
    config: UploadPurgeConfig,
) -> Option<tokio::task::JoinHandle<()>> {
    if !config.enabled {
        return None;
    }
    // Jitter within [0, 60) minutes so a fleet does not thunder together.
    let jitter = Duration::from_secs(rand::thread_rng().gen_range(0..3600));
    info!(
        "upload purger starting in {:?} (age: {:?}, interval: {:?}, dry run: {})",
        jitter, config.age, config.interval, config.dry_run
    );
    Some(tokio::spawn(async move {
        tokio::time::sleep(jitter).await;
        let mut ticker = tokio::time::interval(config.interval);
        loop {
            ticker.tick().await;
            match purge_uploads(&driver, config.age, config.dry_run).await {
                Ok((purged, errors)) => {
                    if purged > 0 || errors > 0 {
                        info!("upload purge removed {} sessions ({} errors)", purged, errors);
                    }
                }
                Err(e) => warn!("upload purge sweep failed: {}", e),
            }
        }
    }))
}

/// One sweep over every repository's `_uploads/` tree.
///
/// Returns `(purged, errors)`. Sessions whose `startedat` is missing or
/// unreadable are treated as expired; they cannot be resumed anyway.
pub async fn purge_uploads(
    driver: &Arc<dyn StorageDriver>,
    age: Duration,
    dry_run: bool,
) -> Result<(usize, usize), CoreError> {
    let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
    let mut purged = 0;
    let mut errors = 0;

    for repo in walk_repositories(driver).await? {
        let uploads_dir = paths::uploads_path(&repo);
        let sessions = match driver.list(&uploads_dir).await {
            Ok(sessions) => sessions,
            Err(StorageError::PathNotFound(_)) => continue,
            Err(e) => {
                warn!("failed to list uploads in {}: {}", repo, e);
                errors += 1;
                continue;
            }
        };
        for session_dir in sessions {
            let id = session_dir.rsplit('/').next().unwrap_or_default().to_string();
            let started = match driver
                .get_content(&paths::upload_started_at_path(&repo, &id))
                .await
            {
                Ok(raw) => parse_started_at(&raw),
                Err(StorageError::PathNotFound(_)) => None,
                Err(e) => {
                    warn!("failed to read startedat for upload {} in {}: {}", id, repo, e);
                    errors += 1;
                    continue;
                }
            };
            let expired = started.is_none_or(|t| t < cutoff);
            if !expired {
                continue;
            }
            if dry_run {
                info!("would purge upload {} in {} (started: {:?})", id, repo, started);
                purged += 1;
                continue;
            }
            match driver.delete(&session_dir).await {
                Ok(()) => {
                    debug!("purged upload {} in {}", id, repo);
                    purged += 1;
                }
                Err(e) => {
                    warn!("failed to purge upload {} in {}: {}", id, repo, e);
                    errors += 1;
                }
            }
        }
    }
    Ok((purged, errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use drydock_storage::InMemoryDriver;

    async fn seed_session(driver: &Arc<dyn StorageDriver>, repo: &str, id: &str, started: chrono::DateTime<Utc>) {
        driver
            .put_content(
                &paths::upload_started_at_path(repo, id),
                Bytes::from(started.to_rfc3339()),
            )
            .await
            .unwrap();
        driver
            .put_content(&paths::upload_data_path(repo, id), Bytes::from_static(b"partial"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn purges_only_expired_sessions() {
        let driver: Arc<dyn StorageDriver> = Arc::new(InMemoryDriver::new());
        let old = Utc::now() - chrono::Duration::days(10);
        seed_session(&driver, "alice/app", "11111111-1111-4111-8111-111111111111", old).await;
        seed_session(&driver, "alice/app", "22222222-2222-4222-8222-222222222222", Utc::now()).await;

        let (purged, errors) = purge_uploads(&driver, Duration::from_secs(168 * 3600), false)
            .await
            .unwrap();
        assert_eq!((purged, errors), (1, 0));

        assert!(
            driver
                .stat(&paths::upload_path("alice/app", "11111111-1111-4111-8111-111111111111"))
                .await
                .is_err()
        );
        assert!(
            driver
                .stat(&paths::upload_path("alice/app", "22222222-2222-4222-8222-222222222222"))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn dry_run_reports_without_deleting() {
        let driver: Arc<dyn StorageDriver> = Arc::new(InMemoryDriver::new());
        let old = Utc::now() - chrono::Duration::days(10);
        seed_session(&driver, "alice/app", "33333333-3333-4333-8333-333333333333", old).await;

        let (purged, _) = purge_uploads(&driver, Duration::from_secs(3600), true)
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(
            driver
                .stat(&paths::upload_path("alice/app", "33333333-3333-4333-8333-333333333333"))
                .await
                .is_ok()
        );
    }
}
