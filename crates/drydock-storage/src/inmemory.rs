//! In-memory reference driver
//!
//! Keeps the whole object tree in a sorted map. Exists to pin down the driver
//! contract and to back tests; it is also usable for short-lived registries.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::driver::{ByteStream, FileInfo, FileWriter, StorageDriver, validate_path};
use crate::error::StorageError;

#[derive(Clone)]
struct Entry {
    data: Bytes,
    modified: DateTime<Utc>,
}

/// Reference driver backed by a `BTreeMap`
#[derive(Clone, Default)]
pub struct InMemoryDriver {
    objects: Arc<RwLock<BTreeMap<String, Entry>>>,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, path: &str, data: Bytes) {
        self.objects.write().insert(
            path.to_string(),
            Entry {
                data,
                modified: Utc::now(),
            },
        );
    }
}

#[async_trait]
impl StorageDriver for InMemoryDriver {
    fn name(&self) -> &'static str {
        "inmemory"
    }

    async fn get_content(&self, path: &str) -> Result<Bytes, StorageError> {
        validate_path(path)?;
        self.objects
            .read()
            .get(path)
            .map(|e| e.data.clone())
            .ok_or_else(|| StorageError::PathNotFound(path.to_string()))
    }

    async fn put_content(&self, path: &str, content: Bytes) -> Result<(), StorageError> {
        validate_path(path)?;
        self.insert(path, content);
        Ok(())
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<ByteStream, StorageError> {
        let data = self.get_content(path).await?;
        if offset > data.len() as u64 {
            return Err(StorageError::InvalidOffset {
                path: path.to_string(),
                offset,
            });
        }
        let tail = data.slice(offset as usize..);
        Ok(Box::pin(futures::stream::once(async move { Ok(tail) })))
    }

    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>, StorageError> {
        validate_path(path)?;
        let existing = if append {
            self.objects
                .read()
                .get(path)
                .map(|e| e.data.to_vec())
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        Ok(Box::new(InMemoryWriter {
            driver: self.clone(),
            path: path.to_string(),
            buf: existing,
        }))
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, StorageError> {
        validate_path(path)?;
        let objects = self.objects.read();
        if let Some(entry) = objects.get(path) {
            return Ok(FileInfo {
                path: path.to_string(),
                size: entry.data.len() as u64,
                modified: Some(entry.modified),
                is_dir: false,
            });
        }
        // Directories exist implicitly when any deeper key does.
        let prefix = format!("{path}/");
        if objects.range(prefix.clone()..).next().is_some_and(|(k, _)| k.starts_with(&prefix)) {
            return Ok(FileInfo {
                path: path.to_string(),
                size: 0,
                modified: None,
                is_dir: true,
            });
        }
        Err(StorageError::PathNotFound(path.to_string()))
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, StorageError> {
        validate_path(path)?;
        let prefix = format!("{path}/");
        let objects = self.objects.read();
        let mut children: Vec<String> = Vec::new();
        for key in objects.range(prefix.clone()..).map(|(k, _)| k) {
            if !key.starts_with(&prefix) {
                break;
            }
            let rest = &key[prefix.len()..];
            let child = match rest.find('/') {
                Some(idx) => format!("{prefix}{}", &rest[..idx]),
                None => key.clone(),
            };
            if children.last() != Some(&child) {
                children.push(child);
            }
        }
        if children.is_empty() && !objects.contains_key(path) {
            return Err(StorageError::PathNotFound(path.to_string()));
        }
        Ok(children)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        validate_path(from)?;
        validate_path(to)?;
        let mut objects = self.objects.write();
        let entry = objects
            .remove(from)
            .ok_or_else(|| StorageError::PathNotFound(from.to_string()))?;
        objects.insert(to.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        validate_path(path)?;
        let mut objects = self.objects.write();
        let prefix = format!("{path}/");
        let keys: Vec<String> = objects
            .range(path.to_string()..)
            .map(|(k, _)| k.clone())
            .take_while(|k| k == path || k.starts_with(&prefix))
            .collect();
        if keys.is_empty() {
            return Err(StorageError::PathNotFound(path.to_string()));
        }
        for key in keys {
            objects.remove(&key);
        }
        Ok(())
    }

    async fn redirect_url(
        &self,
        _method: &str,
        _path: &str,
    ) -> Result<Option<String>, StorageError> {
        Ok(None)
    }
}

struct InMemoryWriter {
    driver: InMemoryDriver,
    path: String,
    buf: Vec<u8>,
}

#[async_trait]
impl FileWriter for InMemoryWriter {
    async fn write(&mut self, chunk: Bytes) -> Result<(), StorageError> {
        self.buf.extend_from_slice(&chunk);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.buf.len() as u64
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.driver.insert(&self.path, Bytes::from(self.buf));
        Ok(())
    }

    async fn cancel(self: Box<Self>) -> Result<(), StorageError> {
        self.driver.objects.write().remove(&self.path);
        Ok(())
    }
}
