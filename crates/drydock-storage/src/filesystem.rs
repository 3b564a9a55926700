//! Local filesystem driver
//!
//! Maps the registry tree onto a directory under `root`. `put_content` writes
//! to a unique temporary file and renames into place, so readers never see a
//! torn object; the resumable writer appends in place and the registry layers
//! above only publish data by renaming it into the blob store.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};
use uuid::Uuid;

use crate::driver::{ByteStream, FileInfo, FileWriter, StorageDriver, validate_path};
use crate::error::StorageError;

/// Local filesystem driver rooted at a base directory
pub struct FilesystemDriver {
    root: PathBuf,
}

impl FilesystemDriver {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        info!("initialized filesystem driver at {:?}", root);
        Ok(Self { root })
    }

    fn full_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        validate_path(path)?;
        Ok(self.root.join(path.trim_start_matches('/')))
    }

    fn not_found(path: &str) -> impl Fn(std::io::Error) -> StorageError + '_ {
        move |e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::PathNotFound(path.to_string())
            } else {
                StorageError::Io(e)
            }
        }
    }
}

#[async_trait]
impl StorageDriver for FilesystemDriver {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn get_content(&self, path: &str) -> Result<Bytes, StorageError> {
        let full = self.full_path(path)?;
        let data = fs::read(&full).await.map_err(Self::not_found(path))?;
        Ok(Bytes::from(data))
    }

    async fn put_content(&self, path: &str, content: Bytes) -> Result<(), StorageError> {
        let full = self.full_path(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Unique temp name so concurrent writers of the same key cannot
        // interleave; rename is atomic within one filesystem.
        let tmp = full.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp, &content).await?;
        fs::rename(&tmp, &full).await?;
        Ok(())
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<ByteStream, StorageError> {
        let full = self.full_path(path)?;
        let mut file = File::open(&full).await.map_err(Self::not_found(path))?;
        let len = file.metadata().await?.len();
        if offset > len {
            return Err(StorageError::InvalidOffset {
                path: path.to_string(),
                offset,
            });
        }
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let stream = tokio_util::io::ReaderStream::new(BufReader::new(file));
        Ok(Box::pin(stream.map(|r| r.map_err(StorageError::Io))))
    }

    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>, StorageError> {
        let full = self.full_path(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = if append {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&full)
                .await?
        } else {
            File::create(&full).await?
        };
        let size = file.metadata().await?.len();
        debug!("opened writer at {:?} (append: {}, size: {})", full, append, size);
        Ok(Box::new(FilesystemWriter {
            file: Some(file),
            path: full,
            size,
        }))
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, StorageError> {
        let full = self.full_path(path)?;
        let meta = fs::metadata(&full).await.map_err(Self::not_found(path))?;
        let modified = meta.modified().ok().map(DateTime::<Utc>::from);
        Ok(FileInfo {
            path: path.to_string(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified,
            is_dir: meta.is_dir(),
        })
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, StorageError> {
        let full = self.full_path(path)?;
        let mut dir = fs::read_dir(&full).await.map_err(Self::not_found(path))?;
        let mut children = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                children.push(format!("{}/{name}", path.trim_end_matches('/')));
            }
        }
        children.sort();
        Ok(children)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let src = self.full_path(from)?;
        let dst = self.full_path(to)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&src, &dst).await.map_err(Self::not_found(from))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let full = self.full_path(path)?;
        let meta = fs::metadata(&full).await.map_err(Self::not_found(path))?;
        if meta.is_dir() {
            fs::remove_dir_all(&full).await?;
        } else {
            fs::remove_file(&full).await?;
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

struct FilesystemWriter {
    file: Option<File>,
    path: PathBuf,
    size: u64,
}

#[async_trait]
impl FileWriter for FilesystemWriter {
    async fn write(&mut self, chunk: Bytes) -> Result<(), StorageError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StorageError::WriterClosed(self.path.display().to_string()))?;
        file.write_all(&chunk).await?;
        self.size += chunk.len() as u64;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    async fn cancel(mut self: Box<Self>) -> Result<(), StorageError> {
        drop(self.file.take());
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn collect(mut stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn put_content_is_atomic_replace() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FilesystemDriver::new(dir.path()).await.unwrap();
        driver
            .put_content("/b/data", Bytes::from_static(b"one"))
            .await
            .unwrap();
        driver
            .put_content("/b/data", Bytes::from_static(b"two"))
            .await
            .unwrap();
        assert_eq!(driver.get_content("/b/data").await.unwrap().as_ref(), b"two");
    }

    #[tokio::test]
    async fn append_writer_continues_at_end() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FilesystemDriver::new(dir.path()).await.unwrap();

        let mut w = driver.writer("/u/data", false).await.unwrap();
        w.write(Bytes::from_static(b"hello ")).await.unwrap();
        w.commit().await.unwrap();

        let mut w = driver.writer("/u/data", true).await.unwrap();
        assert_eq!(w.size(), 6);
        w.write(Bytes::from_static(b"world")).await.unwrap();
        w.commit().await.unwrap();

        let stream = driver.reader("/u/data", 0).await.unwrap();
        assert_eq!(collect(stream).await, b"hello world");
    }

    #[tokio::test]
    async fn cancel_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FilesystemDriver::new(dir.path()).await.unwrap();
        let mut w = driver.writer("/u/data", false).await.unwrap();
        w.write(Bytes::from_static(b"junk")).await.unwrap();
        w.cancel().await.unwrap();
        assert!(matches!(
            driver.stat("/u/data").await,
            Err(StorageError::PathNotFound(_))
        ));
    }

    #[tokio::test]
    async fn rename_moves_across_directories() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FilesystemDriver::new(dir.path()).await.unwrap();
        driver
            .put_content("/uploads/x/data", Bytes::from_static(b"blob"))
            .await
            .unwrap();
        driver
            .rename("/uploads/x/data", "/blobs/sha256/ab/abcd/data")
            .await
            .unwrap();
        assert_eq!(
            driver
                .get_content("/blobs/sha256/ab/abcd/data")
                .await
                .unwrap()
                .as_ref(),
            b"blob"
        );
    }
}
