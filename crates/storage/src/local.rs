//! Local filesystem storage backend
//!
//! Provides async file I/O with atomic writes to prevent partial/corrupt files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use ckpt_core::{Error, Result};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::backend::TEMP_SUFFIX;
use crate::StorageBackend;

/// Cap on the up-front allocation for prefix reads
const PREFIX_CAPACITY_LIMIT: usize = 64 * 1024;

/// Local filesystem storage backend
///
/// Stores data in a local directory with support for:
/// - Atomic writes (write to hidden .tmp, fsync, then rename)
/// - Automatic directory creation
/// - Recursive file listing
#[derive(Debug, Clone)]
pub struct LocalStorage {
    /// Base path for all storage operations
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a new LocalStorage instance
    ///
    /// # Arguments
    /// * `base_path` - Directory to use as the storage root
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Get the base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a relative path to an absolute path
    fn resolve_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }

    /// Generate a unique temporary file path next to the target
    fn temp_path(&self, path: &str) -> PathBuf {
        let full_path = self.resolve_path(path);
        let temp_name = format!(
            ".{}.{}{}",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4().simple(),
            TEMP_SUFFIX
        );
        full_path.with_file_name(temp_name)
    }

    fn map_not_found(path: &str, e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::StoragePathNotFound {
                path: path.to_string(),
            }
        } else {
            Error::Io(e)
        }
    }

    /// Best-effort removal of a temp file after a failed write
    async fn remove_temp(temp_path: &Path) {
        if let Err(e) = fs::remove_file(temp_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(?temp_path, error = %e, "Failed to remove temp file after write error");
            }
        }
    }

    async fn write_temp(temp_path: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut file = fs::File::create(temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.resolve_path(path);
        debug!(?full_path, "Reading file");

        fs::read(&full_path)
            .await
            .map(Bytes::from)
            .map_err(|e| Self::map_not_found(path, e))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn read_prefix(&self, path: &str, len: usize) -> Result<Bytes> {
        let full_path = self.resolve_path(path);
        let file = fs::File::open(&full_path)
            .await
            .map_err(|e| Self::map_not_found(path, e))?;

        let mut buf = Vec::with_capacity(len.min(PREFIX_CAPACITY_LIMIT));
        file.take(len as u64).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.resolve_path(path);
        let temp_path = self.temp_path(path);
        let size = data.len() as u64;

        debug!(?full_path, ?temp_path, size, "Writing file atomically");

        // Ensure parent directory exists
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if let Err(e) = Self::write_temp(&temp_path, &data).await {
            Self::remove_temp(&temp_path).await;
            return Err(Error::Io(e));
        }

        // Atomic rename
        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            Self::remove_temp(&temp_path).await;
            return Err(Error::Io(e));
        }

        debug!(?full_path, size, "File written successfully");
        Ok(size)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path);
        debug!(?full_path, "Deleting file");

        fs::remove_file(&full_path)
            .await
            .map_err(|e| Self::map_not_found(path, e))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.resolve_path(path);
        Ok(fs::metadata(&full_path).await.is_ok())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut found = Vec::new();
        let mut pending = vec![self.base_path.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // A store that was never written to has no root yet
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::Io(e)),
            };

            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let entry_path = entry.path();
                if file_type.is_dir() {
                    pending.push(entry_path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }

                let Ok(relative) = entry_path.strip_prefix(&self.base_path) else {
                    continue;
                };
                let relative = relative.to_string_lossy().into_owned();
                if relative.starts_with(prefix) {
                    found.push(relative);
                }
            }
        }

        found.sort_unstable();
        debug!(prefix, count = found.len(), "Listed files");
        Ok(found)
    }
}
