//! Storage backend trait definition
//!
//! Defines the async interface that all storage backends must implement.

use async_trait::async_trait;
use bytes::Bytes;
use ckpt_core::Result;

/// Suffix carried by in-progress writes
pub const TEMP_SUFFIX: &str = ".tmp";

/// Returns true for paths left behind by an in-progress (or crashed) write
pub fn is_temp_path(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

/// Async trait for storage backends
///
/// Implementors provide basic CRUD operations for binary data. A backend is
/// owned by exactly one checkpoint store at a time; sharing a root between
/// two writers is not supported.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read data from the given path
    ///
    /// # Arguments
    /// * `path` - Relative path within the storage backend
    ///
    /// # Returns
    /// The file contents as `Bytes`
    ///
    /// # Errors
    /// Returns `StoragePathNotFound` if the path doesn't exist, `Io` if the
    /// read fails
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Read at most `len` bytes from the start of the given path
    ///
    /// Used to inspect file headers without loading the payload.
    async fn read_prefix(&self, path: &str, len: usize) -> Result<Bytes>;

    /// Write data to the given path
    ///
    /// Creates parent directories if they don't exist. The write must be
    /// atomic: on failure the previous content (or absence) of `path` is
    /// preserved.
    ///
    /// # Arguments
    /// * `path` - Relative path within the storage backend
    /// * `data` - Binary data to write
    ///
    /// # Returns
    /// Number of bytes written
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Delete data at the given path
    ///
    /// # Errors
    /// Returns `StoragePathNotFound` if the path doesn't exist
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List all paths under a given prefix, sorted
    ///
    /// Temp files of in-progress writes are included so callers can clean
    /// them up; use [`is_temp_path`] to filter them.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
