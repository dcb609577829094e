//! Storage - Pluggable storage backends for checkpoint files
//!
//! Provides async storage operations over a local directory. Writes are
//! atomic: data lands in a hidden temp file which is synced and then renamed
//! into place, so readers never observe a partially written file.
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageBackend, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> ckpt_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/checkpoints");
//! storage.write("00000000000000000001.ckpt", Bytes::from(vec![1, 2, 3])).await?;
//! let data = storage.read("00000000000000000001.ckpt").await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;

pub use backend::{is_temp_path, StorageBackend};
pub use local::LocalStorage;
