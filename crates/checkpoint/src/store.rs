//! Step-keyed checkpoint store
//!
//! Persists one file per step on top of a [`StorageBackend`]. File names are
//! the zero-padded step (`00000000000000000042.ckpt`) so lexicographic order
//! matches numeric order. Every file starts with a small header carrying the
//! step, creation time, payload size, and caller metadata.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use ckpt_core::{CheckpointEntry, Error, Result, Step};
use storage::{is_temp_path, LocalStorage, StorageBackend};
use tracing::{debug, instrument, warn};

/// Magic bytes for checkpoint files
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"CKPT";

/// Checkpoint file format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Extension of checkpoint files
pub const CHECKPOINT_EXTENSION: &str = ".ckpt";

/// magic + version + step + created_at + data_size + metadata_len
const FIXED_HEADER_LEN: usize = 4 + 4 + 8 + 8 + 8 + 4;

const STEP_DIGITS: usize = 20;

/// File name for a step
pub fn step_file_name(step: Step) -> String {
    format!("{:0width$}{}", step, CHECKPOINT_EXTENSION, width = STEP_DIGITS)
}

/// Parse a checkpoint file name back into its step
pub fn parse_step_file_name(name: &str) -> Option<Step> {
    let digits = name.strip_suffix(CHECKPOINT_EXTENSION)?;
    if digits.len() != STEP_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Checkpoint file header
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointHeader {
    pub version: u32,
    pub step: Step,
    pub created_at_ms: i64,
    pub data_size: u64,
    pub metadata_json: String,
}

impl CheckpointHeader {
    fn new(step: Step, data_size: usize, metadata: &HashMap<String, String>) -> Result<Self> {
        let metadata_json = serde_json::to_string(metadata)?;
        metadata_len(metadata_json.len())?;

        Ok(Self {
            version: CHECKPOINT_VERSION,
            step,
            created_at_ms: Utc::now().timestamp_millis(),
            data_size: data_size as u64,
            metadata_json,
        })
    }

    /// Encoded length of this header
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_LEN + self.metadata_json.len()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.created_at_ms)
            .single()
            .unwrap_or_default()
    }

    pub fn metadata(&self) -> Result<HashMap<String, String>> {
        Ok(serde_json::from_str(&self.metadata_json)?)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let metadata_bytes = self.metadata_json.as_bytes();
        let metadata_len = metadata_len(metadata_bytes.len())?;
        let mut buf = Vec::with_capacity(self.encoded_len());

        buf.extend_from_slice(&CHECKPOINT_MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.step.to_le_bytes());
        buf.extend_from_slice(&self.created_at_ms.to_le_bytes());
        buf.extend_from_slice(&self.data_size.to_le_bytes());
        buf.extend_from_slice(&metadata_len.to_le_bytes());
        buf.extend_from_slice(metadata_bytes);

        Ok(buf)
    }

    /// Validate the fixed part of a header and return the metadata length
    fn check_fixed(buf: &[u8], path: &str) -> Result<usize> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(corrupted(path, "truncated header"));
        }
        if buf[0..4] != CHECKPOINT_MAGIC {
            return Err(corrupted(path, "invalid checkpoint magic"));
        }

        let version = u32::from_le_bytes(le_array(&buf[4..8]));
        if version != CHECKPOINT_VERSION {
            return Err(corrupted(
                path,
                format!("unsupported checkpoint version {}", version),
            ));
        }

        Ok(u32::from_le_bytes(le_array(&buf[32..36])) as usize)
    }

    fn decode(buf: &[u8], path: &str) -> Result<Self> {
        let metadata_len = Self::check_fixed(buf, path)?;

        let end = FIXED_HEADER_LEN + metadata_len;
        if buf.len() < end {
            return Err(corrupted(path, "truncated metadata"));
        }
        let metadata_json = std::str::from_utf8(&buf[FIXED_HEADER_LEN..end])
            .map_err(|e| corrupted(path, format!("metadata is not UTF-8: {}", e)))?
            .to_string();

        Ok(Self {
            version: CHECKPOINT_VERSION,
            step: u64::from_le_bytes(le_array(&buf[8..16])),
            created_at_ms: i64::from_le_bytes(le_array(&buf[16..24])),
            data_size: u64::from_le_bytes(le_array(&buf[24..32])),
            metadata_json,
        })
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// Metadata length as stored in the fixed header
fn metadata_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        Error::Serialization(format!(
            "checkpoint metadata is {} bytes, the header allows at most {}",
            len,
            u32::MAX
        ))
    })
}

fn corrupted(path: &str, reason: impl Into<String>) -> Error {
    Error::CheckpointCorrupted {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Persists encoded checkpoints keyed by step
///
/// A store must be the only writer of its backend root. Two stores (or two
/// managers) writing the same directory is a precondition violation and the
/// resulting state is undefined.
#[derive(Clone)]
pub struct CheckpointStore {
    backend: Arc<dyn StorageBackend>,
}

impl CheckpointStore {
    /// Open a store on a backend
    ///
    /// Opening touches nothing on the backend, so a store may be opened for
    /// inspection next to a live writer. Leftover temp files are removed only
    /// by an explicit [`sweep_temp_files`](Self::sweep_temp_files).
    pub fn open(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Open a store on a local directory
    ///
    /// A missing directory reads as an empty store; the first write creates it.
    pub fn local<P: AsRef<Path>>(dir: P) -> Self {
        Self::open(Arc::new(LocalStorage::new(dir)))
    }

    /// All stored steps in ascending order
    pub async fn list_steps(&self) -> Result<Vec<Step>> {
        let mut steps: Vec<Step> = self
            .backend
            .list("")
            .await?
            .iter()
            .filter_map(|path| parse_step_file_name(path))
            .collect();
        steps.sort_unstable();
        Ok(steps)
    }

    /// Highest stored step
    pub async fn latest_step(&self) -> Result<Option<Step>> {
        Ok(self.list_steps().await?.last().copied())
    }

    /// Atomically write the payload for `step`
    ///
    /// Unless `overwrite_allowed` is set, fails with `AlreadyExists` when the
    /// store already holds `step` or any newer step, leaving the store
    /// untouched.
    #[instrument(skip(self, data, metadata), fields(size = data.len()))]
    pub async fn write(
        &self,
        step: Step,
        data: Bytes,
        metadata: &HashMap<String, String>,
        overwrite_allowed: bool,
    ) -> Result<CheckpointEntry> {
        if !overwrite_allowed {
            if let Some(latest) = self.latest_step().await? {
                if latest >= step {
                    return Err(Error::AlreadyExists { step, latest });
                }
            }
        }

        let header = CheckpointHeader::new(step, data.len(), metadata)?;
        let mut buf = header.encode()?;
        buf.extend_from_slice(&data);

        let path = step_file_name(step);
        let size_bytes = self.backend.write(&path, Bytes::from(buf)).await?;

        debug!(step, path = %path, size_bytes, "Checkpoint file written");

        Ok(CheckpointEntry {
            step,
            path,
            created_at: header.created_at(),
            size_bytes,
            metadata: metadata.clone(),
        })
    }

    /// Read the payload stored for `step`
    #[instrument(skip(self))]
    pub async fn read(&self, step: Step) -> Result<Bytes> {
        let path = step_file_name(step);
        let raw = self
            .backend
            .read(&path)
            .await
            .map_err(|e| not_found_as_step(e, step))?;

        let header = CheckpointHeader::decode(&raw, &path)?;
        if header.step != step {
            return Err(corrupted(
                &path,
                format!("header records step {}", header.step),
            ));
        }

        let payload = raw.slice(header.encoded_len()..);
        if payload.len() as u64 != header.data_size {
            return Err(corrupted(
                &path,
                format!(
                    "payload is {} bytes, header expects {}",
                    payload.len(),
                    header.data_size
                ),
            ));
        }
        Ok(payload)
    }

    /// Read the header of `step` without loading its payload
    pub async fn header(&self, step: Step) -> Result<CheckpointHeader> {
        let path = step_file_name(step);
        let fixed = self
            .backend
            .read_prefix(&path, FIXED_HEADER_LEN)
            .await
            .map_err(|e| not_found_as_step(e, step))?;
        let metadata_len = CheckpointHeader::check_fixed(&fixed, &path)?;

        let full = self
            .backend
            .read_prefix(&path, FIXED_HEADER_LEN + metadata_len)
            .await
            .map_err(|e| not_found_as_step(e, step))?;
        CheckpointHeader::decode(&full, &path)
    }

    /// Describe the checkpoint stored for `step`
    pub async fn entry(&self, step: Step) -> Result<CheckpointEntry> {
        let header = self.header(step).await?;
        Ok(CheckpointEntry {
            step,
            path: step_file_name(step),
            created_at: header.created_at(),
            size_bytes: header.encoded_len() as u64 + header.data_size,
            metadata: header.metadata()?,
        })
    }

    /// Describe every stored checkpoint, ascending by step
    pub async fn entries(&self) -> Result<Vec<CheckpointEntry>> {
        let mut entries = Vec::new();
        for step in self.list_steps().await? {
            entries.push(self.entry(step).await?);
        }
        Ok(entries)
    }

    /// Delete the checkpoint stored for `step`
    pub async fn delete(&self, step: Step) -> Result<()> {
        self.backend
            .delete(&step_file_name(step))
            .await
            .map_err(|e| not_found_as_step(e, step))?;
        debug!(step, "Deleted checkpoint");
        Ok(())
    }

    /// Remove temp files left by writes that never reached their rename
    pub async fn sweep_temp_files(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.backend.list("").await? {
            if !is_temp_path(&path) {
                continue;
            }
            match self.backend.delete(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path, error = %e, "Failed to remove temp file"),
            }
        }
        Ok(removed)
    }
}

fn not_found_as_step(e: Error, step: Step) -> Error {
    match e {
        Error::StoragePathNotFound { .. } => Error::CheckpointNotFound { step },
        other => other,
    }
}
