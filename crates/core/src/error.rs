//! Error types for checkpoint storage and restore

use thiserror::Error;

use crate::types::Step;

/// Result type alias using the checkpoint Error
pub type Result<T> = std::result::Result<T, Error>;

/// Why a stored tree disagrees with a restore template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MismatchReason {
    /// The template requires a field the stored tree does not have
    Missing,

    /// The stored tree has a field the template does not declare
    Unexpected,

    /// Both sides have the field but disagree on its kind, dtype, or dims
    Incompatible { expected: String, found: String },
}

impl std::fmt::Display for MismatchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MismatchReason::Missing => write!(f, "required by template but missing from checkpoint"),
            MismatchReason::Unexpected => write!(f, "present in checkpoint but absent from template"),
            MismatchReason::Incompatible { expected, found } => {
                write!(f, "expected {}, found {}", expected, found)
            }
        }
    }
}

/// Core error type for checkpointing
#[derive(Error, Debug)]
pub enum Error {
    // Checkpoint errors
    #[error("Checkpoint not found: step {step}")]
    CheckpointNotFound { step: Step },

    #[error("Checkpoint already exists: step {step} (latest stored step is {latest})")]
    AlreadyExists { step: Step, latest: Step },

    #[error("Checkpoint corrupted: {path} - {reason}")]
    CheckpointCorrupted { path: String, reason: String },

    #[error("No valid checkpoint found for recovery")]
    NoCheckpointForRecovery,

    // Restore errors
    #[error("Schema mismatch at `{path}`: {reason}")]
    SchemaMismatch { path: String, reason: MismatchReason },

    #[error("Invalid array: {message}")]
    InvalidArray { message: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    // Timeout errors
    #[error("Operation timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    // Channel errors
    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },
}

impl Error {
    /// Returns true if this error is retryable
    ///
    /// The manager itself never retries a write; this is a hint for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Storage { .. } | Error::Timeout { .. } | Error::Io(_)
        )
    }

    /// Returns true if this error indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CheckpointCorrupted { .. }
                | Error::InvalidConfig { .. }
                | Error::Internal { .. }
        )
    }

    /// Returns true if the requested checkpoint or path does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::CheckpointNotFound { .. }
                | Error::NoCheckpointForRecovery
                | Error::StoragePathNotFound { .. }
        )
    }

    /// Field path reported by a schema mismatch, if this is one
    pub fn mismatch_path(&self) -> Option<&str> {
        match self {
            Error::SchemaMismatch { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
