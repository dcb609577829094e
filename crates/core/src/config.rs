//! Checkpointing configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result, RetentionPolicy};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Checkpoint settings
    pub checkpoint: CheckpointConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Parse configuration from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.checkpoint.validate()
    }
}

/// How `save` hands work to the background writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    /// `save` returns once the checkpoint is durable
    #[default]
    Sync,

    /// `save` returns once the encoded bytes are queued
    Async,
}

/// Checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory holding one file per step
    pub base_path: PathBuf,

    /// Retention applied after every save
    pub retention: RetentionPolicy,

    /// Sync or async saves
    pub save_mode: SaveMode,

    /// Only save on steps divisible by this interval
    pub save_interval_steps: u64,

    /// Number of encoded checkpoints that may wait for the writer
    pub queue_depth: usize,

    /// Upper bound on a synchronous save
    #[serde(with = "option_duration_ms")]
    pub save_timeout: Option<Duration>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./checkpoints"),
            retention: RetentionPolicy::default(),
            save_mode: SaveMode::Sync,
            save_interval_steps: 1,
            queue_depth: 16,
            save_timeout: None,
        }
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> Result<()> {
        self.retention.validate()?;
        if self.save_interval_steps == 0 {
            return Err(Error::InvalidConfig {
                message: "save_interval_steps must be positive".to_string(),
            });
        }
        if self.queue_depth == 0 {
            return Err(Error::InvalidConfig {
                message: "queue_depth must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `tracing` filter when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "checkpoint=info,storage=info".to_string(),
        }
    }
}

/// Optional duration serialized as milliseconds
mod option_duration_ms {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
