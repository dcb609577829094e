//! Core type definitions shared by the store and the manager

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Error, Result};

/// Training step counter identifying a checkpoint
pub type Step = u64;

/// A checkpoint that has been durably written to a store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    /// Training step at checkpoint
    pub step: Step,

    /// Storage path, relative to the store root
    pub path: String,

    /// Timestamp when checkpoint was created
    pub created_at: DateTime<Utc>,

    /// Total file size in bytes (header included)
    pub size_bytes: u64,

    /// Caller supplied metadata
    pub metadata: HashMap<String, String>,
}

/// Rule bounding how many checkpoints are retained
///
/// Applied after every successful save. Pruning removes the oldest steps
/// first; steps that are a multiple of `keep_period` are never pruned and do
/// not count against `max_keep`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Maximum number of checkpoints to keep (`None` keeps everything)
    pub max_keep: Option<usize>,

    /// Allow writing a step at or below the latest stored step
    pub overwrite_allowed: bool,

    /// Steps divisible by this period are kept permanently
    pub keep_period: Option<u64>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_keep: Some(5),
            overwrite_allowed: false,
            keep_period: None,
        }
    }
}

impl RetentionPolicy {
    /// Keep every checkpoint
    pub fn unbounded() -> Self {
        Self {
            max_keep: None,
            ..Default::default()
        }
    }

    /// Keep only the `n` most recent checkpoints
    pub fn keep_last(n: usize) -> Self {
        Self {
            max_keep: Some(n),
            ..Default::default()
        }
    }

    pub fn with_overwrite(mut self, allowed: bool) -> Self {
        self.overwrite_allowed = allowed;
        self
    }

    pub fn with_keep_period(mut self, period: u64) -> Self {
        self.keep_period = Some(period);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_keep == Some(0) {
            return Err(Error::InvalidConfig {
                message: "max_keep must be positive or unbounded".to_string(),
            });
        }
        if self.keep_period == Some(0) {
            return Err(Error::InvalidConfig {
                message: "keep_period must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Whether `step` is exempt from pruning
    pub fn is_permanent(&self, step: Step) -> bool {
        matches!(self.keep_period, Some(period) if period > 0 && step % period == 0)
    }

    /// Select the steps to delete from an ascending list of retained steps
    pub fn steps_to_prune(&self, steps: &[Step]) -> Vec<Step> {
        let Some(max_keep) = self.max_keep else {
            return Vec::new();
        };

        let candidates: Vec<Step> = steps
            .iter()
            .copied()
            .filter(|s| !self.is_permanent(*s))
            .collect();

        let excess = candidates.len().saturating_sub(max_keep);
        candidates.into_iter().take(excess).collect()
    }
}
