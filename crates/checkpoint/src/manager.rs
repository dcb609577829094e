//! Checkpoint manager for step-keyed saves and restores
//!
//! The manager owns a [`CheckpointStore`] and a single background writer.
//! State trees are encoded on the caller, then queued to the writer, so
//! writes never interleave and complete in submission order. Retention is
//! applied after every successful write.
//!
//! A store directory must be owned by exactly one manager at a time. Pointing
//! two managers at the same directory is a precondition violation and is not
//! detected.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use ckpt_core::{
    CheckpointConfig, CheckpointEntry, Error, Result, RetentionPolicy, SaveMode, Shape, StateTree,
    Step,
};
use storage::{LocalStorage, StorageBackend};
use tracing::{debug, info, warn};

use crate::codec;
use crate::store::CheckpointStore;
use crate::writer::{AsyncCheckpointWriter, SaveHandle, SharedState};

/// Checkpoint manager configuration
#[derive(Debug, Clone)]
pub struct CheckpointManagerConfig {
    /// Directory holding one file per step
    pub base_path: PathBuf,

    /// Retention applied after each save unless overridden per save
    pub policy: RetentionPolicy,

    /// Whether `save` waits for durability
    pub save_mode: SaveMode,

    /// `should_save` accepts steps divisible by this interval
    pub save_interval_steps: u64,

    /// Capacity of the writer queue
    pub queue_depth: usize,

    /// Upper bound on a synchronous save
    pub save_timeout: Option<Duration>,
}

impl Default for CheckpointManagerConfig {
    fn default() -> Self {
        CheckpointManagerConfig::from(&CheckpointConfig::default())
    }
}

impl From<&CheckpointConfig> for CheckpointManagerConfig {
    fn from(config: &CheckpointConfig) -> Self {
        Self {
            base_path: config.base_path.clone(),
            policy: config.retention.clone(),
            save_mode: config.save_mode,
            save_interval_steps: config.save_interval_steps,
            queue_depth: config.queue_depth,
            save_timeout: config.save_timeout,
        }
    }
}

impl CheckpointManagerConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Default::default()
        }
    }

    pub fn with_policy(mut self, policy: RetentionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_save_mode(mut self, mode: SaveMode) -> Self {
        self.save_mode = mode;
        self
    }

    pub fn with_save_interval(mut self, steps: u64) -> Self {
        self.save_interval_steps = steps;
        self
    }

    pub fn with_save_timeout(mut self, timeout: Duration) -> Self {
        self.save_timeout = Some(timeout);
        self
    }

    fn validate(&self) -> Result<()> {
        self.policy.validate()?;
        if self.save_interval_steps == 0 {
            return Err(Error::InvalidConfig {
                message: "save_interval_steps must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Per-save overrides
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Retention to apply instead of the configured policy
    pub policy: Option<RetentionPolicy>,

    /// Metadata stored in the checkpoint header
    pub metadata: HashMap<String, String>,
}

impl SaveOptions {
    pub fn with_policy(mut self, policy: RetentionPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// What the manager is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,

    /// At least one save is queued or being written
    Saving,

    /// A restore is reading from the store
    Restoring,
}

/// Result of [`CheckpointManager::save`]
#[derive(Debug)]
pub enum SaveOutcome {
    /// Synchronous save: the checkpoint is durable
    Saved(CheckpointEntry),

    /// Asynchronous save: the checkpoint is queued
    Queued(SaveHandle),
}

impl SaveOutcome {
    /// Resolve to the written entry, waiting if the save was queued
    pub async fn wait(self) -> Result<CheckpointEntry> {
        match self {
            SaveOutcome::Saved(entry) => Ok(entry),
            SaveOutcome::Queued(handle) => handle.wait().await,
        }
    }
}

/// Decrements the restore counter when dropped
struct RestoreGuard<'a>(&'a SharedState);

impl<'a> RestoreGuard<'a> {
    fn enter(shared: &'a SharedState) -> Self {
        shared.restoring.fetch_add(1, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        self.0.restoring.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Checkpoint manager for handling async writes and retention
pub struct CheckpointManager {
    /// Configuration
    config: CheckpointManagerConfig,

    /// Step-keyed storage
    store: CheckpointStore,

    /// Retained-step index, pending counters, undelivered failures
    shared: Arc<SharedState>,

    /// Background writer
    writer: AsyncCheckpointWriter,
}

impl CheckpointManager {
    /// Create a checkpoint manager on a local directory
    ///
    /// Must be called within a Tokio runtime; the writer task is spawned on it.
    pub async fn new(config: CheckpointManagerConfig) -> Result<Self> {
        config.validate()?;

        // Create checkpoint directory
        tokio::fs::create_dir_all(&config.base_path).await?;

        let backend = Arc::new(LocalStorage::new(&config.base_path));
        Self::with_backend(config, backend).await
    }

    /// Create a checkpoint manager on an arbitrary backend
    pub async fn with_backend(
        config: CheckpointManagerConfig,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        config.validate()?;

        let store = CheckpointStore::open(backend);

        // Temp files left at open time belong to writes that never finished
        let swept = store.sweep_temp_files().await?;
        if swept > 0 {
            info!(count = swept, "Removed temp files of interrupted checkpoint writes");
        }

        let shared = Arc::new(SharedState::default());

        let entries = store.entries().await?;
        info!(
            path = %config.base_path.display(),
            checkpoints = entries.len(),
            latest_step = ?entries.last().map(|e| e.step),
            "Checkpoint manager opened"
        );
        shared
            .index
            .write()
            .extend(entries.into_iter().map(|e| (e.step, e)));

        let writer = AsyncCheckpointWriter::spawn(store.clone(), shared.clone(), config.queue_depth);

        Ok(Self {
            config,
            store,
            shared,
            writer,
        })
    }

    pub fn config(&self) -> &CheckpointManagerConfig {
        &self.config
    }

    /// Current state of the manager
    pub fn state(&self) -> ManagerState {
        if self.shared.restoring.load(Ordering::SeqCst) > 0 {
            ManagerState::Restoring
        } else if self.shared.pending.load(Ordering::SeqCst) > 0 {
            ManagerState::Saving
        } else {
            ManagerState::Idle
        }
    }

    /// Number of saves queued or in progress
    pub fn pending_saves(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Whether the configured interval calls for a checkpoint at `step`
    pub fn should_save(&self, step: Step) -> bool {
        step % self.config.save_interval_steps == 0
    }

    /// Save a state tree at `step` using the configured mode and policy
    pub async fn save(&self, tree: &StateTree, step: Step) -> Result<SaveOutcome> {
        self.save_with(tree, step, SaveOptions::default()).await
    }

    /// Save with a retention policy other than the configured one
    pub async fn save_with_policy(
        &self,
        tree: &StateTree,
        step: Step,
        policy: &RetentionPolicy,
    ) -> Result<SaveOutcome> {
        let options = SaveOptions::default().with_policy(policy.clone());
        self.save_with(tree, step, options).await
    }

    /// Save with user metadata recorded in the checkpoint header
    pub async fn save_with_metadata(
        &self,
        tree: &StateTree,
        step: Step,
        metadata: HashMap<String, String>,
    ) -> Result<SaveOutcome> {
        let options = SaveOptions {
            metadata,
            ..Default::default()
        };
        self.save_with(tree, step, options).await
    }

    /// Save with per-save overrides
    pub async fn save_with(
        &self,
        tree: &StateTree,
        step: Step,
        options: SaveOptions,
    ) -> Result<SaveOutcome> {
        let handle = self.save_async(tree, step, options).await?;

        match self.config.save_mode {
            SaveMode::Async => Ok(SaveOutcome::Queued(handle)),
            SaveMode::Sync => {
                let entry = match self.config.save_timeout {
                    Some(timeout) => handle.wait_timeout(timeout).await?,
                    None => handle.wait().await?,
                };
                Ok(SaveOutcome::Saved(entry))
            }
        }
    }

    /// Encode `tree` and queue it behind every earlier save
    ///
    /// Returns as soon as the bytes are handed to the writer, regardless of
    /// the configured mode.
    pub async fn save_async(
        &self,
        tree: &StateTree,
        step: Step,
        options: SaveOptions,
    ) -> Result<SaveHandle> {
        let policy = match options.policy {
            Some(policy) => {
                policy.validate()?;
                policy
            }
            None => self.config.policy.clone(),
        };

        let data = codec::encode(tree)?;
        debug!(step, size_bytes = data.len(), leaves = tree.num_leaves(), "Encoded state tree");

        self.writer.submit(step, data, options.metadata, policy).await
    }

    /// Block until every save submitted so far has completed
    ///
    /// Returns the oldest failure not yet delivered through a [`SaveHandle`].
    pub async fn wait_until_finished(&self) -> Result<()> {
        self.writer.flush().await?;

        let mut failures = self.shared.failures.lock();
        match failures.pop_front() {
            Some((step, e)) => {
                if !failures.is_empty() {
                    warn!(
                        step,
                        remaining = failures.len(),
                        "Multiple checkpoint saves failed; reporting the oldest"
                    );
                }
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Like [`wait_until_finished`](Self::wait_until_finished), bounded by `timeout`
    ///
    /// A timeout leaves in-progress writes running.
    pub async fn wait_until_finished_timeout(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.wait_until_finished())
            .await
            .map_err(|_| Error::Timeout {
                operation: "wait for pending checkpoint saves".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    /// Restore the tree saved at `step`, or at the latest step if `None`
    ///
    /// Queued saves are flushed first so the latest step includes them. With
    /// a template the result matches its structure exactly or fails with
    /// `SchemaMismatch`.
    pub async fn restore(&self, step: Option<Step>, template: Option<&Shape>) -> Result<StateTree> {
        self.writer.flush().await?;
        let _guard = RestoreGuard::enter(&self.shared);

        let step = match step {
            Some(step) => {
                if !self.shared.index.read().contains_key(&step) {
                    return Err(Error::CheckpointNotFound { step });
                }
                step
            }
            None => self.latest_step().ok_or(Error::NoCheckpointForRecovery)?,
        };

        let data = self.store.read(step).await?;
        let tree = codec::decode(&data, template)?;

        info!(
            step,
            size_bytes = data.len(),
            leaves = tree.num_leaves(),
            templated = template.is_some(),
            "Checkpoint restored"
        );
        Ok(tree)
    }

    /// Highest retained step
    pub fn latest_step(&self) -> Option<Step> {
        self.shared.index.read().keys().next_back().copied()
    }

    /// Retained steps in ascending order
    pub fn all_steps(&self) -> Vec<Step> {
        self.shared.index.read().keys().copied().collect()
    }

    /// Get checkpoint by step
    pub fn entry(&self, step: Step) -> Option<CheckpointEntry> {
        self.shared.index.read().get(&step).cloned()
    }

    /// Get all retained checkpoints
    pub fn entries(&self) -> Vec<CheckpointEntry> {
        self.shared.index.read().values().cloned().collect()
    }

    /// Delete the checkpoint at `step` after pending saves complete
    pub async fn delete(&self, step: Step) -> Result<()> {
        self.writer.flush().await?;
        self.store.delete(step).await?;
        self.shared.index.write().remove(&step);
        info!(step, "Checkpoint deleted");
        Ok(())
    }

    /// Rebuild the retained-step index from the store
    pub async fn reload(&self) -> Result<()> {
        self.writer.flush().await?;
        let entries = self.store.entries().await?;
        let mut index = self.shared.index.write();
        index.clear();
        index.extend(entries.into_iter().map(|e| (e.step, e)));
        debug!(checkpoints = index.len(), "Checkpoint index reloaded");
        Ok(())
    }

    /// The underlying store
    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Wait for pending saves, then stop the writer
    pub async fn close(self) -> Result<()> {
        let finished = self.wait_until_finished().await;
        self.writer.shutdown().await?;
        finished
    }
}

/// Thread-safe handle to checkpoint manager
pub type CheckpointManagerHandle = Arc<CheckpointManager>;
