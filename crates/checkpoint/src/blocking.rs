//! Synchronous facade over [`CheckpointManager`]
//!
//! Training loops that do not run inside an async context use this type. It
//! owns its own multi-thread Tokio runtime, which also hosts the background
//! writer, so async saves keep progressing between calls.

use std::collections::HashMap;
use std::time::Duration;

use ckpt_core::{CheckpointEntry, Error, Result, RetentionPolicy, Shape, StateTree, Step};
use tokio::runtime::{Builder, Runtime};
use tracing::{info, warn};

use crate::manager::{CheckpointManager, CheckpointManagerConfig, ManagerState, SaveOptions, SaveOutcome};
use crate::writer::SaveHandle;

/// Blocking checkpoint manager backed by a dedicated runtime
pub struct BlockingCheckpointManager {
    inner: Option<CheckpointManager>,
    runtime: Option<Runtime>,
}

impl BlockingCheckpointManager {
    /// Build the runtime and open the manager on it
    ///
    /// Panics if called from within an async context, like any blocking
    /// call into a Tokio runtime.
    pub fn new(config: CheckpointManagerConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .thread_name("ckpt-writer")
            .build()
            .map_err(|e| Error::Internal {
                message: format!("Failed to build Tokio runtime: {}", e),
            })?;

        let inner = runtime.block_on(CheckpointManager::new(config))?;

        Ok(Self {
            inner: Some(inner),
            runtime: Some(runtime),
        })
    }

    fn parts(&self) -> Result<(&CheckpointManager, &Runtime)> {
        match (&self.inner, &self.runtime) {
            (Some(inner), Some(runtime)) => Ok((inner, runtime)),
            _ => Err(Error::Internal {
                message: "checkpoint manager already closed".to_string(),
            }),
        }
    }

    /// Save using the configured mode; async mode returns once queued
    pub fn save(&self, tree: &StateTree, step: Step) -> Result<Option<CheckpointEntry>> {
        let (inner, runtime) = self.parts()?;
        match runtime.block_on(inner.save(tree, step))? {
            SaveOutcome::Saved(entry) => Ok(Some(entry)),
            SaveOutcome::Queued(handle) => {
                // Errors are reported by wait_until_finished
                drop(handle);
                Ok(None)
            }
        }
    }

    /// Save with a retention policy other than the configured one
    pub fn save_with_policy(
        &self,
        tree: &StateTree,
        step: Step,
        policy: &RetentionPolicy,
    ) -> Result<Option<CheckpointEntry>> {
        let (inner, runtime) = self.parts()?;
        match runtime.block_on(inner.save_with_policy(tree, step, policy))? {
            SaveOutcome::Saved(entry) => Ok(Some(entry)),
            SaveOutcome::Queued(_) => Ok(None),
        }
    }

    /// Queue a save and return its completion handle
    pub fn submit(&self, tree: &StateTree, step: Step, metadata: HashMap<String, String>) -> Result<SaveHandle> {
        let (inner, runtime) = self.parts()?;
        let options = SaveOptions {
            metadata,
            ..Default::default()
        };
        runtime.block_on(inner.save_async(tree, step, options))
    }

    /// Block until the handle's save completes
    pub fn wait(&self, handle: SaveHandle) -> Result<CheckpointEntry> {
        let (_, runtime) = self.parts()?;
        runtime.block_on(handle.wait())
    }

    pub fn wait_until_finished(&self) -> Result<()> {
        let (inner, runtime) = self.parts()?;
        runtime.block_on(inner.wait_until_finished())
    }

    pub fn wait_until_finished_timeout(&self, timeout: Duration) -> Result<()> {
        let (inner, runtime) = self.parts()?;
        runtime.block_on(inner.wait_until_finished_timeout(timeout))
    }

    pub fn restore(&self, step: Option<Step>, template: Option<&Shape>) -> Result<StateTree> {
        let (inner, runtime) = self.parts()?;
        runtime.block_on(inner.restore(step, template))
    }

    pub fn delete(&self, step: Step) -> Result<()> {
        let (inner, runtime) = self.parts()?;
        runtime.block_on(inner.delete(step))
    }

    pub fn should_save(&self, step: Step) -> bool {
        self.inner.as_ref().is_some_and(|m| m.should_save(step))
    }

    pub fn latest_step(&self) -> Option<Step> {
        self.inner.as_ref().and_then(|m| m.latest_step())
    }

    pub fn all_steps(&self) -> Vec<Step> {
        self.inner.as_ref().map(|m| m.all_steps()).unwrap_or_default()
    }

    pub fn state(&self) -> ManagerState {
        self.inner.as_ref().map_or(ManagerState::Idle, |m| m.state())
    }

    /// Wait for pending saves and stop the writer
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let result = match (self.inner.take(), self.runtime.as_ref()) {
            (Some(inner), Some(runtime)) => runtime.block_on(inner.close()),
            _ => Ok(()),
        };

        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(5));
            info!("Checkpoint runtime shut down");
        }
        result
    }
}

impl Drop for BlockingCheckpointManager {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "Pending checkpoint saves failed during shutdown");
        }
    }
}
