//! Background checkpoint writer
//!
//! A single Tokio task drains a FIFO queue of encoded checkpoints. Because
//! there is exactly one consumer, at most one write touches the store at a
//! time and saves complete in the order they were submitted.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ckpt_core::{CheckpointEntry, Error, Result, RetentionPolicy, Step};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::store::CheckpointStore;

/// State shared between the manager and its writer task
#[derive(Default)]
pub(crate) struct SharedState {
    /// Retained checkpoints indexed by step
    pub(crate) index: RwLock<BTreeMap<Step, CheckpointEntry>>,

    /// Saves submitted but not yet completed
    pub(crate) pending: AtomicUsize,

    /// Restores currently running
    pub(crate) restoring: AtomicUsize,

    /// Failures whose completion handle was dropped before delivery
    pub(crate) failures: Mutex<VecDeque<(Step, Error)>>,
}

/// Request to write a checkpoint
#[derive(Debug)]
pub(crate) struct WriteRequest {
    /// Training step
    pub(crate) step: Step,

    /// Encoded state tree
    pub(crate) data: Bytes,

    /// Caller supplied metadata stored in the file header
    pub(crate) metadata: HashMap<String, String>,

    /// Retention applied once the write is durable
    pub(crate) policy: RetentionPolicy,

    /// Receives the outcome of this write
    pub(crate) completion: oneshot::Sender<Result<CheckpointEntry>>,
}

/// Work items processed by the writer task, strictly in order
#[derive(Debug)]
enum WriterCommand {
    Write(WriteRequest),

    /// Acknowledged once every earlier command has been processed
    Flush(oneshot::Sender<()>),
}

/// Completion handle for a queued save
///
/// Resolves to the written [`CheckpointEntry`] or the error the write
/// produced. If the handle is dropped before the write fails, the failure is
/// reported by the manager's next `wait_until_finished`.
#[derive(Debug)]
#[must_use = "dropping a SaveHandle defers error reporting to wait_until_finished"]
pub struct SaveHandle {
    step: Step,
    rx: oneshot::Receiver<Result<CheckpointEntry>>,
}

impl SaveHandle {
    /// Step this save writes
    pub fn step(&self) -> Step {
        self.step
    }

    /// Wait for the save to become durable
    pub async fn wait(self) -> Result<CheckpointEntry> {
        self.rx.await.map_err(|_| Error::ChannelClosed {
            channel: format!("completion of step {}", self.step),
        })?
    }

    /// Wait for the save, giving up after `timeout`
    ///
    /// A timeout does not cancel or roll back the write; the store's atomic
    /// rename still guarantees it is either fully visible or not at all.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<CheckpointEntry> {
        let step = self.step;
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("save of step {}", step),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }
}

/// Async checkpoint writer using Tokio
pub(crate) struct AsyncCheckpointWriter {
    tx: mpsc::Sender<WriterCommand>,
    task: JoinHandle<()>,
    shared: Arc<SharedState>,
}

impl AsyncCheckpointWriter {
    /// Spawn the writer task on the current runtime
    pub(crate) fn spawn(store: CheckpointStore, shared: Arc<SharedState>, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel::<WriterCommand>(queue_depth.max(1));
        let task = tokio::spawn(Self::writer_loop(rx, store, shared.clone()));

        Self { tx, task, shared }
    }

    /// Queue an encoded checkpoint behind every earlier submission
    pub(crate) async fn submit(
        &self,
        step: Step,
        data: Bytes,
        metadata: HashMap<String, String>,
        policy: RetentionPolicy,
    ) -> Result<SaveHandle> {
        let (completion, rx) = oneshot::channel();
        let request = WriteRequest {
            step,
            data,
            metadata,
            policy,
            completion,
        };

        // Counted only once a slot is held, so a caller cancelled while the
        // queue is full leaves no phantom pending save
        let permit = self.tx.reserve().await.map_err(|e| Error::ChannelClosed {
            channel: format!("checkpoint write queue: {}", e),
        })?;
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        permit.send(WriterCommand::Write(request));

        debug!(step, "Queued checkpoint for async write");
        Ok(SaveHandle { step, rx })
    }

    /// Wait until every previously submitted write has completed
    pub(crate) async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Flush(ack_tx))
            .await
            .map_err(|e| Error::ChannelClosed {
                channel: format!("checkpoint write queue: {}", e),
            })?;

        ack_rx.await.map_err(|_| Error::ChannelClosed {
            channel: "checkpoint flush acknowledgement".to_string(),
        })
    }

    /// Close the queue and wait for the task to drain it
    pub(crate) async fn shutdown(self) -> Result<()> {
        drop(self.tx);
        self.task.await.map_err(|e| Error::Internal {
            message: format!("checkpoint writer task failed: {}", e),
        })
    }

    /// Main writer loop
    async fn writer_loop(
        mut rx: mpsc::Receiver<WriterCommand>,
        store: CheckpointStore,
        shared: Arc<SharedState>,
    ) {
        info!("Checkpoint writer started");

        while let Some(command) = rx.recv().await {
            match command {
                WriterCommand::Write(request) => {
                    Self::handle_write(&store, &shared, request).await;
                }
                WriterCommand::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        info!("Checkpoint writer stopped");
    }

    async fn handle_write(store: &CheckpointStore, shared: &SharedState, request: WriteRequest) {
        let WriteRequest {
            step,
            data,
            metadata,
            policy,
            completion,
        } = request;

        let result = Self::write_checkpoint(store, shared, step, data, &metadata, &policy).await;
        if let Err(e) = &result {
            error!(step, error = %e, "Failed to write checkpoint");
        }

        shared.pending.fetch_sub(1, Ordering::SeqCst);

        // A dropped handle hands the outcome back; keep failures for the
        // next wait_until_finished
        if let Err(Err(e)) = completion.send(result) {
            shared.failures.lock().push_back((step, e));
        }
    }

    /// Write a single checkpoint and apply retention
    #[instrument(skip(store, shared, data, metadata, policy), fields(size_bytes = data.len()))]
    async fn write_checkpoint(
        store: &CheckpointStore,
        shared: &SharedState,
        step: Step,
        data: Bytes,
        metadata: &HashMap<String, String>,
        policy: &RetentionPolicy,
    ) -> Result<CheckpointEntry> {
        let start = Instant::now();

        let entry = store
            .write(step, data, metadata, policy.overwrite_allowed)
            .await?;

        let elapsed = start.elapsed();
        info!(
            step,
            size_bytes = entry.size_bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            throughput_mbps = (entry.size_bytes as f64 / 1024.0 / 1024.0) / elapsed.as_secs_f64().max(1e-9),
            "Checkpoint write complete"
        );

        shared.index.write().insert(step, entry.clone());
        Self::prune(store, shared, policy).await;

        Ok(entry)
    }

    /// Delete the oldest checkpoints beyond the policy's limit
    ///
    /// Failures are logged and leave the entry indexed; they never fail the
    /// save that triggered pruning.
    async fn prune(store: &CheckpointStore, shared: &SharedState, policy: &RetentionPolicy) {
        let doomed = {
            let index = shared.index.read();
            let steps: Vec<Step> = index.keys().copied().collect();
            policy.steps_to_prune(&steps)
        };

        for step in doomed {
            match store.delete(step).await {
                Ok(()) => {
                    shared.index.write().remove(&step);
                    debug!(step, "Pruned old checkpoint");
                }
                Err(Error::CheckpointNotFound { .. }) => {
                    shared.index.write().remove(&step);
                    warn!(step, "Checkpoint selected for pruning was already gone");
                }
                Err(e) => {
                    warn!(step, error = %e, "Failed to delete old checkpoint");
                }
            }
        }
    }
}
