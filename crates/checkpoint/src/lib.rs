//! Step-keyed checkpointing for training state
//!
//! Serializes nested state trees, stores one file per training step, and
//! manages saves through a single background writer with retention.

pub mod blocking;
pub mod codec;
pub mod manager;
pub mod store;
pub mod writer;

pub use blocking::BlockingCheckpointManager;
pub use manager::{
    CheckpointManager, CheckpointManagerConfig, CheckpointManagerHandle, ManagerState,
    SaveOptions, SaveOutcome,
};
pub use store::{CheckpointHeader, CheckpointStore};
pub use writer::SaveHandle;
