//! Checkpoint Core - Foundation for step-keyed checkpointing
//!
//! Provides the state-tree data model, shared types, error handling, and
//! configuration used by the storage and checkpoint crates.

pub mod config;
pub mod error;
pub mod tree;
pub mod types;

pub use config::{CheckpointConfig, LoggingConfig, RuntimeConfig, SaveMode};
pub use error::{Error, MismatchReason, Result};
pub use tree::{ArrayValue, DType, Node, Scalar, ScalarKind, Shape, StateTree};
pub use types::*;
