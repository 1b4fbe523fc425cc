//! The [`CheckpointStore`] trait — backend abstraction for checkpoint
//! persistence.
//!
//! Implementations must be `Send + Sync`; executions checkpoint
//! concurrently and each execution's chain is independent. A returned
//! `checkpoint_id` from [`save`](CheckpointStore::save) must be durable:
//! for filesystem backends the snapshot is fsynced before it is renamed
//! into place.

use crate::checkpoint::{Checkpoint, CheckpointSummary};
use crate::error::Result;
use async_trait::async_trait;

/// Storage backend for execution checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint atomically and return its id.
    ///
    /// The snapshot must be durable before this returns; index maintenance
    /// may lag (a rebuild from snapshots must always be possible).
    async fn save(&self, checkpoint: Checkpoint) -> Result<String>;

    /// Load a checkpoint by id, verifying its content checksum.
    async fn load(&self, execution_id: &str, checkpoint_id: &str) -> Result<Checkpoint>;

    /// The newest checkpoint for an execution, or `None` if it has none.
    ///
    /// Backends with an index fall back to scanning snapshots when the
    /// index is unreadable.
    async fn latest_for(&self, execution_id: &str) -> Result<Option<Checkpoint>>;

    /// All checkpoints recorded for an execution, oldest first.
    async fn list_for(&self, execution_id: &str) -> Result<Vec<CheckpointSummary>>;

    /// Remove every snapshot and the index for an execution.
    async fn delete_execution(&self, execution_id: &str) -> Result<()>;
}
