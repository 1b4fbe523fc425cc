//! Error types for checkpoint persistence.

use thiserror::Error;

/// Convenience result type using [`CheckpointError`].
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors raised by checkpoint stores.
///
/// Corruption variants are recoverable via [`FsCheckpointStore::reconcile`]
/// (the index can always be rebuilt from snapshot files); everything else
/// surfaces to the caller unchanged.
///
/// [`FsCheckpointStore::reconcile`]: crate::fs::FsCheckpointStore::reconcile
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// No checkpoint with this id exists for the execution.
    #[error("checkpoint '{checkpoint_id}' not found for execution '{execution_id}'")]
    NotFound {
        execution_id: String,
        checkpoint_id: String,
    },

    /// Snapshot content does not match its recorded checksum.
    #[error("checkpoint '{checkpoint_id}' is corrupt: checksum mismatch")]
    CorruptCheckpoint { checkpoint_id: String },

    /// The per-execution index is unreadable and could not be rebuilt.
    #[error("checkpoint index for execution '{execution_id}' is corrupt: {detail}")]
    CorruptIndex {
        execution_id: String,
        detail: String,
    },

    /// Filesystem operation failed.
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot or index (de)serialization failed.
    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CheckpointError {
    pub fn not_found(execution_id: impl Into<String>, checkpoint_id: impl Into<String>) -> Self {
        Self::NotFound {
            execution_id: execution_id.into(),
            checkpoint_id: checkpoint_id.into(),
        }
    }

    pub fn corrupt(checkpoint_id: impl Into<String>) -> Self {
        Self::CorruptCheckpoint {
            checkpoint_id: checkpoint_id.into(),
        }
    }
}
