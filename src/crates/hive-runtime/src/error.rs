//! Runtime-level errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Invalid runtime configuration (bad env var, zero concurrency,
    /// missing production credential). Fatal at startup; maps to exit
    /// code 2 in the CLI.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown stream '{0}'")]
    UnknownStream(String),

    #[error("unknown execution '{0}'")]
    UnknownExecution(String),

    /// The stream is stopped and admits no new executions.
    #[error("stream '{0}' is not running")]
    StreamStopped(String),

    /// No checkpoint exists to resume the execution from.
    #[error("execution '{0}' has no checkpoint to resume from")]
    NoCheckpoint(String),

    #[error(transparent)]
    Core(#[from] hive_core::CoreError),

    #[error(transparent)]
    Checkpoint(#[from] hive_checkpoint::CheckpointError),

    #[error(transparent)]
    Mcp(#[from] hive_mcp::McpError),
}
