//! Durable checkpointing for hive executions.
//!
//! A [`Checkpoint`] is a snapshot sufficient to resume an execution at a
//! named node: execution-scoped state, visit counts, the event sequence
//! counter, and an optional pending client request. The [`CheckpointStore`]
//! trait abstracts the backend; [`FsCheckpointStore`] implements the
//! on-disk layout (per-execution directory with an `index.json` and
//! checksummed snapshot files, both written via write-to-temp-then-rename),
//! and [`InMemoryCheckpointStore`] backs tests and ephemeral runtimes.

pub mod checkpoint;
pub mod error;
pub mod fs;
pub mod memory;
pub mod store;

pub use checkpoint::{Checkpoint, CheckpointSummary};
pub use error::{CheckpointError, Result};
pub use fs::FsCheckpointStore;
pub use memory::InMemoryCheckpointStore;
pub use store::CheckpointStore;
