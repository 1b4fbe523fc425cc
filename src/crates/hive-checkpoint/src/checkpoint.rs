//! Checkpoint data structures and content checksums.
//!
//! Snapshots use `BTreeMap` for all keyed data so the canonical JSON bytes
//! of a checkpoint are stable across save/load cycles; the sha256 checksum
//! is computed over exactly those bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A durable snapshot sufficient to resume an execution at `resume_node`.
///
/// Each execution has a chain of checkpoints linked through
/// `parent_checkpoint`; the newest one is the "active" checkpoint used by
/// resume. `event_seq` records the next per-execution event sequence number
/// so a resumed run continues the gapless series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub execution_id: String,
    pub created_at: DateTime<Utc>,
    /// Node at which the executor re-enters the graph on resume.
    pub resume_node: String,
    /// Execution-scoped state at snapshot time.
    pub state_snapshot: BTreeMap<String, Value>,
    /// Per-node visit counters at snapshot time.
    pub visit_counts: BTreeMap<String, u32>,
    /// Next event sequence number for the execution.
    pub event_seq: u64,
    /// Outstanding client request when paused at a `client_input` node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_client_request: Option<Value>,
    /// Previous checkpoint in this execution's chain, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint: Option<String>,
}

impl Checkpoint {
    /// Create a checkpoint with a fresh id and the current timestamp.
    pub fn new(execution_id: impl Into<String>, resume_node: impl Into<String>) -> Self {
        Self {
            checkpoint_id: Uuid::new_v4().to_string(),
            execution_id: execution_id.into(),
            created_at: Utc::now(),
            resume_node: resume_node.into(),
            state_snapshot: BTreeMap::new(),
            visit_counts: BTreeMap::new(),
            event_seq: 1,
            pending_client_request: None,
            parent_checkpoint: None,
        }
    }

    pub fn with_state(mut self, snapshot: BTreeMap<String, Value>) -> Self {
        self.state_snapshot = snapshot;
        self
    }

    pub fn with_visit_counts(mut self, counts: BTreeMap<String, u32>) -> Self {
        self.visit_counts = counts;
        self
    }

    pub fn with_event_seq(mut self, seq: u64) -> Self {
        self.event_seq = seq;
        self
    }

    pub fn with_pending_client_request(mut self, request: Value) -> Self {
        self.pending_client_request = Some(request);
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_checkpoint = Some(parent.into());
        self
    }

    /// Canonical JSON bytes of this checkpoint.
    ///
    /// Struct field order plus `BTreeMap` key order make this deterministic;
    /// the checksum and the byte-identical round-trip guarantee both rest on
    /// these bytes.
    pub fn canonical_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Hex-encoded sha256 of [`canonical_bytes`](Self::canonical_bytes).
    pub fn content_checksum(&self) -> crate::Result<String> {
        let bytes = self.canonical_bytes()?;
        let digest = Sha256::digest(&bytes);
        Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
    }
}

/// Index entry describing one checkpoint without its snapshot payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub resume_node: String,
}

impl From<&Checkpoint> for CheckpointSummary {
    fn from(cp: &Checkpoint) -> Self {
        Self {
            id: cp.checkpoint_id.clone(),
            created_at: cp.created_at,
            resume_node: cp.resume_node.clone(),
        }
    }
}

/// On-disk snapshot envelope: the checkpoint plus its content checksum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SnapshotFile {
    pub checkpoint: Checkpoint,
    pub sha256: String,
}

impl SnapshotFile {
    pub fn seal(checkpoint: Checkpoint) -> crate::Result<Self> {
        let sha256 = checkpoint.content_checksum()?;
        Ok(Self { checkpoint, sha256 })
    }

    /// Verify the checksum and unwrap the checkpoint.
    pub fn verify(self) -> crate::Result<Checkpoint> {
        let actual = self.checkpoint.content_checksum()?;
        if actual != self.sha256 {
            return Err(crate::CheckpointError::corrupt(
                self.checkpoint.checkpoint_id,
            ));
        }
        Ok(self.checkpoint)
    }
}
