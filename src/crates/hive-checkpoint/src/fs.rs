//! Filesystem checkpoint backend.
//!
//! Layout per execution:
//!
//! ```text
//! <root>/<execution_id>/
//!   index.json                      # {"checkpoints": [{id, created_at, resume_node}]}
//!   snapshots/<checkpoint_id>.json  # snapshot + sha256
//! ```
//!
//! Both files are written via write-to-temp, fsync, then atomic rename. A
//! failed index update after a durable snapshot write is tolerated: the
//! index is advisory and [`FsCheckpointStore::reconcile`] rebuilds it from
//! the snapshot directory, which `latest_for` also falls back to on a
//! corrupt index.

use crate::checkpoint::{Checkpoint, CheckpointSummary, SnapshotFile};
use crate::error::{CheckpointError, Result};
use crate::store::CheckpointStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    checkpoints: Vec<CheckpointSummary>,
}

/// Checkpoint store rooted at a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    root: PathBuf,
}

impl FsCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn execution_dir(&self, execution_id: &str) -> PathBuf {
        self.root.join(execution_id)
    }

    fn snapshots_dir(&self, execution_id: &str) -> PathBuf {
        self.execution_dir(execution_id).join("snapshots")
    }

    fn snapshot_path(&self, execution_id: &str, checkpoint_id: &str) -> PathBuf {
        self.snapshots_dir(execution_id)
            .join(format!("{checkpoint_id}.json"))
    }

    fn index_path(&self, execution_id: &str) -> PathBuf {
        self.execution_dir(execution_id).join("index.json")
    }

    /// Write `bytes` to `path` durably: temp file in the same directory,
    /// fsync, rename into place.
    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| std::io::Error::other("checkpoint path has no parent"))?;
        tokio::fs::create_dir_all(parent).await?;

        let tmp = parent.join(format!(
            ".tmp-{}",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_index(&self, execution_id: &str) -> Result<Option<IndexFile>> {
        let path = self.index_path(execution_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let index = serde_json::from_slice(&bytes).map_err(|e| CheckpointError::CorruptIndex {
            execution_id: execution_id.to_string(),
            detail: e.to_string(),
        })?;
        Ok(Some(index))
    }

    async fn write_index(&self, execution_id: &str, index: &IndexFile) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(index)?;
        Self::write_atomic(&self.index_path(execution_id), &bytes).await
    }

    /// Scan the snapshot directory and return every readable checkpoint,
    /// sorted oldest first. Unreadable files are skipped with a warning.
    async fn scan_snapshots(&self, execution_id: &str) -> Result<Vec<Checkpoint>> {
        let dir = self.snapshots_dir(execution_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut checkpoints = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_snapshot(&path).await {
                Ok(cp) => checkpoints.push(cp),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable snapshot"),
            }
        }
        checkpoints.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.checkpoint_id.cmp(&b.checkpoint_id))
        });
        Ok(checkpoints)
    }

    async fn read_snapshot(path: &Path) -> Result<Checkpoint> {
        let bytes = tokio::fs::read(path).await?;
        let file: SnapshotFile = serde_json::from_slice(&bytes)?;
        file.verify()
    }

    /// Rebuild the index from snapshot files.
    ///
    /// Safe to call at any time; returns the number of checkpoints indexed.
    pub async fn reconcile(&self, execution_id: &str) -> Result<usize> {
        let checkpoints = self.scan_snapshots(execution_id).await?;
        let index = IndexFile {
            checkpoints: checkpoints.iter().map(CheckpointSummary::from).collect(),
        };
        let count = index.checkpoints.len();
        self.write_index(execution_id, &index).await?;
        debug!(execution_id, count, "rebuilt checkpoint index");
        Ok(count)
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<String> {
        let execution_id = checkpoint.execution_id.clone();
        let checkpoint_id = checkpoint.checkpoint_id.clone();
        let summary = CheckpointSummary::from(&checkpoint);

        let sealed = SnapshotFile::seal(checkpoint)?;
        let bytes = serde_json::to_vec_pretty(&sealed)?;
        let path = self.snapshot_path(&execution_id, &checkpoint_id);
        Self::write_atomic(&path, &bytes).await?;

        // Snapshot is durable; the index is best-effort from here on.
        let mut index = match self.read_index(&execution_id).await {
            Ok(index) => index.unwrap_or_default(),
            Err(CheckpointError::CorruptIndex { .. }) => {
                let checkpoints = self.scan_snapshots(&execution_id).await?;
                IndexFile {
                    checkpoints: checkpoints
                        .iter()
                        .map(CheckpointSummary::from)
                        .filter(|s| s.id != checkpoint_id)
                        .collect(),
                }
            }
            Err(e) => return Err(e),
        };
        index.checkpoints.push(summary);
        if let Err(e) = self.write_index(&execution_id, &index).await {
            warn!(execution_id, checkpoint_id, error = %e,
                "checkpoint index update failed; snapshot is durable, index can be rebuilt");
        }

        Ok(checkpoint_id)
    }

    async fn load(&self, execution_id: &str, checkpoint_id: &str) -> Result<Checkpoint> {
        let path = self.snapshot_path(execution_id, checkpoint_id);
        match Self::read_snapshot(&path).await {
            Ok(cp) => Ok(cp),
            Err(CheckpointError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CheckpointError::not_found(execution_id, checkpoint_id))
            }
            Err(e) => Err(e),
        }
    }

    async fn latest_for(&self, execution_id: &str) -> Result<Option<Checkpoint>> {
        match self.read_index(execution_id).await {
            Ok(Some(index)) => {
                let Some(newest) = index
                    .checkpoints
                    .iter()
                    .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
                else {
                    return Ok(None);
                };
                match self.load(execution_id, &newest.id).await {
                    Ok(cp) => Ok(Some(cp)),
                    // Index points at a missing or corrupt snapshot; trust
                    // the directory over the index.
                    Err(CheckpointError::NotFound { .. })
                    | Err(CheckpointError::CorruptCheckpoint { .. }) => {
                        Ok(self.scan_snapshots(execution_id).await?.pop())
                    }
                    Err(e) => Err(e),
                }
            }
            Ok(None) => Ok(self.scan_snapshots(execution_id).await?.pop()),
            Err(CheckpointError::CorruptIndex { .. }) => {
                warn!(execution_id, "checkpoint index corrupt; scanning snapshots");
                Ok(self.scan_snapshots(execution_id).await?.pop())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_for(&self, execution_id: &str) -> Result<Vec<CheckpointSummary>> {
        match self.read_index(execution_id).await {
            Ok(Some(index)) => Ok(index.checkpoints),
            Ok(None) => Ok(self
                .scan_snapshots(execution_id)
                .await?
                .iter()
                .map(CheckpointSummary::from)
                .collect()),
            Err(CheckpointError::CorruptIndex { .. }) => Ok(self
                .scan_snapshots(execution_id)
                .await?
                .iter()
                .map(CheckpointSummary::from)
                .collect()),
            Err(e) => Err(e),
        }
    }

    async fn delete_execution(&self, execution_id: &str) -> Result<()> {
        let dir = self.execution_dir(execution_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
