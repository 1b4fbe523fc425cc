//! In-memory checkpoint store for tests and ephemeral runtimes.

use crate::checkpoint::{Checkpoint, CheckpointSummary};
use crate::error::{CheckpointError, Result};
use crate::store::CheckpointStore;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Keeps each execution's checkpoint chain in a map, append order preserved.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    executions: RwLock<HashMap<String, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<String> {
        let id = checkpoint.checkpoint_id.clone();
        let mut executions = self.executions.write().await;
        executions
            .entry(checkpoint.execution_id.clone())
            .or_default()
            .push(checkpoint);
        Ok(id)
    }

    async fn load(&self, execution_id: &str, checkpoint_id: &str) -> Result<Checkpoint> {
        let executions = self.executions.read().await;
        executions
            .get(execution_id)
            .and_then(|chain| {
                chain
                    .iter()
                    .find(|cp| cp.checkpoint_id == checkpoint_id)
                    .cloned()
            })
            .ok_or_else(|| CheckpointError::not_found(execution_id, checkpoint_id))
    }

    async fn latest_for(&self, execution_id: &str) -> Result<Option<Checkpoint>> {
        let executions = self.executions.read().await;
        Ok(executions
            .get(execution_id)
            .and_then(|chain| chain.last().cloned()))
    }

    async fn list_for(&self, execution_id: &str) -> Result<Vec<CheckpointSummary>> {
        let executions = self.executions.read().await;
        Ok(executions
            .get(execution_id)
            .map(|chain| chain.iter().map(CheckpointSummary::from).collect())
            .unwrap_or_default())
    }

    async fn delete_execution(&self, execution_id: &str) -> Result<()> {
        self.executions.write().await.remove(execution_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_load_latest() {
        let store = InMemoryCheckpointStore::new();
        let first = Checkpoint::new("exec-1", "a");
        let first_id = store.save(first).await.unwrap();
        let second_id = store.save(Checkpoint::new("exec-1", "b")).await.unwrap();

        assert_eq!(
            store.load("exec-1", &first_id).await.unwrap().resume_node,
            "a"
        );
        let latest = store.latest_for("exec-1").await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, second_id);
        assert_eq!(store.list_for("exec-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_and_missing() {
        let store = InMemoryCheckpointStore::new();
        store.save(Checkpoint::new("exec-1", "a")).await.unwrap();
        store.delete_execution("exec-1").await.unwrap();

        assert!(store.latest_for("exec-1").await.unwrap().is_none());
        assert!(matches!(
            store.load("exec-1", "x").await,
            Err(CheckpointError::NotFound { .. })
        ));
    }
}
