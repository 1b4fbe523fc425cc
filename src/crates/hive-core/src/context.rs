//! Execution context: runtime-only identity and lifecycle of one run.

use crate::graph::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What kind of source started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    EventLoop,
    Cron,
    Webhook,
    Chat,
    Manual,
}

impl TriggerKind {
    /// Default per-stream concurrency for this trigger kind.
    pub fn default_concurrency(&self) -> usize {
        match self {
            TriggerKind::Cron => 1,
            _ => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::EventLoop => "event_loop",
            TriggerKind::Cron => "cron",
            TriggerKind::Webhook => "webhook",
            TriggerKind::Chat => "chat",
            TriggerKind::Manual => "manual",
        }
    }
}

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime-only state of one execution.
///
/// Created by its stream, mutated only by the executor task that owns it,
/// dropped once the run reaches a terminal status and its events are
/// flushed.
#[derive(Debug)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub stream_id: String,
    pub trigger: TriggerKind,
    pub start_time: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub current_node: Option<NodeId>,
    pub visit_counts: HashMap<NodeId, u32>,
    cancel: CancellationToken,
    /// First event sequence number this run will emit (1 for fresh runs,
    /// the checkpointed counter for resumed ones).
    pub(crate) initial_seq: u64,
}

impl ExecutionContext {
    pub fn new(stream_id: impl Into<String>, trigger: TriggerKind) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            stream_id: stream_id.into(),
            trigger,
            start_time: Utc::now(),
            status: ExecutionStatus::Pending,
            current_node: None,
            visit_counts: HashMap::new(),
            cancel: CancellationToken::new(),
            initial_seq: 1,
        }
    }

    /// Rebuild a context to resume a checkpointed execution.
    pub fn for_resume(checkpoint: &hive_checkpoint::Checkpoint, trigger: TriggerKind) -> Self {
        Self {
            execution_id: checkpoint.execution_id.clone(),
            stream_id: String::new(),
            trigger,
            start_time: Utc::now(),
            status: ExecutionStatus::Pending,
            current_node: Some(checkpoint.resume_node.clone()),
            visit_counts: checkpoint
                .visit_counts
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            cancel: CancellationToken::new(),
            initial_seq: checkpoint.event_seq,
        }
    }

    pub fn with_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = stream_id.into();
        self
    }

    /// Replace the cancel token, e.g. with a child of a parent execution's
    /// token so sub-graph runs cancel with their parent.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Clone of the cooperative cancellation token.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal cancellation; the executor observes it within its next await.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_defaults() {
        assert_eq!(TriggerKind::EventLoop.default_concurrency(), 4);
        assert_eq!(TriggerKind::Cron.default_concurrency(), 1);
        assert_eq!(TriggerKind::Webhook.as_str(), "webhook");
    }

    #[test]
    fn test_fresh_context() {
        let ctx = ExecutionContext::new("s1", TriggerKind::Manual);
        assert_eq!(ctx.status, ExecutionStatus::Pending);
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.initial_seq, 1);
        let other = ExecutionContext::new("s1", TriggerKind::Manual);
        assert_ne!(ctx.execution_id, other.execution_id);
    }

    #[test]
    fn test_resume_context_restores_counters() {
        let mut cp = hive_checkpoint::Checkpoint::new("exec-9", "pause-node");
        cp.visit_counts.insert("a".into(), 2);
        cp.event_seq = 17;
        let ctx = ExecutionContext::for_resume(&cp, TriggerKind::Manual);
        assert_eq!(ctx.execution_id, "exec-9");
        assert_eq!(ctx.current_node.as_deref(), Some("pause-node"));
        assert_eq!(ctx.visit_counts["a"], 2);
        assert_eq!(ctx.initial_seq, 17);
    }

    #[test]
    fn test_status_terminality() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
        assert_eq!(ExecutionStatus::Paused.to_string(), "paused");
    }
}
