//! Error types for graph execution.
//!
//! Every failure the engine can produce maps onto one of the
//! [`ErrorKind`] categories; [`CoreError::is_transient`] drives the retry
//! wrapper in [`crate::retry`] and [`ErrorEnvelope`] is the structured
//! shape surfaced to users instead of stack traces.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience result type using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Category of a [`CoreError`].
///
/// Kinds, not type names: retry and propagation policy are decided per
/// kind. Only `TransientIo` errors are retried; `Cancelled` is a
/// non-error terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Input,
    TransientIo,
    FatalIo,
    Budget,
    Loop,
    Schema,
    Cancelled,
    Corruption,
}

/// Errors raised while loading or executing a graph.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Graph structure is invalid (bad entry, dangling edge, missing
    /// convergence node, duplicate ids).
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// General configuration problem outside the graph shape.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A `function` node references a callable with no implementation.
    #[error("node '{node}' references unregistered function '{function}'")]
    NodeNotRegistered { node: String, function: String },

    /// A required input key is absent from the execution namespace.
    #[error("node '{node}' is missing required input '{key}'")]
    MissingInput { node: String, key: String },

    /// A non-terminal node had no matching outgoing edge.
    #[error("no matching edge out of node '{node}'")]
    NoMatchingEdge { node: String },

    /// A node was entered more times than its visit budget allows.
    #[error("loop budget exceeded at node '{node}' ({visits} visits)")]
    LoopBudgetExceeded { node: String, visits: u32 },

    /// An `llm_tool_use` node issued more tool calls than its cap.
    #[error("tool loop exceeded at node '{node}' ({calls} calls)")]
    ToolLoopExceeded { node: String, calls: u32 },

    /// A cost/token/step budget guard tripped.
    #[error("budget exceeded: {reason}")]
    BudgetExceeded { reason: String },

    /// LLM output failed to conform after the corrective re-prompt.
    #[error("node '{node}' output schema violation: {detail}")]
    SchemaViolation { node: String, detail: String },

    /// LLM output stayed over the length limit after the corrective
    /// re-prompt.
    #[error("node '{node}' output exceeds {limit} characters")]
    LengthViolation { node: String, limit: usize },

    /// LLM provider failure; `transient` distinguishes 5xx/429/timeouts
    /// from auth and validation failures.
    #[error("provider error: {message}")]
    Provider { message: String, transient: bool },

    /// Tool invocation failure (local or MCP-proxied).
    #[error("tool '{tool}' failed: {message}")]
    Tool {
        tool: String,
        message: String,
        transient: bool,
    },

    /// A per-call deadline expired.
    #[error("operation timed out after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    /// An embedded sub-graph run ended without completing.
    #[error("sub-graph at node '{node}' ended {status}: {reason}")]
    SubGraphFailed {
        node: String,
        status: String,
        reason: String,
    },

    /// State management failure.
    #[error("state error: {0}")]
    State(String),

    /// External cancellation. Terminal, not retried.
    #[error("execution cancelled")]
    Cancelled,

    /// Checkpoint persistence failure.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] hive_checkpoint::CheckpointError),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        use hive_checkpoint::CheckpointError;
        match self {
            Self::InvalidGraph(_)
            | Self::Configuration(_)
            | Self::NodeNotRegistered { .. }
            | Self::NoMatchingEdge { .. } => ErrorKind::Configuration,
            Self::MissingInput { .. } | Self::State(_) => ErrorKind::Input,
            Self::LoopBudgetExceeded { .. } | Self::ToolLoopExceeded { .. } => ErrorKind::Loop,
            Self::BudgetExceeded { .. } => ErrorKind::Budget,
            Self::SchemaViolation { .. } | Self::LengthViolation { .. } => ErrorKind::Schema,
            Self::Provider { transient, .. } | Self::Tool { transient, .. } => {
                if *transient {
                    ErrorKind::TransientIo
                } else {
                    ErrorKind::FatalIo
                }
            }
            Self::Timeout { .. } => ErrorKind::TransientIo,
            Self::SubGraphFailed { .. } => ErrorKind::FatalIo,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Checkpoint(e) => match e {
                CheckpointError::CorruptCheckpoint { .. } | CheckpointError::CorruptIndex { .. } => {
                    ErrorKind::Corruption
                }
                _ => ErrorKind::FatalIo,
            },
            Self::Serialization(_) => ErrorKind::Schema,
            Self::Io(_) => ErrorKind::FatalIo,
        }
    }

    /// Whether the retry wrapper may re-attempt the failed operation.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientIo
    }

    /// Short machine-readable reason used in terminal events.
    pub fn reason(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Budget => "budget_exceeded",
            ErrorKind::Loop => "loop_budget_exceeded",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Input => "input",
            ErrorKind::Schema => "schema",
            ErrorKind::Corruption => "corruption",
            ErrorKind::TransientIo | ErrorKind::FatalIo => "io",
        }
    }

    pub fn provider(message: impl Into<String>, transient: bool) -> Self {
        Self::Provider {
            message: message.into(),
            transient,
        }
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>, transient: bool) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
            transient,
        }
    }

    pub fn missing_input(node: impl Into<String>, key: impl Into<String>) -> Self {
        Self::MissingInput {
            node: node.into(),
            key: key.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }
}

/// Structured, user-facing error shape.
///
/// `help` carries actionable remediation when one is known; `category` is
/// the [`ErrorKind`] in snake_case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl From<&CoreError> for ErrorEnvelope {
    fn from(err: &CoreError) -> Self {
        let help = match err {
            CoreError::NodeNotRegistered { function, .. } => Some(format!(
                "register '{function}' in the function registry before running this graph"
            )),
            CoreError::MissingInput { key, .. } => Some(format!(
                "seed '{key}' in the trigger input or have an upstream node produce it"
            )),
            CoreError::LoopBudgetExceeded { node, .. } => Some(format!(
                "raise max_node_visits on '{node}' or tighten its loop condition"
            )),
            CoreError::Provider {
                transient: false, ..
            } => Some("check provider credentials and request validity".to_string()),
            CoreError::Tool {
                transient: false,
                tool,
                ..
            } => Some(format!("tool '{tool}' rejected the call; rotate its credential or fix the arguments")),
            CoreError::Checkpoint(hive_checkpoint::CheckpointError::CorruptIndex {
                ..
            }) => Some("run index reconciliation to rebuild from snapshots".to_string()),
            _ => None,
        };
        let category =
            serde_json::to_value(err.kind())
                .ok()
                .and_then(|v| v.as_str().map(str::to_string));
        Self {
            error: err.to_string(),
            help,
            category,
        }
    }
}
