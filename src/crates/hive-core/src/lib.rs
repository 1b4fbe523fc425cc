//! hive-core: the graph execution engine.
//!
//! A hive agent is a directed graph of typed nodes (LLM calls, tool loops,
//! functions, routers, human-input pauses, embedded sub-graphs) walked by
//! [`GraphExecutor`] over a concurrency-safe [`SharedState`], streaming
//! progress to an [`EventBus`] and checkpointing through
//! `hive_checkpoint::CheckpointStore`.
//!
//! # Architecture
//!
//! ```text
//! trigger ──> ExecutionContext ──> GraphExecutor
//!                                    │  walk: edge selection, loops,
//!                                    │        fan-out / fan-in
//!                                    ├── reads/writes SharedState
//!                                    ├── publishes to EventBus
//!                                    ├── persists Checkpoints (pause/cancel)
//!                                    └── produces RunLog
//! ```
//!
//! The LLM provider and tool substrate are consumed through narrow traits
//! ([`llm::LlmProvider`], [`tool::ToolHandler`]); this crate binds to no
//! vendor.

pub mod condition;
pub mod context;
pub mod error;
pub mod event;
pub mod executor;
pub mod goal;
pub mod graph;
pub mod llm;
pub mod node;
pub mod retry;
pub mod run_log;
pub mod state;
pub mod tool;

pub use context::{ExecutionContext, ExecutionStatus, TriggerKind};
pub use error::{CoreError, ErrorEnvelope, ErrorKind, Result};
pub use event::{Event, EventBus, EventFilter, EventPayload, Subscription};
pub use executor::{ExecutionBudget, ExecutorConfig, GraphExecutor};
pub use goal::{Constraint, ConstraintCategory, ConstraintKind, Goal};
pub use graph::{EdgeCondition, EdgeSpec, GraphSpec, NodeId, NodeSpec, NodeType};
pub use llm::{
    ChatMessage, LlmFrame, LlmProvider, LlmRequest, LlmResponse, Role, ScriptedProvider,
    TokenUsage, ToolCallRequest,
};
pub use node::{NodeOutput, NodeStatus};
pub use retry::RetryPolicy;
pub use run_log::{CostSummary, Decision, DecisionOutcome, NodeVisit, RunLog};
pub use state::{IsolationLevel, SharedState, StateScope};
pub use tool::{FunctionRegistry, FunctionTool, ToolDescriptor, ToolHandler, ToolRegistry};
