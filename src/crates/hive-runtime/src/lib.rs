//! hive-runtime: streams of concurrent executions over one agent graph.
//!
//! [`AgentRuntime`] is the composition root — it owns the graph, the
//! shared state, the checkpoint store, the event bus, and the registries,
//! and builds the executor the streams run on. An [`ExecutionStream`]
//! owns a trigger source (chat turns, cron ticks, webhooks, manual calls)
//! and admits executions under its concurrency budget.

pub mod config;
pub mod error;
pub mod registry;
pub mod runtime;
pub mod stream;

pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use registry::{register_mcp_tools, McpTool};
pub use runtime::{AgentRuntime, AgentRuntimeBuilder};
pub use stream::{ExecutionStream, StreamConfig};
