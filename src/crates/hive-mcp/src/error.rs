//! MCP client errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, McpError>;

/// Errors from MCP transports and tool calls.
#[derive(Error, Debug)]
pub enum McpError {
    /// The initialize handshake was refused or malformed.
    #[error("MCP handshake failed: {0}")]
    HandshakeFailed(String),

    /// The server does not expose the named tool.
    #[error("tool '{0}' not found on server")]
    ToolNotFound(String),

    /// A tool call exceeded its deadline.
    #[error("tool '{tool}' timed out after {ms}ms")]
    ToolTimeout { tool: String, ms: u64 },

    /// The server returned a JSON-RPC error for a tool call.
    #[error("tool error {code}: {message}")]
    ToolError { code: i64, message: String },

    /// A request exceeded its deadline (non-tool context).
    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The call was cancelled; a `$/cancelRequest` was sent where the
    /// transport allows it.
    #[error("call cancelled")]
    Cancelled,

    /// Transport-level failure (framing, socket, process I/O).
    #[error("transport error: {0}")]
    Transport(String),

    /// The client is in a failed state; reconnect to recover.
    #[error("transport closed: {cause}")]
    TransportClosed { cause: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl McpError {
    /// Transient errors may be retried by callers; everything else is
    /// fatal until reconnect or operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout { .. } | Self::ToolTimeout { .. }
        )
    }
}
