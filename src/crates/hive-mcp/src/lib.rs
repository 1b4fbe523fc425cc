//! MCP (Model Context Protocol) clients.
//!
//! Integrates external tool servers as callable tools over two transports:
//! stdio (a child process speaking `Content-Length`-framed JSON-RPC on its
//! stdin/stdout) and HTTP (one JSON-RPC request per POST). The surface the
//! engine depends on is narrow: `connect`, `list_tools`, `call_tool` with
//! a per-call deadline and cancellation, and `close`.
//!
//! Stdio clients serialize requests internally (one in-flight at a time,
//! request/response paired by id) and are safe to share across tasks; a
//! dead server poisons the client, which then fails every call with
//! `TransportClosed` until `connect` is re-invoked.

pub mod client;
pub mod error;
pub mod http;
pub mod protocol;
pub mod stdio;

pub use client::{McpClient, McpToolDescriptor, McpTransport, ToolResult};
pub use error::{McpError, Result};
pub use http::HttpClient;
pub use protocol::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};
pub use stdio::{StdioClient, StdioServerSpec};

/// MCP protocol revision sent during the initialize handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name advertised in `clientInfo`.
pub const CLIENT_NAME: &str = "hive-mcp";
