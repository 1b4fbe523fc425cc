//! Unified MCP client over either transport, with a cached tool catalog.

use crate::error::{McpError, Result};
use crate::http::HttpClient;
use crate::stdio::{StdioClient, StdioServerSpec};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default per-tool-call deadline.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Where an MCP server lives.
#[derive(Debug, Clone)]
pub enum McpTransport {
    Stdio(StdioServerSpec),
    Http {
        url: String,
        headers: Vec<(String, String)>,
    },
}

/// A tool as described by the server's `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

/// Result of a `tools/call`: the content payload plus the server's error
/// flag (a failed tool is a result, not a protocol error).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub content: Value,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl ToolResult {
    /// Flatten text content blocks into one string, when present.
    pub fn text(&self) -> Option<String> {
        let blocks = self.content.as_array()?;
        let mut out = String::new();
        for block in blocks {
            if block["type"] == json!("text") {
                if let Some(text) = block["text"].as_str() {
                    out.push_str(text);
                }
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

enum Inner {
    Stdio(StdioClient),
    Http(HttpClient),
}

/// Client handle for one MCP server.
///
/// Safe to share across executions; stdio request serialization is
/// internal to the transport. The tool catalog is cached after the first
/// `list_tools` and refreshed on explicit invalidation or reconnect.
pub struct McpClient {
    name: String,
    inner: Inner,
    catalog: RwLock<Option<Vec<McpToolDescriptor>>>,
    tool_timeout: Duration,
}

impl McpClient {
    pub fn new(name: impl Into<String>, transport: McpTransport) -> Self {
        let inner = match transport {
            McpTransport::Stdio(spec) => Inner::Stdio(StdioClient::new(spec)),
            McpTransport::Http { url, headers } => {
                let mut client = HttpClient::new(url);
                for (name, value) in headers {
                    client = client.with_header(name, value);
                }
                Inner::Http(client)
            }
        };
        Self {
            name: name.into(),
            inner,
            catalog: RwLock::new(None),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Server identifier used in tool names and logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connect (or reconnect) and warm the tool catalog.
    pub async fn connect(&self) -> Result<()> {
        self.catalog.write().take();
        match &self.inner {
            Inner::Stdio(client) => client.connect().await?,
            Inner::Http(client) => client.connect().await?,
        }
        let tools = self.fetch_tools().await?;
        debug!(server = %self.name, tools = tools.len(), "MCP catalog cached");
        *self.catalog.write() = Some(tools);
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        match &self.inner {
            Inner::Stdio(client) => client.request(method, params, timeout, cancel).await,
            Inner::Http(client) => client.request(method, params, timeout, cancel).await,
        }
    }

    async fn fetch_tools(&self) -> Result<Vec<McpToolDescriptor>> {
        let result = self
            .request(
                "tools/list",
                json!({}),
                Duration::from_secs(20),
                &CancellationToken::new(),
            )
            .await?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| McpError::Transport("tools/list result missing 'tools'".into()))?;
        Ok(serde_json::from_value(tools)?)
    }

    /// The server's tool catalog, cached after `connect`.
    pub async fn list_tools(&self) -> Result<Vec<McpToolDescriptor>> {
        if let Some(tools) = self.catalog.read().clone() {
            return Ok(tools);
        }
        let tools = self.fetch_tools().await?;
        *self.catalog.write() = Some(tools.clone());
        Ok(tools)
    }

    /// Drop the cached catalog; the next `list_tools` refetches.
    pub fn invalidate_tools(&self) {
        self.catalog.write().take();
    }

    /// Invoke a tool with the default per-call deadline.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResult> {
        self.call_tool_with_timeout(name, arguments, self.tool_timeout, cancel)
            .await
    }

    /// Invoke a tool with an explicit deadline.
    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ToolResult> {
        if let Some(catalog) = self.catalog.read().as_ref() {
            if !catalog.iter().any(|t| t.name == name) {
                return Err(McpError::ToolNotFound(name.to_string()));
            }
        }

        let result = self
            .request(
                "tools/call",
                json!({ "name": name, "arguments": arguments }),
                timeout,
                cancel,
            )
            .await
            .map_err(|e| match e {
                McpError::Timeout { ms } => McpError::ToolTimeout {
                    tool: name.to_string(),
                    ms,
                },
                // JSON-RPC "method/tool not found".
                McpError::ToolError { code: -32601, .. } => {
                    McpError::ToolNotFound(name.to_string())
                }
                other => other,
            })?;
        Ok(serde_json::from_value(result)?)
    }

    /// Close the transport. Stdio children get a grace period, then die.
    pub async fn close(&self) {
        match &self.inner {
            Inner::Stdio(client) => client.close().await,
            Inner::Http(client) => client.close().await,
        }
    }
}
