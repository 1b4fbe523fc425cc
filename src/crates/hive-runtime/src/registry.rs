//! Bridge from MCP servers into the engine's tool registry.
//!
//! Each tool listed by a connected [`McpClient`] registers as a
//! [`ToolHandler`] proxy; `llm_tool_use` nodes then dispatch to local and
//! MCP tools through one registry, indistinguishably.

use async_trait::async_trait;
use hive_core::{CoreError, ToolDescriptor, ToolHandler, ToolRegistry};
use hive_mcp::{McpClient, McpError, McpToolDescriptor};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A tool on an MCP server, callable through the engine's registry.
pub struct McpTool {
    client: Arc<McpClient>,
    descriptor: ToolDescriptor,
}

impl McpTool {
    pub fn new(client: Arc<McpClient>, tool: &McpToolDescriptor) -> Self {
        Self {
            client,
            descriptor: ToolDescriptor {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
            },
        }
    }
}

#[async_trait]
impl ToolHandler for McpTool {
    fn descriptor(&self) -> ToolDescriptor {
        self.descriptor.clone()
    }

    async fn call(&self, arguments: Value, cancel: &CancellationToken) -> hive_core::Result<Value> {
        let name = &self.descriptor.name;
        let result = self
            .client
            .call_tool(name, arguments, cancel)
            .await
            .map_err(|e| match e {
                McpError::Cancelled => CoreError::Cancelled,
                other => {
                    let transient = other.is_transient();
                    CoreError::tool(name.clone(), other.to_string(), transient)
                }
            })?;

        if result.is_error {
            let message = result
                .text()
                .unwrap_or_else(|| result.content.to_string());
            return Err(CoreError::tool(name.clone(), message, false));
        }
        Ok(result
            .text()
            .map(Value::String)
            .unwrap_or(result.content))
    }
}

/// Register every tool of a connected MCP server. Returns the number of
/// tools added.
pub async fn register_mcp_tools(
    registry: &mut ToolRegistry,
    client: Arc<McpClient>,
) -> Result<usize, McpError> {
    let tools = client.list_tools().await?;
    let count = tools.len();
    for tool in &tools {
        debug!(server = %client.name(), tool = %tool.name, "registering MCP tool");
        registry.register(Arc::new(McpTool::new(client.clone(), tool)));
    }
    Ok(count)
}
