//! Tools and named functions.
//!
//! [`ToolRegistry`] maps tool names to callables for `llm_tool_use` nodes,
//! merging local function tools with MCP-proxied ones (the runtime crate
//! registers those). [`FunctionRegistry`] resolves the named callables
//! behind `function` nodes; registries are built explicitly at startup and
//! passed through the runtime — there is no process-wide mutable state.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Description of a callable tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({"type": "object"})
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: empty_schema(),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }
}

/// A callable tool. Implementations must honor the cancellation token for
/// anything that blocks or waits.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    async fn call(&self, arguments: Value, cancel: &CancellationToken) -> Result<Value>;
}

type ToolFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Local tool backed by an async closure.
pub struct FunctionTool {
    descriptor: ToolDescriptor,
    handler: ToolFn,
}

impl FunctionTool {
    pub fn new<F, Fut>(descriptor: ToolDescriptor, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            descriptor,
            handler: Arc::new(move |args| Box::pin(f(args))),
        }
    }
}

#[async_trait]
impl ToolHandler for FunctionTool {
    fn descriptor(&self) -> ToolDescriptor {
        self.descriptor.clone()
    }

    async fn call(&self, arguments: Value, cancel: &CancellationToken) -> Result<Value> {
        let fut = (self.handler)(arguments);
        tokio::select! {
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
            result = fut => result,
        }
    }
}

/// Name → tool mapping consulted by `llm_tool_use` nodes.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn ToolHandler>) {
        self.tools.insert(tool.descriptor().name, tool);
    }

    pub fn register_function<F, Fut>(&mut self, descriptor: ToolDescriptor, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(Arc::new(FunctionTool::new(descriptor, f)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Descriptors for the named subset (a node's `tools` filter); names
    /// with no registered tool are skipped. An empty filter means the full
    /// catalog.
    pub fn descriptors(&self, filter: &[String]) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> = if filter.is_empty() {
            self.tools.values().map(|t| t.descriptor()).collect()
        } else {
            filter
                .iter()
                .filter_map(|name| self.tools.get(name).map(|t| t.descriptor()))
                .collect()
        };
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }
}

type NodeFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Named callables behind `function` nodes.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, NodeFn>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cooperative-async function.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.functions
            .insert(name.into(), Arc::new(move |args| Box::pin(f(args))));
    }

    /// Register a synchronous function, offloaded to the blocking pool so
    /// the executor never blocks the scheduler.
    pub fn register_blocking<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.functions.insert(
            name.into(),
            Arc::new(move |args| {
                let f = f.clone();
                Box::pin(async move {
                    tokio::task::spawn_blocking(move || f(args))
                        .await
                        .map_err(|e| CoreError::State(format!("blocking function panicked: {e}")))?
                })
            }),
        );
    }

    pub fn get(&self, name: &str) -> Option<NodeFn> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_function_tool_call() {
        let tool = FunctionTool::new(ToolDescriptor::new("echo", "echo args"), |args| async move {
            Ok(json!({"echo": args}))
        });
        let cancel = CancellationToken::new();
        let result = tool.call(json!({"x": 1}), &cancel).await.unwrap();
        assert_eq!(result, json!({"echo": {"x": 1}}));
    }

    #[tokio::test]
    async fn test_function_tool_honors_cancel() {
        let tool = FunctionTool::new(ToolDescriptor::new("sleepy", ""), |_| async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(json!(null))
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = tool.call(json!({}), &cancel).await.unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }

    #[test]
    fn test_registry_filtering() {
        let mut registry = ToolRegistry::new();
        registry.register_function(ToolDescriptor::new("a", ""), |_| async { Ok(json!(1)) });
        registry.register_function(ToolDescriptor::new("b", ""), |_| async { Ok(json!(2)) });

        assert_eq!(registry.descriptors(&[]).len(), 2);
        let subset = registry.descriptors(&["b".to_string(), "missing".to_string()]);
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[0].name, "b");
    }

    #[tokio::test]
    async fn test_blocking_function_offloads() {
        let mut registry = FunctionRegistry::new();
        registry.register_blocking("double", |args| {
            let x = args["x"].as_i64().unwrap_or(0);
            Ok(json!({"x": x * 2}))
        });

        let f = registry.get("double").unwrap();
        let out = f(json!({"x": 21})).await.unwrap();
        assert_eq!(out, json!({"x": 42}));
        assert!(registry.contains("double"));
        assert!(!registry.contains("triple"));
    }
}
