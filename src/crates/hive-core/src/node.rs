//! Node variant execution: `llm_generate`, `llm_tool_use`, `function`,
//! `router`. (`client_input` and `sub_graph` are handled directly by the
//! walk loop — one suspends the execution, the other recurses into it.)
//!
//! LLM calls stream frames: deltas forward to the event bus as they
//! arrive, the assembled response is checked against the node's output
//! contract. Schema and length violations get exactly one corrective
//! re-prompt that tells the model how to fix the output; transient I/O is
//! retried with backoff by [`crate::retry`].

use crate::error::{CoreError, Result};
use crate::event::EventPayload;
use crate::executor::{GraphExecutor, WalkCtx};
use crate::graph::{NodeSpec, NodeType};
use crate::llm::{ChatMessage, LlmFrame, LlmRequest, LlmResponse, ToolCallRequest};
use crate::retry::retry_transient;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Outcome status of one node execution.
///
/// `Failure` is reserved for structured error envelopes (a function
/// returning `{"error": ...}`): the node completed and `on_failure` edges
/// can route on it. Everything else that goes wrong is an `Err` that
/// fails the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Success,
    Failure,
    Paused,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Paused => "paused",
        }
    }
}

/// What a node produced.
#[derive(Debug, Clone)]
pub struct NodeOutput {
    pub outputs: Map<String, Value>,
    pub status: NodeStatus,
    /// Router reasoning, surfaced into the edge-selection decision.
    pub reasoning: Option<String>,
}

impl NodeOutput {
    pub fn success(outputs: Map<String, Value>) -> Self {
        Self {
            outputs,
            status: NodeStatus::Success,
            reasoning: None,
        }
    }

    pub fn failure(outputs: Map<String, Value>) -> Self {
        Self {
            outputs,
            status: NodeStatus::Failure,
            reasoning: None,
        }
    }
}

impl GraphExecutor {
    pub(crate) async fn run_node(
        &self,
        wc: &WalkCtx,
        node: &NodeSpec,
        inputs: Map<String, Value>,
    ) -> Result<NodeOutput> {
        match node.node_type {
            NodeType::LlmGenerate => self.run_llm_generate(wc, node, inputs).await,
            NodeType::LlmToolUse => self.run_llm_tool_use(wc, node, inputs).await,
            NodeType::Function => self.run_function(wc, node, inputs).await,
            NodeType::Router => self.run_router(wc, node, inputs).await,
            // Handled by the walk loop before dispatch.
            NodeType::ClientInput | NodeType::SubGraph => Err(CoreError::InvalidGraph(format!(
                "node '{}' cannot be dispatched as a plain node",
                node.id
            ))),
        }
    }

    /// One streaming LLM call with deadline, retry, and delta forwarding.
    async fn call_llm(
        &self,
        wc: &WalkCtx,
        node: &NodeSpec,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let timeout = self.config.llm_timeout;
        let response = retry_transient(&self.config.retry, &wc.cancel, |_| {
            let request = request.clone();
            async move {
                let call = async {
                    let mut rx = self.llm().stream(request, &wc.cancel).await?;
                    loop {
                        let frame = tokio::select! {
                            _ = wc.cancel.cancelled() => return Err(CoreError::Cancelled),
                            frame = rx.recv() => frame,
                        };
                        match frame {
                            Some(LlmFrame::Delta(text)) => {
                                wc.emit(EventPayload::LlmTextDelta {
                                    node_id: node.id.clone(),
                                    text: text.clone(),
                                });
                                if node.client_facing {
                                    wc.emit(EventPayload::ClientOutputDelta {
                                        node_id: node.id.clone(),
                                        text,
                                    });
                                }
                            }
                            Some(LlmFrame::Completed(response)) => return Ok(response),
                            None => {
                                return Err(CoreError::provider(
                                    "provider stream closed without completion",
                                    true,
                                ))
                            }
                        }
                    }
                };
                tokio::select! {
                    _ = wc.cancel.cancelled() => Err(CoreError::Cancelled),
                    result = tokio::time::timeout(timeout, call) => match result {
                        Ok(result) => result,
                        Err(_) => Err(CoreError::timeout("llm call", timeout.as_millis() as u64)),
                    },
                }
            }
        })
        .await?;

        wc.cost.lock().add_llm_call(
            response.usage.prompt_tokens,
            response.usage.completion_tokens,
        );
        Ok(response)
    }

    async fn run_llm_generate(
        &self,
        wc: &WalkCtx,
        node: &NodeSpec,
        inputs: Map<String, Value>,
    ) -> Result<NodeOutput> {
        let mut messages = vec![ChatMessage::user(serialize_inputs(&inputs))];
        let mut request = LlmRequest::new(messages.clone());
        if let Some(prompt) = &node.system_prompt {
            request = request.with_system_prompt(prompt.clone());
        }

        let response = self.call_llm(wc, node, &request).await?;
        let mut text = response.content.unwrap_or_default();

        // Length violations get one corrective re-prompt with a halved
        // explicit target, never a blind retry.
        if let Some(limit) = node.max_output_chars {
            if text.chars().count() > limit {
                let target = (limit / 2).max(1);
                debug!(node = %node.id, limit, target, "output over length; corrective re-prompt");
                messages.push(ChatMessage::assistant(text.clone(), Vec::new()));
                messages.push(ChatMessage::user(format!(
                    "Your answer was too long. Shorten it to at most {target} characters."
                )));
                let mut retry_request = LlmRequest::new(messages.clone());
                if let Some(prompt) = &node.system_prompt {
                    retry_request = retry_request.with_system_prompt(prompt.clone());
                }
                text = self
                    .call_llm(wc, node, &retry_request)
                    .await?
                    .content
                    .unwrap_or_default();
                if text.chars().count() > limit {
                    return Err(CoreError::LengthViolation {
                        node: node.id.clone(),
                        limit,
                    });
                }
            }
        }

        let outputs = self
            .conform_llm_output(wc, node, messages, text, None)
            .await?;
        Ok(NodeOutput::success(outputs))
    }

    async fn run_llm_tool_use(
        &self,
        wc: &WalkCtx,
        node: &NodeSpec,
        inputs: Map<String, Value>,
    ) -> Result<NodeOutput> {
        let catalog = self.tools().descriptors(&node.tools);
        let mut messages = vec![ChatMessage::user(serialize_inputs(&inputs))];
        let mut calls_made: u32 = 0;

        loop {
            let mut request = LlmRequest::new(messages.clone()).with_tools(catalog.clone());
            if let Some(prompt) = &node.system_prompt {
                request = request.with_system_prompt(prompt.clone());
            }
            let response = self.call_llm(wc, node, &request).await?;

            if response.tool_calls.is_empty() {
                let text = response.content.unwrap_or_default();
                let outputs = self
                    .conform_llm_output(wc, node, messages, text, Some(catalog.clone()))
                    .await?;
                return Ok(NodeOutput::success(outputs));
            }

            messages.push(ChatMessage::assistant(
                response.content.clone().unwrap_or_default(),
                response.tool_calls.clone(),
            ));

            for call in response.tool_calls {
                calls_made += 1;
                if calls_made > self.config.tool_call_cap {
                    return Err(CoreError::ToolLoopExceeded {
                        node: node.id.clone(),
                        calls: self.config.tool_call_cap,
                    });
                }

                wc.emit(EventPayload::ToolCallStarted {
                    node_id: node.id.clone(),
                    tool: call.name.clone(),
                    call_id: call.id.clone(),
                });
                let result = self.dispatch_tool(wc, &call).await;
                let is_error = result.is_err();
                wc.emit(EventPayload::ToolCallCompleted {
                    node_id: node.id.clone(),
                    tool: call.name.clone(),
                    call_id: call.id.clone(),
                    is_error,
                });

                match result {
                    Ok(value) => {
                        messages.push(ChatMessage::tool_result(&call.id, value.to_string()));
                    }
                    Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
                    // Fatal tool errors are injected back so the model can
                    // adapt; transient ones were already retried away.
                    Err(e) => {
                        warn!(node = %node.id, tool = %call.name, error = %e, "tool call failed");
                        messages.push(ChatMessage::tool_result(
                            &call.id,
                            serde_json::json!({ "error": e.to_string() }).to_string(),
                        ));
                    }
                }
            }
        }
    }

    /// Dispatch one model-issued tool call through the registry with the
    /// per-call deadline and transient retries.
    async fn dispatch_tool(&self, wc: &WalkCtx, call: &ToolCallRequest) -> Result<Value> {
        let Some(tool) = self.tools().get(&call.name) else {
            return Err(CoreError::tool(&call.name, "tool not found", false));
        };
        let timeout = self.config.tool_timeout;

        let value = retry_transient(&self.config.retry, &wc.cancel, |_| {
            let tool = tool.clone();
            let arguments = call.arguments.clone();
            let name = call.name.clone();
            async move {
                match tokio::time::timeout(timeout, tool.call(arguments, &wc.cancel)).await {
                    Ok(result) => result,
                    Err(_) => Err(CoreError::tool(
                        name,
                        format!("timed out after {}ms", timeout.as_millis()),
                        true,
                    )),
                }
            }
        })
        .await?;

        wc.cost.lock().add_tool_call();
        Ok(value)
    }

    /// Map final LLM text onto the node's output keys, with one corrective
    /// schema re-prompt when a structured object is required but missing.
    async fn conform_llm_output(
        &self,
        wc: &WalkCtx,
        node: &NodeSpec,
        mut messages: Vec<ChatMessage>,
        text: String,
        tools: Option<Vec<crate::tool::ToolDescriptor>>,
    ) -> Result<Map<String, Value>> {
        if let Some(outputs) = map_llm_text(node, &text) {
            return Ok(outputs);
        }

        let keys = node.output_keys.join(", ");
        debug!(node = %node.id, keys = %keys, "schema violation; corrective re-prompt");
        messages.push(ChatMessage::assistant(text, Vec::new()));
        messages.push(ChatMessage::user(format!(
            "Your answer did not match the required schema. \
             Return only a JSON object with exactly these keys: {keys}."
        )));
        let mut request = LlmRequest::new(messages);
        if let Some(prompt) = &node.system_prompt {
            request = request.with_system_prompt(prompt.clone());
        }
        if let Some(tools) = tools {
            request = request.with_tools(tools);
        }
        let retry_text = self
            .call_llm(wc, node, &request)
            .await?
            .content
            .unwrap_or_default();

        map_llm_text(node, &retry_text).ok_or_else(|| CoreError::SchemaViolation {
            node: node.id.clone(),
            detail: format!("output does not cover keys: {keys}"),
        })
    }

    async fn run_function(
        &self,
        wc: &WalkCtx,
        node: &NodeSpec,
        inputs: Map<String, Value>,
    ) -> Result<NodeOutput> {
        let name = node.function_name();
        let value = match self.functions().get(name) {
            Some(function) => {
                let fut = function(Value::Object(inputs.clone()));
                tokio::select! {
                    _ = wc.cancel.cancelled() => return Err(CoreError::Cancelled),
                    result = fut => result?,
                }
            }
            None if node.function.is_some() => {
                return Err(CoreError::NodeNotRegistered {
                    node: node.id.clone(),
                    function: name.to_string(),
                });
            }
            // No explicit function and nothing registered under the node
            // id: identity pass-through.
            None => Value::Object(inputs),
        };

        match value {
            Value::Object(map) => {
                if map.contains_key("error") {
                    Ok(NodeOutput::failure(map))
                } else {
                    Ok(NodeOutput::success(map))
                }
            }
            other => {
                let Some(key) = node.output_keys.first() else {
                    return Err(CoreError::State(format!(
                        "function '{name}' returned a non-object with no output key to bind it to"
                    )));
                };
                let mut map = Map::new();
                map.insert(key.clone(), other);
                Ok(NodeOutput::success(map))
            }
        }
    }

    async fn run_router(
        &self,
        wc: &WalkCtx,
        node: &NodeSpec,
        inputs: Map<String, Value>,
    ) -> Result<NodeOutput> {
        let routed_key = node
            .output_keys
            .first()
            .cloned()
            .unwrap_or_else(|| "routed".to_string());

        let (label, reasoning) = match &node.function {
            Some(function_name) => {
                let Some(function) = self.functions().get(function_name) else {
                    return Err(CoreError::NodeNotRegistered {
                        node: node.id.clone(),
                        function: function_name.clone(),
                    });
                };
                let fut = function(Value::Object(inputs));
                let value = tokio::select! {
                    _ = wc.cancel.cancelled() => return Err(CoreError::Cancelled),
                    result = fut => result?,
                };
                match value {
                    Value::String(label) => (label, None),
                    Value::Object(map) => {
                        let label = map
                            .get("label")
                            .or_else(|| map.get(&routed_key))
                            .and_then(Value::as_str)
                            .ok_or_else(|| {
                                CoreError::State(format!(
                                    "router '{}' returned no label",
                                    node.id
                                ))
                            })?
                            .to_string();
                        let reasoning = map
                            .get("reasoning")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        (label, reasoning)
                    }
                    other => {
                        return Err(CoreError::State(format!(
                            "router '{}' returned unusable value: {other}",
                            node.id
                        )))
                    }
                }
            }
            None => {
                // LLM-backed router: the reply text is the label.
                let mut request =
                    LlmRequest::new(vec![ChatMessage::user(serialize_inputs(&inputs))]);
                if let Some(prompt) = &node.system_prompt {
                    request = request.with_system_prompt(prompt.clone());
                }
                let response = self.call_llm(wc, node, &request).await?;
                let text = response.content.unwrap_or_default();
                let label = text.trim().to_string();
                (label.clone(), Some(text))
            }
        };

        let mut outputs = Map::new();
        outputs.insert(routed_key, Value::String(label));
        Ok(NodeOutput {
            outputs,
            status: NodeStatus::Success,
            reasoning,
        })
    }
}

fn serialize_inputs(inputs: &Map<String, Value>) -> String {
    serde_json::to_string_pretty(&Value::Object(inputs.clone()))
        .unwrap_or_else(|_| "{}".to_string())
}

/// Map LLM text onto output keys: a JSON object covering every key wins;
/// a single declared key accepts plain text; no keys means no outputs.
fn map_llm_text(node: &NodeSpec, text: &str) -> Option<Map<String, Value>> {
    if node.output_keys.is_empty() {
        return Some(Map::new());
    }
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text) {
        if node.output_keys.iter().all(|k| obj.contains_key(k)) {
            return Some(obj);
        }
    }
    if node.output_keys.len() == 1 {
        let mut map = Map::new();
        map.insert(
            node.output_keys[0].clone(),
            Value::String(text.to_string()),
        );
        return Some(map);
    }
    None
}
