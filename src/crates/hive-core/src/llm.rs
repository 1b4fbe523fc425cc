//! LLM provider contract.
//!
//! The engine binds to no vendor: providers implement [`LlmProvider`],
//! streaming a channel of [`LlmFrame`]s per call. The executor forwards
//! text deltas to the event bus and assembles the final message when the
//! stream closes. [`ScriptedProvider`] is the deterministic implementation
//! used throughout the test suites.

use crate::error::{CoreError, Result};
use crate::tool::ToolDescriptor;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Chat roles recognized by the request contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One turn in the conversation sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// Tool result injected back into the conversation.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Request contract: the only thing the engine knows about providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl LlmRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDescriptor>) -> Self {
        self.tools = tools;
        self
    }
}

/// Final provider reply: text, tool calls, or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl LlmResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn tool_call(call: ToolCallRequest) -> Self {
        Self {
            tool_calls: vec![call],
            ..Default::default()
        }
    }
}

/// One frame of a streaming LLM call.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmFrame {
    /// Incremental text.
    Delta(String),
    /// Stream end with the assembled response.
    Completed(LlmResponse),
}

/// Vendor-neutral provider interface.
///
/// `stream` must observe the cancellation token: a cancelled call stops
/// producing frames and the sender side drops. Transport failures map onto
/// [`CoreError::Provider`] with the transient flag set for timeouts, 5xx,
/// and rate limits.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn stream(
        &self,
        request: LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<LlmFrame>>;

    /// Drain the stream and return the final response.
    async fn generate(
        &self,
        request: LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse> {
        let mut rx = self.stream(request, cancel).await?;
        while let Some(frame) = rx.recv().await {
            if let LlmFrame::Completed(response) = frame {
                return Ok(response);
            }
        }
        Err(CoreError::provider("stream closed without completion", true))
    }
}

/// One scripted reply for [`ScriptedProvider`].
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    /// Deltas streamed before completion; defaults to chunking the content.
    pub deltas: Vec<String>,
    pub response: LlmResponse,
    /// Artificial latency before the first frame.
    pub delay: Option<Duration>,
    /// Fail instead of replying: `(message, transient)`.
    pub error: Option<(String, bool)>,
}

/// Deterministic provider replaying a queue of scripted replies.
///
/// The in-memory counterpart of a real provider, used by the executor and
/// runtime test suites. Each `stream` call pops the next reply; an empty
/// queue is a fatal provider error.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.replies.lock().push_back(reply);
    }

    /// Queue a plain-text reply streamed as whitespace-split deltas.
    pub fn push_text(&self, text: impl Into<String>) {
        let text = text.into();
        let deltas = text
            .split_inclusive(' ')
            .map(str::to_string)
            .collect::<Vec<_>>();
        self.push(ScriptedReply {
            deltas,
            response: LlmResponse {
                content: Some(text),
                tool_calls: Vec::new(),
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                },
            },
            delay: None,
            error: None,
        });
    }

    /// Queue a reply that requests one tool call.
    pub fn push_tool_call(&self, name: impl Into<String>, arguments: Value) {
        let name = name.into();
        self.push(ScriptedReply {
            deltas: Vec::new(),
            response: LlmResponse::tool_call(ToolCallRequest {
                id: format!("call-{name}"),
                name,
                arguments,
            }),
            delay: None,
            error: None,
        });
    }

    /// Queue a reply that takes `delay` before completing.
    pub fn push_text_after(&self, text: impl Into<String>, delay: Duration) {
        let text = text.into();
        self.push(ScriptedReply {
            deltas: vec![text.clone()],
            response: LlmResponse::text(text),
            delay: Some(delay),
            error: None,
        });
    }

    /// Queue a failure.
    pub fn push_error(&self, message: impl Into<String>, transient: bool) {
        self.push(ScriptedReply {
            deltas: Vec::new(),
            response: LlmResponse::default(),
            delay: None,
            error: Some((message.into(), transient)),
        });
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn stream(
        &self,
        _request: LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<LlmFrame>> {
        let reply = self
            .replies
            .lock()
            .pop_front()
            .ok_or_else(|| CoreError::provider("scripted provider exhausted", false))?;
        if let Some((message, transient)) = reply.error {
            return Err(CoreError::provider(message, transient));
        }

        let (tx, rx) = mpsc::channel(16);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Some(delay) = reply.delay {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            for delta in reply.deltas {
                if cancel.is_cancelled() {
                    return;
                }
                if tx.send(LlmFrame::Delta(delta)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(LlmFrame::Completed(reply.response)).await;
        });
        Ok(rx)
    }
}
