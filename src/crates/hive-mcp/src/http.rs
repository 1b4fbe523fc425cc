//! HTTP MCP client: one JSON-RPC request per POST.
//!
//! Implements the streamable-HTTP transport shape: POST a single JSON-RPC
//! message with `Accept: application/json, text/event-stream`, parse either
//! a plain JSON body or the first JSON-RPC response in an SSE body, and
//! echo the server's `Mcp-Session-Id` header on subsequent requests.
//! Unlike stdio, HTTP clients may issue concurrent requests.

use crate::error::{McpError, Result};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::{CLIENT_NAME, PROTOCOL_VERSION};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SESSION_HEADER: &str = "Mcp-Session-Id";
const PROTOCOL_HEADER: &str = "Mcp-Protocol-Version";

/// MCP client over HTTP.
pub struct HttpClient {
    client: reqwest::Client,
    url: String,
    /// Extra headers (auth etc.) sent on every request.
    headers: Vec<(String, String)>,
    session_id: Mutex<Option<String>>,
    next_id: AtomicI64,
}

impl HttpClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            headers: Vec::new(),
            session_id: Mutex::new(None),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Perform the initialize handshake against the server URL.
    pub async fn connect(&self) -> Result<()> {
        *self.session_id.lock() = None;
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "clientInfo": {
                        "name": CLIENT_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
                Duration::from_secs(20),
                &CancellationToken::new(),
            )
            .await
            .map_err(|e| match e {
                McpError::ToolError { code, message } => McpError::HandshakeFailed(format!(
                    "server refused initialize ({code}): {message}"
                )),
                McpError::Timeout { .. } => {
                    McpError::HandshakeFailed("timed out waiting for initialize".into())
                }
                other => other,
            })?;
        debug!(url = %self.url, info = %result, "MCP handshake complete");

        self.post_notification("notifications/initialized", json!({}))
            .await?;
        Ok(())
    }

    fn builder(&self, body: Value, timeout: Duration) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .header("Accept", "application/json, text/event-stream")
            .header(PROTOCOL_HEADER, PROTOCOL_VERSION)
            .json(&body);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        if let Some(session) = self.session_id.lock().clone() {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder
    }

    async fn post_notification(&self, method: &str, params: Value) -> Result<()> {
        let body = serde_json::to_value(JsonRpcNotification::new(method, params))?;
        let response = self
            .builder(body, Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::ACCEPTED {
            return Err(McpError::Transport(format!(
                "notification rejected with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Issue one JSON-RPC request over POST under a deadline.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = serde_json::to_value(JsonRpcRequest::new(id, method, params))?;

        let send = async {
            let response = self
                .builder(body, timeout)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        McpError::Timeout {
                            ms: timeout.as_millis() as u64,
                        }
                    } else {
                        McpError::Transport(e.to_string())
                    }
                })?;

            if let Some(session) = response.headers().get(SESSION_HEADER) {
                if let Ok(session) = session.to_str() {
                    *self.session_id.lock() = Some(session.to_string());
                }
            }
            let status = response.status();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let text = response
                .text()
                .await
                .map_err(|e| McpError::Transport(e.to_string()))?;
            if !status.is_success() {
                return Err(McpError::Transport(format!(
                    "POST returned {status}: {}",
                    text.chars().take(200).collect::<String>()
                )));
            }
            parse_response_body(&text, &content_type)
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(McpError::Cancelled),
            response = send => response?,
        };

        if let Some(error) = response.error {
            return Err(McpError::ToolError {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// HTTP transports hold no persistent resources beyond the pool.
    pub async fn close(&self) {
        *self.session_id.lock() = None;
    }
}

/// Parse a JSON-RPC response from a plain JSON body or an SSE stream body
/// (the first `data:` payload carrying a result or error wins).
fn parse_response_body(body: &str, content_type: &str) -> Result<JsonRpcResponse> {
    if content_type.contains("text/event-stream") {
        for line in body.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            if let Ok(response) = serde_json::from_str::<JsonRpcResponse>(data) {
                if response.result.is_some() || response.error.is_some() {
                    return Ok(response);
                }
            }
        }
        Err(McpError::Transport(
            "SSE body contained no JSON-RPC response".into(),
        ))
    } else {
        serde_json::from_str(body)
            .map_err(|e| McpError::Transport(format!("response body is not JSON-RPC: {e}")))
    }
}
