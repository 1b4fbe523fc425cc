//! Stdio MCP client: spawn the server as a child process and speak framed
//! JSON-RPC over its stdin/stdout.
//!
//! At most one request is in flight at a time (paired by id); the client
//! is safe to share across tasks, serialization is internal. A dead or
//! misbehaving server moves the client into a failed state: the in-flight
//! call and every later one fail with `TransportClosed` carrying the
//! original cause until [`StdioClient::connect`] is invoked again.

use crate::error::{McpError, Result};
use crate::protocol::{
    read_frame, write_frame, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, RequestId,
};
use crate::{CLIENT_NAME, PROTOCOL_VERSION};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long `initialize` may take before the handshake is failed.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);
/// Grace period between asking the child to exit and killing it.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// How to launch an MCP server process. Always an explicit argv — the
/// client never hands a string to a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioServerSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl StdioServerSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<crate::protocol::JsonRpcResponse>>>>;

struct Connection {
    child: Child,
    writer: BufWriter<ChildStdin>,
    pending: PendingMap,
    /// Set by the reader task when the transport dies.
    failure: Arc<Mutex<Option<String>>>,
    reader_task: tokio::task::JoinHandle<()>,
}

/// MCP client over a child process's stdio.
pub struct StdioClient {
    spec: StdioServerSpec,
    connection: tokio::sync::Mutex<Option<Connection>>,
    /// Serializes requests: one in flight per stdio client.
    request_lock: tokio::sync::Mutex<()>,
    next_id: AtomicI64,
}

impl StdioClient {
    pub fn new(spec: StdioServerSpec) -> Self {
        Self {
            spec,
            connection: tokio::sync::Mutex::new(None),
            request_lock: tokio::sync::Mutex::new(()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Spawn the server process and perform the initialize handshake.
    ///
    /// Replaces any previous (possibly failed) connection.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut connection = self.connection.lock().await;
            if let Some(old) = connection.take() {
                shutdown_connection(old).await;
            }

            let mut child = Command::new(&self.spec.command)
                .args(&self.spec.args)
                .envs(self.spec.env.iter().cloned())
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    McpError::Transport(format!("spawn '{}': {e}", self.spec.command))
                })?;

            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| McpError::Transport("child stdin unavailable".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| McpError::Transport("child stdout unavailable".into()))?;

            let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
            let failure = Arc::new(Mutex::new(None));
            let reader_task = tokio::spawn(reader_loop(
                BufReader::new(stdout),
                pending.clone(),
                failure.clone(),
            ));

            *connection = Some(Connection {
                child,
                writer: BufWriter::new(stdin),
                pending,
                failure,
                reader_task,
            });
        }

        // Initialize handshake, then the initialized notification.
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
                HANDSHAKE_TIMEOUT,
                &CancellationToken::new(),
            )
            .await
            .map_err(|e| match e {
                McpError::Timeout { .. } => {
                    McpError::HandshakeFailed("timed out waiting for initialize".into())
                }
                McpError::ToolError { code, message } => {
                    McpError::HandshakeFailed(format!("server refused initialize ({code}): {message}"))
                }
                other => other,
            })?;
        debug!(server = %self.spec.command, info = %result, "MCP handshake complete");

        self.notify("notifications/initialized", json!({})).await?;
        Ok(())
    }

    /// Whether the transport is currently usable.
    pub async fn is_connected(&self) -> bool {
        let connection = self.connection.lock().await;
        match connection.as_ref() {
            Some(c) => c.failure.lock().is_none(),
            None => false,
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let mut connection = self.connection.lock().await;
        let connection = connection
            .as_mut()
            .ok_or_else(|| McpError::TransportClosed {
                cause: "not connected".into(),
            })?;
        write_frame(
            &mut connection.writer,
            &JsonRpcNotification::new(method, params),
        )
        .await
    }

    /// Issue one request and await its response under a deadline.
    ///
    /// On cancellation a `$/cancelRequest` notification is sent and the
    /// reply is no longer awaited.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let _in_flight = self.request_lock.lock().await;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let (pending, failure) = {
            let mut connection = self.connection.lock().await;
            let connection = connection
                .as_mut()
                .ok_or_else(|| McpError::TransportClosed {
                    cause: "not connected".into(),
                })?;
            if let Some(cause) = connection.failure.lock().clone() {
                return Err(McpError::TransportClosed { cause });
            }
            connection.pending.lock().insert(id, tx);
            let request = JsonRpcRequest::new(id, method, params);
            if let Err(e) = write_frame(&mut connection.writer, &request).await {
                connection.pending.lock().remove(&id);
                return Err(e);
            }
            (connection.pending.clone(), connection.failure.clone())
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                pending.lock().remove(&id);
                let _ = self
                    .notify("$/cancelRequest", json!({ "id": id }))
                    .await;
                return Err(McpError::Cancelled);
            }
            _ = tokio::time::sleep(timeout) => {
                pending.lock().remove(&id);
                return Err(McpError::Timeout { ms: timeout.as_millis() as u64 });
            }
            response = rx => match response {
                Ok(response) => response,
                Err(_) => {
                    let cause = failure
                        .lock()
                        .clone()
                        .unwrap_or_else(|| "server closed the transport".into());
                    return Err(McpError::TransportClosed { cause });
                }
            },
        };

        if let Some(error) = response.error {
            return Err(McpError::ToolError {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Terminate the child: close stdin, wait out the grace period, then
    /// kill. Never hangs.
    pub async fn close(&self) {
        let mut connection = self.connection.lock().await;
        if let Some(connection) = connection.take() {
            shutdown_connection(connection).await;
        }
    }
}

async fn shutdown_connection(mut connection: Connection) {
    // Dropping stdin signals EOF; most servers exit on it.
    drop(connection.writer);
    match tokio::time::timeout(CLOSE_GRACE, connection.child.wait()).await {
        Ok(Ok(status)) => debug!(?status, "MCP server exited"),
        Ok(Err(e)) => warn!(error = %e, "error waiting for MCP server"),
        Err(_) => {
            warn!("MCP server did not exit within grace period; killing");
            let _ = connection.child.start_kill();
            let _ = connection.child.wait().await;
        }
    }
    connection.reader_task.abort();
    connection.pending.lock().clear();
}

async fn reader_loop(
    mut reader: BufReader<tokio::process::ChildStdout>,
    pending: PendingMap,
    failure: Arc<Mutex<Option<String>>>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(JsonRpcMessage::Response(response))) => {
                let id = match &response.id {
                    Some(RequestId::Number(n)) => *n,
                    other => {
                        debug!(?other, "response with unroutable id");
                        continue;
                    }
                };
                if let Some(tx) = pending.lock().remove(&id) {
                    let _ = tx.send(response);
                } else {
                    debug!(id, "response for unknown request (cancelled or timed out)");
                }
            }
            Ok(Some(JsonRpcMessage::Notification(notification))) => {
                debug!(method = %notification.method, "server notification ignored");
            }
            Ok(Some(JsonRpcMessage::Request(request))) => {
                // Server-initiated requests (roots/list etc.) are out of
                // scope for the tool substrate.
                debug!(method = %request.method, "server request ignored");
            }
            Ok(None) => {
                *failure.lock() = Some("server closed stdout".into());
                break;
            }
            Err(e) => {
                *failure.lock() = Some(e.to_string());
                break;
            }
        }
    }
    // Wake every waiter; their oneshot senders drop with the map.
    pending.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_spec_builder() {
        let spec = StdioServerSpec::new("mcp-server")
            .args(["--port", "0"])
            .env("API_KEY", "k");
        assert_eq!(spec.command, "mcp-server");
        assert_eq!(spec.args, vec!["--port", "0"]);
        assert_eq!(spec.env, vec![("API_KEY".to_string(), "k".to_string())]);
    }

    #[tokio::test]
    async fn test_request_without_connect_is_closed() {
        let client = StdioClient::new(StdioServerSpec::new("unused"));
        let err = client
            .request(
                "tools/list",
                json!({}),
                Duration::from_millis(100),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::TransportClosed { .. }));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_to_missing_binary_fails() {
        let client = StdioClient::new(StdioServerSpec::new(
            "definitely-not-a-real-mcp-server-binary",
        ));
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, McpError::Transport(_)));
    }
}
