use super::error::{ConnectError, InvokeError};
use crate::config::ServerConfig;
use crate::domain::types::ToolDescriptor;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "2025-06-18";

/// Lifecycle of one tool-server connection. Ready is the only state in which
/// the catalog is valid; there is no transition out of Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    Degraded,
    Closed,
}

/// One live connection to a tool-providing process. The trait is the seam the
/// pool routes through, so tests can substitute in-process stubs.
#[async_trait]
pub trait ToolSession: Send + Sync {
    fn name(&self) -> &str;
    fn state(&self) -> SessionState;
    /// Catalog snapshot in the server's declaration order. Empty unless Ready.
    fn catalog(&self) -> Vec<ToolDescriptor>;
    async fn invoke(&self, tool: &str, arguments: Value) -> Result<Value, InvokeError>;
    async fn close(&self);
}

/// MCP session over a child process's stdio, speaking line-delimited
/// JSON-RPC 2.0. Responses are correlated to requests by numeric id, so
/// concurrent in-flight calls on one session are safe.
pub struct McpSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    server: ServerConfig,
    handshake_timeout: Duration,
    invoke_timeout: Duration,
    state: Mutex<SessionState>,
    child: AsyncMutex<Option<Child>>,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, InvokeError>>>>,
    catalog: Mutex<Vec<ToolDescriptor>>,
    instructions: Mutex<Option<String>>,
    id_counter: AtomicU64,
}

impl McpSession {
    pub fn new(server: ServerConfig, handshake_timeout: Duration, invoke_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                server,
                handshake_timeout,
                invoke_timeout,
                state: Mutex::new(SessionState::Connecting),
                child: AsyncMutex::new(None),
                writer: AsyncMutex::new(None),
                pending: Mutex::new(HashMap::new()),
                catalog: Mutex::new(Vec::new()),
                instructions: Mutex::new(None),
                id_counter: AtomicU64::new(1),
            }),
        }
    }

    /// Launch the process, run the protocol handshake, and fetch the tool
    /// catalog. On failure the session drops to Degraded and the caller may
    /// retry `connect()`.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let inner = &self.inner;
        if inner.current_state() == SessionState::Closed {
            return Err(ConnectError::Closed {
                server: inner.server.name.clone(),
            });
        }
        inner.set_state(SessionState::Connecting);

        let mut command = Command::new(&inner.server.command);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = &inner.server.workdir {
            command.current_dir(dir);
        }
        if !inner.server.args.is_empty() {
            command.args(&inner.server.args);
        }
        for (key, value) in &inner.server.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| ConnectError::Spawn {
            server: inner.server.name.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| ConnectError::Handshake {
            server: inner.server.name.clone(),
            message: "failed to capture server stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ConnectError::Handshake {
            server: inner.server.name.clone(),
            message: "failed to capture server stdout".to_string(),
        })?;

        *inner.writer.lock().await = Some(BufWriter::new(stdin));
        *inner.child.lock().await = Some(child);

        let reader_inner = Arc::clone(inner);
        tokio::spawn(async move {
            reader_inner.reader_loop(stdout).await;
        });

        match timeout(inner.handshake_timeout, inner.initialize_sequence()).await {
            Ok(Ok(())) => {
                inner.set_state(SessionState::Ready);
                info!(server = %inner.server.name, "MCP session ready");
                Ok(())
            }
            Ok(Err(err)) => {
                inner.teardown(SessionState::Degraded).await;
                Err(ConnectError::Handshake {
                    server: inner.server.name.clone(),
                    message: err.to_string(),
                })
            }
            Err(_) => {
                inner.teardown(SessionState::Degraded).await;
                Err(ConnectError::HandshakeTimeout {
                    server: inner.server.name.clone(),
                    timeout: inner.handshake_timeout,
                })
            }
        }
    }

    pub fn server_instructions(&self) -> Option<String> {
        self.inner.instructions.lock().expect("instructions lock").clone()
    }
}

#[async_trait]
impl ToolSession for McpSession {
    fn name(&self) -> &str {
        &self.inner.server.name
    }

    fn state(&self) -> SessionState {
        self.inner.current_state()
    }

    fn catalog(&self) -> Vec<ToolDescriptor> {
        self.inner.catalog.lock().expect("catalog lock").clone()
    }

    async fn invoke(&self, tool: &str, arguments: Value) -> Result<Value, InvokeError> {
        let inner = &self.inner;
        if inner.current_state() != SessionState::Ready {
            return Err(InvokeError::NotReady {
                server: inner.server.name.clone(),
            });
        }

        let params = json!({
            "name": tool,
            "arguments": match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            }
        });

        let result = inner
            .send_request("tools/call", params, Some(inner.invoke_timeout), Some(tool))
            .await?;

        // A structured remote failure is still a JSON-RPC success; MCP flags
        // it through isError on the result.
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if is_error {
            let message = extract_tool_text(&result)
                .unwrap_or_else(|| "tool reported an unspecified error".to_string());
            return Err(InvokeError::Tool {
                server: inner.server.name.clone(),
                tool: tool.to_string(),
                message,
            });
        }
        Ok(result)
    }

    async fn close(&self) {
        self.inner.teardown(SessionState::Closed).await;
        debug!(server = %self.inner.server.name, "MCP session closed");
    }
}

impl SessionInner {
    fn current_state(&self) -> SessionState {
        *self.state.lock().expect("state lock")
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().expect("state lock");
        if *state == SessionState::Closed {
            return;
        }
        *state = next;
    }

    async fn initialize_sequence(self: &Arc<Self>) -> Result<(), InvokeError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {}
        });
        let init_result = self.send_request("initialize", params, None, None).await?;
        if let Some(text) = init_result.get("instructions").and_then(Value::as_str) {
            *self.instructions.lock().expect("instructions lock") = Some(text.to_string());
        }
        self.send_notification("notifications/initialized", json!({}))
            .await?;
        self.refresh_tools().await
    }

    async fn refresh_tools(self: &Arc<Self>) -> Result<(), InvokeError> {
        let result = self.send_request("tools/list", json!({}), None, None).await?;
        let mut tools = Vec::new();
        if let Some(array) = result.get("tools").and_then(Value::as_array) {
            for tool in array {
                let Some(name) = tool.get("name").and_then(Value::as_str) else {
                    continue;
                };
                tools.push(ToolDescriptor {
                    name: name.to_string(),
                    description: tool
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    server: self.server.name.clone(),
                    input_schema: tool.get("inputSchema").cloned(),
                });
            }
        }
        debug!(server = %self.server.name, tools = tools.len(), "Tool catalog refreshed");
        *self.catalog.lock().expect("catalog lock") = tools;
        Ok(())
    }

    async fn reader_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(item) = lines.next_line().await {
            match item {
                Some(raw) => {
                    let trimmed = raw.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(trimmed) {
                        Ok(value) => self.process_inbound(value).await,
                        Err(source) => {
                            warn!(
                                server = %self.server.name,
                                line = trimmed,
                                %source,
                                "received invalid JSON from MCP server"
                            );
                        }
                    }
                }
                None => break,
            }
        }

        // Unexpected stream closure: the session degrades and its catalog is
        // no longer valid. An explicit close() has already set Closed.
        if self.current_state() != SessionState::Closed {
            warn!(server = %self.server.name, "MCP server stream closed; session degraded");
            self.teardown(SessionState::Degraded).await;
        }
    }

    async fn process_inbound(self: &Arc<Self>, value: Value) {
        if let Some(id) = value.get("id") {
            if value.get("method").is_some() {
                self.handle_server_request(id.clone(), &value).await;
            } else if let Some(key) = id.as_u64() {
                self.handle_response(key, value);
            }
        } else if let Some(method) = value.get("method").and_then(Value::as_str) {
            debug!(server = %self.server.name, method, "notification from server");
            if method == "notifications/tools/list_changed" {
                if let Err(err) = self.refresh_tools().await {
                    warn!(server = %self.server.name, %err, "failed to refresh tool catalog");
                }
            }
        }
    }

    fn handle_response(&self, id: u64, value: Value) {
        let responder = self.pending.lock().expect("pending lock").remove(&id);
        let Some(sender) = responder else {
            debug!(server = %self.server.name, response_id = id, "response for unknown request");
            return;
        };

        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            let _ = sender.send(Err(InvokeError::Transport {
                server: self.server.name.clone(),
                message,
            }));
        } else {
            let result = value.get("result").cloned().unwrap_or(Value::Null);
            let _ = sender.send(Ok(result));
        }
    }

    async fn handle_server_request(&self, id: Value, value: &Value) {
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let outcome = match method {
            "ping" => self.send_response(id, json!({})).await,
            other => {
                warn!(server = %self.server.name, method = other, "server sent unsupported request");
                self.send_error(
                    id,
                    json!({
                        "code": -32601,
                        "message": format!("client does not implement method '{other}'"),
                    }),
                )
                .await
            }
        };
        if let Err(err) = outcome {
            warn!(server = %self.server.name, %err, "failed to answer server request");
        }
    }

    async fn send_request(
        &self,
        method: &str,
        params: Value,
        deadline: Option<Duration>,
        tool: Option<&str>,
    ) -> Result<Value, InvokeError> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(id, tx);

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        if let Err(err) = self.write_message(&payload).await {
            self.pending.lock().expect("pending lock").remove(&id);
            return Err(err);
        }

        let awaited = match deadline {
            Some(window) => match timeout(window, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.lock().expect("pending lock").remove(&id);
                    return Err(InvokeError::Timeout {
                        server: self.server.name.clone(),
                        tool: tool.unwrap_or(method).to_string(),
                        timeout: window,
                    });
                }
            },
            None => rx.await,
        };

        match awaited {
            Ok(result) => result,
            Err(_) => Err(InvokeError::Terminated {
                server: self.server.name.clone(),
            }),
        }
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), InvokeError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });
        self.write_message(&payload).await
    }

    async fn send_response(&self, id: Value, result: Value) -> Result<(), InvokeError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result
        });
        self.write_message(&payload).await
    }

    async fn send_error(&self, id: Value, error: Value) -> Result<(), InvokeError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": error
        });
        self.write_message(&payload).await
    }

    async fn write_message(&self, message: &Value) -> Result<(), InvokeError> {
        let encoded = serde_json::to_string(message).map_err(|source| InvokeError::InvalidJson {
            server: self.server.name.clone(),
            source,
        })?;

        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or_else(|| InvokeError::Transport {
            server: self.server.name.clone(),
            message: "writer not initialised".to_string(),
        })?;
        let io_err = |source: std::io::Error| InvokeError::Transport {
            server: self.server.name.clone(),
            message: source.to_string(),
        };
        stream.write_all(encoded.as_bytes()).await.map_err(io_err)?;
        stream.write_all(b"\n").await.map_err(io_err)?;
        stream.flush().await.map_err(io_err)?;
        Ok(())
    }

    /// Release the transport and fail every pending call. Used for explicit
    /// close (terminal) and for degrading after a transport error.
    async fn teardown(&self, target: SessionState) {
        {
            let mut state = self.state.lock().expect("state lock");
            if *state != SessionState::Closed {
                *state = target;
            }
        }

        *self.writer.lock().await = None;
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.kill().await {
                debug!(
                    server = %self.server.name,
                    %err,
                    "failed to kill MCP server process (may have already exited)"
                );
            }
            let _ = child.wait().await;
        }

        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending lock");
            pending.drain().collect()
        };
        for (_, sender) in drained {
            let _ = sender.send(Err(InvokeError::Terminated {
                server: self.server.name.clone(),
            }));
        }

        self.catalog.lock().expect("catalog lock").clear();
    }
}

/// Pull the first text content block out of a tools/call result.
pub fn extract_tool_text(result: &Value) -> Option<String> {
    if let Some(array) = result.get("content").and_then(Value::as_array) {
        for block in array {
            let is_text = block
                .get("type")
                .and_then(Value::as_str)
                .map(|kind| kind.eq_ignore_ascii_case("text"))
                .unwrap_or(false);
            if is_text {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        return Some(trimmed.to_string());
                    }
                }
            }
        }
    }
    None
}
