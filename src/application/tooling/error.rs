use std::time::Duration;
use thiserror::Error;

/// Failures while establishing a session. The session is unusable afterward
/// except to retry `connect()`.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to spawn MCP server '{server}': {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },
    #[error("MCP server '{server}' handshake failed: {message}")]
    Handshake { server: String, message: String },
    #[error("MCP server '{server}' handshake timed out after {timeout:?}")]
    HandshakeTimeout { server: String, timeout: Duration },
    #[error("MCP server '{server}' session is closed")]
    Closed { server: String },
}

/// Failures for a single tool invocation. All of these are recoverable from
/// the loop's point of view: they become observations the model can react to.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("unknown tool requested: {0}")]
    UnknownTool(String),
    #[error("tool '{tool}' on server '{server}' timed out after {timeout:?}")]
    Timeout {
        server: String,
        tool: String,
        timeout: Duration,
    },
    #[error("server '{server}' reported a failure for tool '{tool}': {message}")]
    Tool {
        server: String,
        tool: String,
        message: String,
    },
    #[error("server '{server}' transport error: {message}")]
    Transport { server: String, message: String },
    #[error("server '{server}' terminated with the request in flight")]
    Terminated { server: String },
    #[error("server '{server}' session is not ready")]
    NotReady { server: String },
    #[error("could not encode request for server '{server}': {source}")]
    InvalidJson {
        server: String,
        #[source]
        source: serde_json::Error,
    },
}
