use super::error::{ConnectError, InvokeError};
use super::session::{McpSession, SessionState, ToolSession};
use crate::config::ServerConfig;
use crate::domain::types::{ToolCall, ToolDescriptor};
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};

/// Aggregates N sessions into one tool namespace and routes invocations to
/// the owning session. The pool is the single owner of the namespace: nothing
/// else mutates it.
pub struct SessionPool {
    namespace: RwLock<Namespace>,
    sessions: RwLock<Vec<Arc<dyn ToolSession>>>,
}

#[derive(Default)]
struct Namespace {
    // Tool names in declaration order, so repeated prompts are reproducible.
    order: Vec<String>,
    descriptors: HashMap<String, ToolDescriptor>,
    owners: HashMap<String, Arc<dyn ToolSession>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self {
            namespace: RwLock::new(Namespace::default()),
            sessions: RwLock::new(Vec::new()),
        }
    }

    /// Create one session per registry entry, connect them, and register the
    /// ones that come up. A server that fails to connect is reported and
    /// excluded; it does not prevent the rest of the pool from starting.
    pub async fn from_registry(
        servers: &[ServerConfig],
        handshake_timeout: Duration,
        invoke_timeout: Duration,
    ) -> Arc<Self> {
        let pool = Arc::new(Self::new());
        for config in servers {
            let session = Arc::new(McpSession::new(
                config.clone(),
                handshake_timeout,
                invoke_timeout,
            ));
            match session.connect().await {
                Ok(()) => pool.register(session),
                Err(err) => match err {
                    ConnectError::Spawn { ref server, .. }
                    | ConnectError::Handshake { ref server, .. }
                    | ConnectError::HandshakeTimeout { ref server, .. }
                    | ConnectError::Closed { ref server } => {
                        error!(server = %server, %err, "Tool server unavailable; excluded from namespace");
                    }
                },
            }
        }
        pool
    }

    /// Merge a session's catalog into the namespace. Tool names are globally
    /// unique: on a collision the later tool is omitted and logged, never
    /// silently overwritten.
    pub fn register(&self, session: Arc<dyn ToolSession>) {
        let catalog = session.catalog();
        let mut namespace = self.namespace.write().expect("namespace lock");
        for descriptor in catalog {
            if let Some(existing) = namespace.owners.get(&descriptor.name) {
                warn!(
                    tool = %descriptor.name,
                    kept = %existing.name(),
                    dropped = %session.name(),
                    "Tool name collision; later registration omitted"
                );
                continue;
            }
            namespace.order.push(descriptor.name.clone());
            namespace
                .owners
                .insert(descriptor.name.clone(), Arc::clone(&session));
            namespace.descriptors.insert(descriptor.name.clone(), descriptor);
        }
        info!(server = %session.name(), "Session registered");
        self.sessions.write().expect("sessions lock").push(session);
    }

    /// Snapshot of the live namespace, declaration-ordered. Tools owned by a
    /// session that is no longer Ready are excluded until it reconnects.
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        let namespace = self.namespace.read().expect("namespace lock");
        namespace
            .order
            .iter()
            .filter(|name| {
                namespace
                    .owners
                    .get(*name)
                    .map(|session| session.state() == SessionState::Ready)
                    .unwrap_or(false)
            })
            .filter_map(|name| namespace.descriptors.get(name).cloned())
            .collect()
    }

    /// Route one invocation to the owning session. A name that is absent from
    /// the current namespace (including one whose session degraded between
    /// listing and dispatch) fails fast with UnknownTool.
    pub async fn dispatch(&self, call: &ToolCall) -> Result<Value, InvokeError> {
        let session = {
            let namespace = self.namespace.read().expect("namespace lock");
            namespace.owners.get(&call.name).cloned()
        };

        let Some(session) = session else {
            return Err(InvokeError::UnknownTool(call.name.clone()));
        };
        if session.state() != SessionState::Ready {
            return Err(InvokeError::UnknownTool(call.name.clone()));
        }

        session.invoke(&call.name, call.arguments.clone()).await
    }

    /// Dispatch a batch concurrently; results come back in call order
    /// regardless of which session finishes first.
    pub async fn dispatch_all(&self, calls: &[ToolCall]) -> Vec<Result<Value, InvokeError>> {
        join_all(calls.iter().map(|call| self.dispatch(call))).await
    }

    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.read().expect("sessions lock").clone();
        for session in sessions {
            session.close().await;
        }
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new()
    }
}
