//! Model types - Request, Response, and Error types

use crate::config::SamplingConfig;
use crate::domain::types::{ChatMessage, ToolCall, ToolDescriptor};
use thiserror::Error;

/// One generation request: full history plus the current tool namespace.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDescriptor>,
    pub sampling: SamplingConfig,
}

/// What the model decided to do. A closed set, so the loop branches on a
/// tagged variant instead of inspecting the wire payload.
#[derive(Debug, Clone)]
pub enum ModelTurn {
    Final { content: String },
    ToolCalls { content: String, calls: Vec<ToolCall> },
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("network error calling model endpoint: {source}")]
    Network {
        #[source]
        source: reqwest::Error,
    },
    #[error("model endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model returned an invalid response: {reason}")]
    InvalidResponse { reason: String },
}

impl ModelError {
    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }

    /// User-facing description, without wire detail.
    pub fn user_message(&self) -> String {
        match self {
            ModelError::Network { source } => {
                if source.is_connect() {
                    "Could not reach the model endpoint.".to_string()
                } else if source.is_timeout() {
                    "The model request timed out.".to_string()
                } else {
                    "A network error occurred while calling the model.".to_string()
                }
            }
            ModelError::Status { status, .. } => {
                format!("The model endpoint rejected the request (HTTP {status}).")
            }
            ModelError::InvalidResponse { .. } => {
                "The model returned a response that could not be understood.".to_string()
            }
        }
    }
}
