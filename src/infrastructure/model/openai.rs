//! OpenAI-compatible client (works with Ollama, OpenAI, Mistral, Groq, etc.)

use super::traits::ModelClient;
use super::types::{GenerateRequest, ModelError, ModelTurn};
use crate::config::ModelConfig;
use crate::domain::types::{ChatMessage, ToolCall, ToolDescriptor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

const SUMMARIZER_SYSTEM_PROMPT: &str = "You are a concise conversation summarizer.";
const SUMMARIZER_TEMPERATURE: f32 = 0.2;

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiClient {
    pub fn new(config: &ModelConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        }
    }

    async fn chat_completion(
        &self,
        payload: &ChatCompletionRequest,
    ) -> Result<WireResponseMessage, ModelError> {
        let url = format!("{}/v1/chat/completions", self.endpoint);
        let mut request = self.http.post(&url).json(payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|source| ModelError::Network { source })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|source| ModelError::Network { source })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .ok_or_else(|| ModelError::invalid_response("missing message in first choice"))
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn generate(&self, request: GenerateRequest) -> Result<ModelTurn, ModelError> {
        let payload = ChatCompletionRequest {
            model: self.model.clone(),
            messages: request.messages.iter().map(to_wire_message).collect(),
            tools: to_wire_tools(&request.tools),
            temperature: request.sampling.temperature,
            top_p: request.sampling.top_p,
            max_tokens: request.sampling.max_tokens,
            stream: false,
        };

        info!(
            model = self.model.as_str(),
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending generation request"
        );
        let message = self.chat_completion(&payload).await?;
        debug!("Received model response");

        let calls = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(to_tool_call)
            .collect::<Vec<_>>();
        let content = message.content.unwrap_or_default();

        if calls.is_empty() {
            if content.is_empty() {
                return Err(ModelError::invalid_response(
                    "neither content nor tool calls in response",
                ));
            }
            Ok(ModelTurn::Final { content })
        } else {
            Ok(ModelTurn::ToolCalls { content, calls })
        }
    }

    async fn summarize(&self, transcript: &str, max_tokens: u32) -> Result<String, ModelError> {
        let prompt = format!(
            "Summarize the following conversation for future continuation. \
             Focus on user goals, decisions, constraints, and open tasks. \
             Keep it concise.\n\n{transcript}"
        );
        let payload = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                WireMessage {
                    role: "system",
                    content: Some(SUMMARIZER_SYSTEM_PROMPT.to_string()),
                    tool_calls: None,
                    tool_call_id: None,
                },
                WireMessage {
                    role: "user",
                    content: Some(prompt),
                    tool_calls: None,
                    tool_call_id: None,
                },
            ],
            tools: None,
            temperature: Some(SUMMARIZER_TEMPERATURE),
            top_p: None,
            max_tokens: Some(max_tokens),
            stream: false,
        };

        let message = self.chat_completion(&payload).await?;
        message
            .content
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| ModelError::invalid_response("empty summary"))
    }
}

fn to_wire_message(message: &ChatMessage) -> WireMessage {
    let tool_calls = if message.tool_calls.is_empty() {
        None
    } else {
        Some(
            message
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone(),
                    kind: "function",
                    function: WireFunctionCall {
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                    },
                })
                .collect(),
        )
    };

    WireMessage {
        role: message.role.as_str(),
        content: if message.content.is_empty() && tool_calls.is_some() {
            None
        } else {
            Some(message.content.clone())
        },
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn to_wire_tools(tools: &[ToolDescriptor]) -> Option<Vec<Value>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description.clone().unwrap_or_default(),
                        "parameters": tool
                            .input_schema
                            .clone()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    }
                })
            })
            .collect(),
    )
}

fn to_tool_call(wire: WireResponseToolCall) -> ToolCall {
    let arguments = match serde_json::from_str::<Value>(&wire.function.arguments) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => {
            warn!(tool = %wire.function.name, "tool-call arguments are not an object; wrapping");
            json!({ "value": other })
        }
        Err(err) => {
            warn!(tool = %wire.function.name, %err, "malformed tool-call arguments; using empty object");
            json!({})
        }
    };
    ToolCall {
        id: wire.id,
        name: wire.function.name,
        arguments,
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionCall,
}

#[derive(Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Deserialize)]
struct ChatCompletionChoice {
    message: Option<WireResponseMessage>,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireResponseToolCall>>,
}

#[derive(Deserialize)]
struct WireResponseToolCall {
    id: String,
    function: WireResponseFunction,
}

#[derive(Deserialize)]
struct WireResponseFunction {
    name: String,
    arguments: String,
}
