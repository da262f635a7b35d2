use super::errors::EngineError;
use super::models::{CancelToken, EngineEvent, EngineOutcome, EngineSettings, EngineStatus};
use crate::application::tooling::{SessionPool, extract_tool_text};
use crate::domain::types::{ChatMessage, MessageRole, ToolCall};
use crate::infrastructure::model::{GenerateRequest, ModelClient, ModelTurn};
use crate::memory::{MemoryError, MemoryStore, NewTurn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

const BUDGET_EXHAUSTED_ANSWER: &str = "I could not finish this request within the allowed \
number of reasoning steps. The tool results gathered so far are recorded above; ask me to \
continue if you would like me to keep going.";

const CANCELLED_ANSWER: &str = "The request was cancelled before an answer was produced.";

/// The reasoning loop. Each user message runs generate/act/observe rounds
/// against the model and the tool namespace until the model answers in plain
/// text or the step budget runs out.
///
/// Tool failures are folded back into the context window as observations so
/// the model can self-correct. Persistence is strictly best-effort: a failed
/// write is logged and the loop carries on.
pub struct ChatEngine {
    model: Arc<dyn ModelClient>,
    pool: Arc<SessionPool>,
    memory: Option<Arc<MemoryStore>>,
    settings: EngineSettings,
    windows: Mutex<HashMap<String, Vec<ChatMessage>>>,
    events: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl ChatEngine {
    pub fn new(
        model: Arc<dyn ModelClient>,
        pool: Arc<SessionPool>,
        memory: Option<Arc<MemoryStore>>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            model,
            pool,
            memory,
            settings,
            windows: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    pub fn with_events(mut self, sender: mpsc::UnboundedSender<EngineEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Open a fresh conversation and return its id. With memory attached the
    /// conversation is recorded; a store failure degrades to an in-memory id.
    pub fn start_conversation(&self, incognito: bool) -> String {
        if let Some(store) = &self.memory {
            match store.create_conversation(incognito) {
                Ok(id) => return id,
                Err(err) => {
                    tracing::error!(%err, "Could not create conversation record; continuing without persistence");
                }
            }
        }
        Uuid::new_v4().to_string()
    }

    /// Rebuild the context window of a stored conversation. The window holds
    /// the continuity summary (when one exists) plus the user and assistant
    /// turns; tool observations stay in the store only.
    pub fn load_conversation(&self, conversation_id: &str) -> Result<(), MemoryError> {
        let Some(store) = &self.memory else {
            return Ok(());
        };
        let turns = store.turns(conversation_id)?;
        let summary = store.latest_summary(conversation_id)?;

        let mut window = Vec::new();
        if let Some(summary) = summary {
            window.push(ChatMessage::new(
                MessageRole::System,
                format!("Summary of the conversation so far:\n{}", summary.text),
            ));
        }
        for turn in turns {
            match turn.role {
                MessageRole::User | MessageRole::Assistant => {
                    window.push(ChatMessage::new(turn.role, turn.content));
                }
                MessageRole::Tool | MessageRole::System => {}
            }
        }

        tracing::info!(
            conversation = %conversation_id,
            messages = window.len(),
            "Conversation window restored"
        );
        self.windows
            .lock()
            .expect("windows lock")
            .insert(conversation_id.to_string(), window);
        Ok(())
    }

    /// Run one user message to a terminal answer.
    pub async fn handle_user_message(
        &self,
        conversation_id: &str,
        text: &str,
        cancel: &CancelToken,
    ) -> Result<EngineOutcome, EngineError> {
        let mut window = self.window_of(conversation_id);
        window.push(ChatMessage::new(MessageRole::User, text));
        self.persist_user(conversation_id, text);

        let mut steps = 0;
        let result = loop {
            if cancel.is_cancelled() {
                break Ok((CANCELLED_ANSWER.to_string(), EngineStatus::Cancelled));
            }
            if steps >= self.settings.max_steps {
                tracing::warn!(
                    conversation = %conversation_id,
                    steps,
                    "Step budget exhausted; synthesizing terminal answer"
                );
                let content = BUDGET_EXHAUSTED_ANSWER.to_string();
                window.push(ChatMessage::new(MessageRole::Assistant, content.clone()));
                self.persist(
                    conversation_id,
                    NewTurn::new(MessageRole::Assistant, content.clone()),
                );
                break Ok((content, EngineStatus::BudgetExhausted));
            }
            steps += 1;

            let request = GenerateRequest {
                messages: self.with_system_prompt(&window),
                tools: self.pool.list_tools(),
                sampling: self.settings.sampling,
            };
            let turn = tokio::select! {
                _ = cancel.cancelled() => {
                    break Ok((CANCELLED_ANSWER.to_string(), EngineStatus::Cancelled));
                }
                generated = self.model.generate(request) => match generated {
                    Ok(turn) => turn,
                    Err(err) => break Err(EngineError::from(err)),
                },
            };

            match turn {
                ModelTurn::Final { content } => {
                    tracing::info!(conversation = %conversation_id, steps, "Model produced final answer");
                    window.push(ChatMessage::new(MessageRole::Assistant, content.clone()));
                    self.persist(
                        conversation_id,
                        NewTurn::new(MessageRole::Assistant, content.clone()),
                    );
                    break Ok((content, EngineStatus::Completed));
                }
                ModelTurn::ToolCalls { content, calls } => {
                    tracing::debug!(
                        conversation = %conversation_id,
                        step = steps,
                        calls = calls.len(),
                        "Model requested tool calls"
                    );
                    self.emit(EngineEvent::ModelDecision {
                        step: steps,
                        content: content.clone(),
                        calls: calls.clone(),
                    });
                    window.push(ChatMessage::tool_request(content, calls.clone()));

                    let results = tokio::select! {
                        _ = cancel.cancelled() => {
                            break Ok((CANCELLED_ANSWER.to_string(), EngineStatus::Cancelled));
                        }
                        results = self.pool.dispatch_all(&calls) => results,
                    };
                    for (call, result) in calls.iter().zip(results) {
                        self.observe(conversation_id, &mut window, call, result);
                    }
                }
            }
        };

        self.windows
            .lock()
            .expect("windows lock")
            .insert(conversation_id.to_string(), window);

        let (content, status) = result?;
        self.emit(EngineEvent::Finished { status });
        Ok(EngineOutcome {
            conversation_id: conversation_id.to_string(),
            content,
            status,
            steps,
        })
    }

    /// Fold one tool result back into the window and the store. Failures are
    /// phrased as observations, which is what lets the model retry with
    /// different arguments or a different tool.
    fn observe(
        &self,
        conversation_id: &str,
        window: &mut Vec<ChatMessage>,
        call: &ToolCall,
        result: Result<serde_json::Value, crate::application::tooling::InvokeError>,
    ) {
        let (observation, success) = match result {
            Ok(value) => {
                let text = extract_tool_text(&value).unwrap_or_else(|| value.to_string());
                (text, true)
            }
            Err(err) => {
                tracing::warn!(tool = %call.name, %err, "Tool call failed; reported to the model");
                (format!("Tool call failed: {err}"), false)
            }
        };
        self.emit(EngineEvent::ToolResult {
            name: call.name.clone(),
            success,
        });
        window.push(ChatMessage::tool_result(&call.id, &call.name, &observation));
        self.persist(conversation_id, NewTurn::tool(&call.name, observation));
    }

    fn with_system_prompt(&self, window: &[ChatMessage]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(window.len() + 1);
        messages.push(ChatMessage::new(
            MessageRole::System,
            self.settings.system_prompt.clone(),
        ));
        messages.extend_from_slice(window);
        messages
    }

    fn window_of(&self, conversation_id: &str) -> Vec<ChatMessage> {
        self.windows
            .lock()
            .expect("windows lock")
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Record the user turn and, on the first persisted message of a
    /// conversation, derive its title from that message.
    fn persist_user(&self, conversation_id: &str, text: &str) {
        let Some(store) = &self.memory else {
            return;
        };
        match store.append(conversation_id, NewTurn::new(MessageRole::User, text)) {
            Ok(Some(_)) => match store.get_title(conversation_id) {
                Ok(None) => {
                    if let Err(err) = store.update_title(conversation_id, &derive_title(text)) {
                        tracing::error!(conversation = %conversation_id, %err, "Failed to set conversation title");
                    }
                }
                Ok(Some(_)) => {}
                Err(err) => {
                    tracing::error!(conversation = %conversation_id, %err, "Failed to read conversation title");
                }
            },
            Ok(None) => {}
            Err(err) => {
                tracing::error!(
                    conversation = %conversation_id,
                    %err,
                    "Failed to persist turn; conversation continues in memory only"
                );
            }
        }
    }

    fn persist(&self, conversation_id: &str, turn: NewTurn) {
        let Some(store) = &self.memory else {
            return;
        };
        if let Err(err) = store.append(conversation_id, turn) {
            tracing::error!(
                conversation = %conversation_id,
                %err,
                "Failed to persist turn; conversation continues in memory only"
            );
        }
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(sender) = &self.events {
            let _ = sender.send(event);
        }
    }
}

const TITLE_MAX_CHARS: usize = 80;

fn derive_title(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    first_line.chars().take(TITLE_MAX_CHARS).collect()
}
