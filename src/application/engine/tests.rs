use super::*;
use crate::application::tooling::{InvokeError, SessionPool, SessionState, ToolSession};
use crate::domain::types::{MessageRole, ToolCall, ToolDescriptor};
use crate::infrastructure::model::{GenerateRequest, ModelClient, ModelError, ModelTurn};
use crate::memory::MemoryStore;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Replays a fixed script of model turns and records every request it saw.
struct ScriptedModel {
    script: Mutex<VecDeque<ModelTurn>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedModel {
    fn new(turns: Vec<ModelTurn>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn request_count(&self) -> usize {
        self.requests.lock().expect("requests").len()
    }

    fn request(&self, index: usize) -> GenerateRequest {
        self.requests.lock().expect("requests")[index].clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn generate(&self, request: GenerateRequest) -> Result<ModelTurn, ModelError> {
        self.requests.lock().expect("requests").push(request);
        self.script
            .lock()
            .expect("script")
            .pop_front()
            .ok_or_else(|| ModelError::invalid_response("script exhausted"))
    }

    async fn summarize(&self, _transcript: &str, _max_tokens: u32) -> Result<String, ModelError> {
        Err(ModelError::invalid_response("not used"))
    }
}

enum StubBehavior {
    Text(String),
    Timeout,
}

struct StubSession {
    name: String,
    tools: Vec<ToolDescriptor>,
    behavior: StubBehavior,
}

impl StubSession {
    fn answering(name: &str, tool: &str, text: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            tools: vec![descriptor(name, tool)],
            behavior: StubBehavior::Text(text.to_string()),
        })
    }

    fn timing_out(name: &str, tool: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            tools: vec![descriptor(name, tool)],
            behavior: StubBehavior::Timeout,
        })
    }
}

fn descriptor(server: &str, tool: &str) -> ToolDescriptor {
    ToolDescriptor {
        name: tool.to_string(),
        description: None,
        server: server.to_string(),
        input_schema: None,
    }
}

#[async_trait]
impl ToolSession for StubSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> SessionState {
        SessionState::Ready
    }

    fn catalog(&self) -> Vec<ToolDescriptor> {
        self.tools.clone()
    }

    async fn invoke(&self, tool: &str, _arguments: Value) -> Result<Value, InvokeError> {
        match &self.behavior {
            StubBehavior::Text(text) => {
                Ok(json!({"content": [{"type": "text", "text": text}]}))
            }
            StubBehavior::Timeout => Err(InvokeError::Timeout {
                server: self.name.clone(),
                tool: tool.to_string(),
                timeout: Duration::from_secs(5),
            }),
        }
    }

    async fn close(&self) {}
}

fn tool_call(name: &str, arguments: Value) -> ToolCall {
    ToolCall {
        id: format!("call-{name}"),
        name: name.to_string(),
        arguments,
    }
}

fn engine_with(
    model: Arc<ScriptedModel>,
    pool: Arc<SessionPool>,
    memory: Option<Arc<MemoryStore>>,
    max_steps: usize,
) -> ChatEngine {
    let settings = EngineSettings {
        max_steps,
        ..EngineSettings::default()
    };
    ChatEngine::new(model, pool, memory, settings)
}

#[tokio::test]
async fn zero_step_budget_answers_without_calling_the_model() {
    let model = ScriptedModel::new(vec![]);
    let engine = engine_with(model.clone(), Arc::new(SessionPool::new()), None, 0);
    let id = engine.start_conversation(false);

    let outcome = engine
        .handle_user_message(&id, "hello", &CancelToken::new())
        .await
        .expect("run succeeds");

    assert_eq!(outcome.status, EngineStatus::BudgetExhausted);
    assert!(!outcome.content.is_empty());
    assert_eq!(model.request_count(), 0);
}

#[tokio::test]
async fn tool_round_trip_persists_user_tool_and_final_turns() {
    let model = ScriptedModel::new(vec![
        ModelTurn::ToolCalls {
            content: String::new(),
            calls: vec![tool_call("add", json!({"a": 2, "b": 2}))],
        },
        ModelTurn::Final {
            content: "2 + 2 = 4".to_string(),
        },
    ]);
    let pool = Arc::new(SessionPool::new());
    pool.register(StubSession::answering("calc", "add", "4"));
    let store = Arc::new(MemoryStore::open_in_memory().expect("store"));

    let engine = engine_with(model.clone(), pool, Some(store.clone()), 8);
    let id = engine.start_conversation(false);
    let outcome = engine
        .handle_user_message(&id, "what is 2+2?", &CancelToken::new())
        .await
        .expect("run succeeds");

    assert_eq!(outcome.status, EngineStatus::Completed);
    assert_eq!(outcome.content, "2 + 2 = 4");
    assert_eq!(outcome.steps, 2);

    let turns = store.turns(&id).expect("turns");
    assert_eq!(turns.len(), 3);
    assert_eq!(turns[0].role, MessageRole::User);
    assert_eq!(turns[1].role, MessageRole::Tool);
    assert_eq!(turns[1].tool_name.as_deref(), Some("add"));
    assert_eq!(turns[1].content, "4");
    assert_eq!(turns[2].role, MessageRole::Assistant);
    assert_eq!(turns[2].content, "2 + 2 = 4");

    // The second model request must carry the observation back.
    let followup = model.request(1);
    let observation = followup
        .messages
        .iter()
        .find(|message| message.role == MessageRole::Tool)
        .expect("tool observation in window");
    assert_eq!(observation.content, "4");
    assert_eq!(observation.tool_call_id.as_deref(), Some("call-add"));
}

#[tokio::test]
async fn timed_out_tool_call_becomes_an_observation() {
    let model = ScriptedModel::new(vec![
        ModelTurn::ToolCalls {
            content: String::new(),
            calls: vec![tool_call("search", json!({"query": "gesture recognition"}))],
        },
        ModelTurn::Final {
            content: "answered without the tool".to_string(),
        },
    ]);
    let pool = Arc::new(SessionPool::new());
    pool.register(StubSession::timing_out("arxiv", "search"));

    let engine = engine_with(model.clone(), pool, None, 8);
    let id = engine.start_conversation(false);
    let outcome = engine
        .handle_user_message(&id, "find papers", &CancelToken::new())
        .await
        .expect("run succeeds");

    assert_eq!(outcome.status, EngineStatus::Completed);
    let followup = model.request(1);
    let observation = followup
        .messages
        .iter()
        .find(|message| message.role == MessageRole::Tool)
        .expect("tool observation in window");
    assert!(observation.content.contains("Tool call failed"));
    assert!(observation.content.contains("timed out"));
}

#[tokio::test]
async fn unknown_tool_request_is_reported_not_fatal() {
    let model = ScriptedModel::new(vec![
        ModelTurn::ToolCalls {
            content: String::new(),
            calls: vec![tool_call("multiply", json!({"a": 3, "b": 3}))],
        },
        ModelTurn::Final {
            content: "9".to_string(),
        },
    ]);

    let engine = engine_with(model.clone(), Arc::new(SessionPool::new()), None, 8);
    let id = engine.start_conversation(false);
    let outcome = engine
        .handle_user_message(&id, "what is 3*3?", &CancelToken::new())
        .await
        .expect("run succeeds");

    assert_eq!(outcome.status, EngineStatus::Completed);
    let followup = model.request(1);
    let observation = followup
        .messages
        .iter()
        .find(|message| message.role == MessageRole::Tool)
        .expect("tool observation in window");
    assert!(observation.content.contains("unknown tool"));
}

#[tokio::test]
async fn exhausted_budget_synthesizes_a_terminal_answer() {
    let looping_call = || ModelTurn::ToolCalls {
        content: String::new(),
        calls: vec![tool_call("add", json!({"a": 1, "b": 1}))],
    };
    let model = ScriptedModel::new(vec![looping_call(), looping_call(), looping_call()]);
    let pool = Arc::new(SessionPool::new());
    pool.register(StubSession::answering("calc", "add", "2"));
    let store = Arc::new(MemoryStore::open_in_memory().expect("store"));

    let engine = engine_with(model.clone(), pool, Some(store.clone()), 2);
    let id = engine.start_conversation(false);
    let outcome = engine
        .handle_user_message(&id, "keep adding", &CancelToken::new())
        .await
        .expect("run succeeds");

    assert_eq!(outcome.status, EngineStatus::BudgetExhausted);
    assert_eq!(model.request_count(), 2);

    let turns = store.turns(&id).expect("turns");
    let last = turns.last().expect("final turn");
    assert_eq!(last.role, MessageRole::Assistant);
    assert_eq!(last.content, outcome.content);
}

#[tokio::test]
async fn cancelled_token_short_circuits_before_the_model() {
    let model = ScriptedModel::new(vec![ModelTurn::Final {
        content: "never reached".to_string(),
    }]);
    let engine = engine_with(model.clone(), Arc::new(SessionPool::new()), None, 8);
    let id = engine.start_conversation(false);

    let cancel = CancelToken::new();
    cancel.cancel();
    let outcome = engine
        .handle_user_message(&id, "hello", &cancel)
        .await
        .expect("run succeeds");

    assert_eq!(outcome.status, EngineStatus::Cancelled);
    assert_eq!(model.request_count(), 0);
}

#[tokio::test]
async fn incognito_conversation_leaves_no_rows_behind() {
    let model = ScriptedModel::new(vec![
        ModelTurn::ToolCalls {
            content: String::new(),
            calls: vec![tool_call("add", json!({"a": 2, "b": 2}))],
        },
        ModelTurn::Final {
            content: "4".to_string(),
        },
    ]);
    let pool = Arc::new(SessionPool::new());
    pool.register(StubSession::answering("calc", "add", "4"));
    let store = Arc::new(MemoryStore::open_in_memory().expect("store"));

    let engine = engine_with(model, pool, Some(store.clone()), 8);
    let id = engine.start_conversation(true);
    let outcome = engine
        .handle_user_message(&id, "what is 2+2?", &CancelToken::new())
        .await
        .expect("run succeeds");

    assert_eq!(outcome.status, EngineStatus::Completed);
    assert_eq!(outcome.content, "4");
    assert!(store.turns(&id).expect("turns").is_empty());
    assert!(store.read_unsummarized(&id).expect("read").is_empty());
}

#[tokio::test]
async fn first_user_message_titles_the_conversation() {
    let model = ScriptedModel::new(vec![
        ModelTurn::Final {
            content: "hi".to_string(),
        },
        ModelTurn::Final {
            content: "hi again".to_string(),
        },
    ]);
    let store = Arc::new(MemoryStore::open_in_memory().expect("store"));
    let engine = engine_with(model, Arc::new(SessionPool::new()), Some(store.clone()), 8);

    let id = engine.start_conversation(false);
    engine
        .handle_user_message(&id, "plan my reading list\nwith details", &CancelToken::new())
        .await
        .expect("run succeeds");
    assert_eq!(
        store.get_title(&id).expect("title").as_deref(),
        Some("plan my reading list")
    );

    // A later message does not overwrite the title.
    engine
        .handle_user_message(&id, "something else entirely", &CancelToken::new())
        .await
        .expect("run succeeds");
    assert_eq!(
        store.get_title(&id).expect("title").as_deref(),
        Some("plan my reading list")
    );
}

#[tokio::test]
async fn restored_conversation_carries_summary_and_skips_tool_turns() {
    let store = Arc::new(MemoryStore::open_in_memory().expect("store"));
    let id = store.create_conversation(false).expect("create");
    store
        .append(&id, crate::memory::NewTurn::new(MessageRole::User, "find papers"))
        .expect("append");
    store
        .append(&id, crate::memory::NewTurn::tool("search", "three results"))
        .expect("append");
    store
        .append(
            &id,
            crate::memory::NewTurn::new(MessageRole::Assistant, "here are three papers"),
        )
        .expect("append");
    store
        .commit_summary(&id, 3, "user asked for papers; three were found")
        .expect("commit");

    let model = ScriptedModel::new(vec![ModelTurn::Final {
        content: "summarized already".to_string(),
    }]);
    let engine = engine_with(model.clone(), Arc::new(SessionPool::new()), Some(store), 8);
    engine.load_conversation(&id).expect("load");

    engine
        .handle_user_message(&id, "and a fourth?", &CancelToken::new())
        .await
        .expect("run succeeds");

    let request = model.request(0);
    let roles: Vec<_> = request
        .messages
        .iter()
        .map(|message| message.role)
        .collect();
    assert_eq!(
        roles,
        vec![
            MessageRole::System,
            MessageRole::System,
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::User,
        ]
    );
    assert!(request.messages[1].content.contains("three were found"));
    assert!(
        request
            .messages
            .iter()
            .all(|message| !message.content.contains("three results"))
    );
}
