pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod memory;

pub use application::engine::{
    CancelToken, ChatEngine, EngineError, EngineEvent, EngineOutcome, EngineSettings, EngineStatus,
};
pub use application::stdio;
pub use application::tooling::{InvokeError, McpSession, SessionPool, SessionState, ToolSession};
pub use config::AppConfig;
pub use infrastructure::model::{ModelClient, OpenAiClient};
pub use memory::{MemoryStore, SummaryScheduler};
