use crate::config::{AppConfig, DEFAULT_SYSTEM_PROMPT, SamplingConfig};
use crate::domain::types::ToolCall;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// How a reasoning run ended. BudgetExhausted and Cancelled are terminal
/// answers, not errors: the caller always gets something to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Completed,
    BudgetExhausted,
    Cancelled,
}

impl EngineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineStatus::Completed => "completed",
            EngineStatus::BudgetExhausted => "budget_exhausted",
            EngineStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOutcome {
    pub conversation_id: String,
    pub content: String,
    pub status: EngineStatus,
    pub steps: usize,
}

/// Progress notifications for a front-end that wants to render activity
/// while the loop runs. Delivery is best-effort.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ModelDecision {
        step: usize,
        content: String,
        calls: Vec<ToolCall>,
    },
    ToolResult {
        name: String,
        success: bool,
    },
    Finished {
        status: EngineStatus,
    },
}

/// Cooperative cancellation. Cancelling is sticky and idempotent; every
/// clone observes it.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled. The permit is registered before
    /// the flag check, so a cancel between the two is never missed.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Engine knobs extracted from the application config.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub system_prompt: String,
    pub max_steps: usize,
    pub sampling: SamplingConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_steps: 8,
            sampling: SamplingConfig::default(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_steps: config.engine.max_steps,
            sampling: config.sampling,
        }
    }
}
