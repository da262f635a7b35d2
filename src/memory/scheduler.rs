use super::store::{MemoryStore, TurnRecord};
use crate::infrastructure::model::ModelClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Background summarizer. Periodically sweeps conversations with turns
/// beyond their latest summary and commits a fresh summary for each.
/// A failed or stale sweep never blocks the chat loop; the next tick
/// retries from the store's current state.
pub struct SummaryScheduler {
    store: Arc<MemoryStore>,
    model: Arc<dyn ModelClient>,
    interval: Duration,
    max_tokens: u32,
}

/// Dropping the handle (or sending on the channel) stops the loop after the
/// current sweep.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

impl SummaryScheduler {
    pub fn new(
        store: Arc<MemoryStore>,
        model: Arc<dyn ModelClient>,
        interval: Duration,
        max_tokens: u32,
    ) -> Self {
        Self {
            store,
            model,
            interval,
            max_tokens,
        }
    }

    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown, mut observed) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            info!(interval = ?self.interval, "Summary scheduler started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    changed = observed.changed() => {
                        if changed.is_err() || *observed.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Summary scheduler stopped");
        });
        SchedulerHandle { shutdown, task }
    }

    /// One sweep over every conversation with unsummarized turns.
    pub async fn run_once(&self) {
        let pending = match self.store.unsummarized_conversations() {
            Ok(ids) => ids,
            Err(err) => {
                warn!(%err, "Failed to list conversations pending summarization");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }
        debug!(conversations = pending.len(), "Summarization sweep");
        for conversation_id in pending {
            if let Err(err) = self.summarize_conversation(&conversation_id).await {
                warn!(conversation = %conversation_id, error = %err, "Summarization failed; will retry next sweep");
            }
        }
    }

    async fn summarize_conversation(&self, conversation_id: &str) -> Result<(), String> {
        let prior = self
            .store
            .latest_summary(conversation_id)
            .map_err(|err| err.to_string())?;
        let fresh = self
            .store
            .read_unsummarized(conversation_id)
            .map_err(|err| err.to_string())?;
        let Some(last) = fresh.last() else {
            return Ok(());
        };
        let covered_through = last.seq_no;

        let mut transcript = String::new();
        if let Some(summary) = prior {
            transcript.push_str("Summary of earlier conversation:\n");
            transcript.push_str(&summary.text);
            transcript.push_str("\n\n");
        }
        transcript.push_str(&format_transcript(&fresh));

        let summary = self
            .model
            .summarize(&transcript, self.max_tokens)
            .await
            .map_err(|err| err.to_string())?;
        self.store
            .commit_summary(conversation_id, covered_through, &summary)
            .map_err(|err| err.to_string())?;
        debug!(conversation = %conversation_id, covered_through, "Summary refreshed");
        Ok(())
    }
}

fn format_transcript(turns: &[TurnRecord]) -> String {
    turns
        .iter()
        .map(|turn| match &turn.tool_name {
            Some(tool) => format!("{} [{}]: {}", turn.role.as_str(), tool, turn.content),
            None => format!("{}: {}", turn.role.as_str(), turn.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::MessageRole;
    use crate::infrastructure::model::{GenerateRequest, ModelError, ModelTurn};
    use crate::memory::store::NewTurn;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingSummarizer {
        transcripts: Mutex<Vec<String>>,
        reply: Result<String, ()>,
    }

    impl RecordingSummarizer {
        fn succeeding(reply: &str) -> Self {
            Self {
                transcripts: Mutex::new(Vec::new()),
                reply: Ok(reply.to_string()),
            }
        }

        fn failing() -> Self {
            Self {
                transcripts: Mutex::new(Vec::new()),
                reply: Err(()),
            }
        }
    }

    #[async_trait]
    impl ModelClient for RecordingSummarizer {
        async fn generate(&self, _request: GenerateRequest) -> Result<ModelTurn, ModelError> {
            Err(ModelError::invalid_response("not used"))
        }

        async fn summarize(&self, transcript: &str, _max_tokens: u32) -> Result<String, ModelError> {
            self.transcripts
                .lock()
                .expect("lock")
                .push(transcript.to_string());
            self.reply
                .clone()
                .map_err(|_| ModelError::invalid_response("scripted failure"))
        }
    }

    fn scheduler(
        store: Arc<MemoryStore>,
        model: Arc<RecordingSummarizer>,
    ) -> SummaryScheduler {
        SummaryScheduler::new(store, model, Duration::from_secs(600), 256)
    }

    #[tokio::test]
    async fn sweep_commits_summary_covering_latest_turn() {
        let store = Arc::new(MemoryStore::open_in_memory().expect("store"));
        let id = store.create_conversation(false).expect("create");
        store
            .append(&id, NewTurn::new(MessageRole::User, "what is 2+2"))
            .expect("append");
        store
            .append(&id, NewTurn::new(MessageRole::Assistant, "4"))
            .expect("append");

        let model = Arc::new(RecordingSummarizer::succeeding("arithmetic chat"));
        scheduler(store.clone(), model.clone()).run_once().await;

        let summary = store.latest_summary(&id).expect("query").expect("summary");
        assert_eq!(summary.text, "arithmetic chat");
        assert_eq!(summary.covered_through_seq_no, 2);
        assert!(store.read_unsummarized(&id).expect("read").is_empty());

        let transcripts = model.transcripts.lock().expect("lock");
        assert!(transcripts[0].contains("user: what is 2+2"));
    }

    #[tokio::test]
    async fn sweep_feeds_prior_summary_into_the_next_transcript() {
        let store = Arc::new(MemoryStore::open_in_memory().expect("store"));
        let id = store.create_conversation(false).expect("create");
        store
            .append(&id, NewTurn::new(MessageRole::User, "hello"))
            .expect("append");
        store
            .commit_summary(&id, 1, "user greeted")
            .expect("commit");
        store
            .append(&id, NewTurn::new(MessageRole::User, "now help me"))
            .expect("append");

        let model = Arc::new(RecordingSummarizer::succeeding("greeting then request"));
        scheduler(store.clone(), model.clone()).run_once().await;

        let transcripts = model.transcripts.lock().expect("lock");
        assert!(transcripts[0].contains("user greeted"));
        assert!(transcripts[0].contains("now help me"));
        assert!(!transcripts[0].contains("user: hello"));
    }

    #[tokio::test]
    async fn failed_summarization_leaves_turns_pending() {
        let store = Arc::new(MemoryStore::open_in_memory().expect("store"));
        let id = store.create_conversation(false).expect("create");
        store
            .append(&id, NewTurn::new(MessageRole::User, "hello"))
            .expect("append");

        let model = Arc::new(RecordingSummarizer::failing());
        scheduler(store.clone(), model).run_once().await;

        assert!(store.latest_summary(&id).expect("query").is_none());
        assert_eq!(store.read_unsummarized(&id).expect("read").len(), 1);
    }

    #[tokio::test]
    async fn sweep_with_nothing_pending_never_calls_the_model() {
        let store = Arc::new(MemoryStore::open_in_memory().expect("store"));
        let model = Arc::new(RecordingSummarizer::succeeding("unused"));
        scheduler(store.clone(), model.clone()).run_once().await;
        assert!(model.transcripts.lock().expect("lock").is_empty());
    }

    #[test]
    fn transcript_includes_tool_names() {
        let turns = vec![
            TurnRecord {
                seq_no: 1,
                role: MessageRole::User,
                content: "add 2 and 2".into(),
                tool_name: None,
                created_at: String::new(),
            },
            TurnRecord {
                seq_no: 2,
                role: MessageRole::Tool,
                content: "4".into(),
                tool_name: Some("calc.add".into()),
                created_at: String::new(),
            },
        ];
        let text = format_transcript(&turns);
        assert_eq!(text, "user: add 2 and 2\ntool [calc.add]: 4");
    }
}
