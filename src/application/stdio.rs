use crate::application::engine::{CancelToken, ChatEngine};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum StdioError {
    #[error("stdin/stdout I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize stdio response: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct StdioChatRequest {
    prompt: String,
    conversation_id: Option<String>,
    #[serde(default)]
    incognito: bool,
}

#[derive(Debug, Serialize)]
struct StdioChatResponse {
    conversation_id: Option<String>,
    content: Option<String>,
    status: Option<&'static str>,
    error: Option<String>,
    steps: usize,
}

impl StdioChatResponse {
    fn success(conversation_id: String, content: String, status: &'static str, steps: usize) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            content: Some(content),
            status: Some(status),
            error: None,
            steps,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            conversation_id: None,
            content: None,
            status: None,
            error: Some(message.into()),
            steps: 0,
        }
    }
}

/// JSON-line front-end: one request object per stdin line, one response
/// object per stdout line. Runs until stdin closes.
pub async fn run(engine: Arc<ChatEngine>) -> Result<(), StdioError> {
    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = io::stdout();
    let mut known_conversations: HashSet<String> = HashSet::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        debug!("Received STDIO line");

        let request = match serde_json::from_str::<StdioChatRequest>(&line) {
            Ok(request) => request,
            Err(error) => {
                error!(%error, "Failed to parse STDIO input line");
                write_response(
                    &mut stdout,
                    StdioChatResponse::error(format!("invalid request JSON: {error}")),
                )
                .await?;
                continue;
            }
        };
        if request.prompt.trim().is_empty() {
            write_response(&mut stdout, StdioChatResponse::error("prompt cannot be empty"))
                .await?;
            continue;
        }

        let conversation_id = match request.conversation_id {
            Some(id) => {
                if known_conversations.insert(id.clone()) {
                    if let Err(error) = engine.load_conversation(&id) {
                        error!(%error, conversation = %id, "Could not restore conversation");
                        write_response(&mut stdout, StdioChatResponse::error(error.to_string()))
                            .await?;
                        known_conversations.remove(&id);
                        continue;
                    }
                }
                id
            }
            None => {
                let id = engine.start_conversation(request.incognito);
                known_conversations.insert(id.clone());
                id
            }
        };

        info!(conversation = %conversation_id, "Processing STDIO chat request");
        match engine
            .handle_user_message(&conversation_id, &request.prompt, &CancelToken::new())
            .await
        {
            Ok(outcome) => {
                write_response(
                    &mut stdout,
                    StdioChatResponse::success(
                        outcome.conversation_id,
                        outcome.content,
                        outcome.status.as_str(),
                        outcome.steps,
                    ),
                )
                .await?;
            }
            Err(error) => {
                error!(%error, "STDIO chat request failed");
                write_response(&mut stdout, StdioChatResponse::error(error.user_message()))
                    .await?;
            }
        }
    }

    stdout.flush().await?;
    Ok(())
}

async fn write_response(
    stdout: &mut io::Stdout,
    response: StdioChatResponse,
) -> Result<(), StdioError> {
    let mut payload = serde_json::to_vec(&response)?;
    payload.push(b'\n');
    stdout.write_all(&payload).await?;
    stdout.flush().await?;
    Ok(())
}
