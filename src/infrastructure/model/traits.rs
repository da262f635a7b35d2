//! Model traits

use super::types::{GenerateRequest, ModelError, ModelTurn};
use async_trait::async_trait;

/// Boundary to the language model. The engine and the summary scheduler are
/// the only consumers; tests substitute scripted implementations.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// One generation step: history plus tool catalog in, a tagged decision out.
    async fn generate(&self, request: GenerateRequest) -> Result<ModelTurn, ModelError>;

    /// Compress a conversation transcript into a bounded continuity summary.
    async fn summarize(&self, transcript: &str, max_tokens: u32) -> Result<String, ModelError>;
}
