use async_trait::async_trait;

use crate::Result;

use super::types::ChatMessage;

/// LLM gateway used once per buffer flush.
///
/// `history` is the bounded context (oldest first) loaded from persistence;
/// `text` is the coalesced user turn. The reply is plain model output
/// (common Markdown), not yet converted for the chat platform.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn complete(&self, history: &[ChatMessage], text: &str) -> Result<String>;

    /// A message the bot sends on its own: `instruction` is an extra system
    /// message and no user turn follows the history.
    async fn remind(&self, history: &[ChatMessage], instruction: &str) -> Result<String>;
}
