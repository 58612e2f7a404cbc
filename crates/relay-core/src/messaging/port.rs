use async_trait::async_trait;

use crate::{
    domain::{ConversationId, MessageRef},
    messaging::types::{OutboundMessage, SendError, TransportCapabilities},
};

/// Transport port: deliver one message to one conversation.
///
/// Implementations must be safe to call concurrently for different
/// conversations. Failures come back as a structured [`SendError`] so callers
/// can classify them instead of matching on adapter error types.
#[async_trait]
pub trait TransportPort: Send + Sync {
    fn capabilities(&self) -> TransportCapabilities;

    async fn send(
        &self,
        conversation_id: ConversationId,
        message: &OutboundMessage,
    ) -> Result<MessageRef, SendError>;

    /// Show a "typing..." indicator. Transports without one keep the no-op.
    async fn typing(&self, _conversation_id: ConversationId) -> Result<(), SendError> {
        Ok(())
    }
}
