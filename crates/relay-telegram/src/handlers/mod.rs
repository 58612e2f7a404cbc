//! Telegram update handlers.
//!
//! Plain text goes into the relay's message buffer; slash commands are routed
//! to `commands`. Every other update type is ignored.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};

use relay_core::{domain::ConversationId, messaging::types::OutboundMessage};

use crate::router::AppState;

mod commands;
mod text;

pub async fn handle_message(_bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        tracing::debug!(chat_id = msg.chat.id.0, "ignoring non-text message");
        return Ok(());
    };

    if text.starts_with('/') {
        return commands::handle_command(msg, state).await;
    }
    text::handle_text(msg, state).await
}

/// Best-effort plain-text reply through the shared transport.
pub(crate) async fn reply(state: &AppState, chat_id: ConversationId, text: impl Into<String>) {
    if let Err(e) = state
        .transport
        .send(chat_id, &OutboundMessage::plain(text))
        .await
    {
        tracing::warn!(conversation_id = %chat_id, error = %e, "reply failed");
    }
}
