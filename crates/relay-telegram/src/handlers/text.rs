use std::sync::Arc;

use teloxide::{prelude::*, types::MessageEntityKind};
use tokio::time::Instant;

use relay_core::domain::ConversationId;

use crate::router::{AppState, BotIdentity};

pub async fn handle_text(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    if text.trim().is_empty() {
        return Ok(());
    }

    let chat_id = ConversationId(msg.chat.id.0);
    if state.cfg.telegram.admin_chat == Some(chat_id.0) {
        tracing::debug!(conversation_id = %chat_id, "ignoring text in the admin chat");
        return Ok(());
    }

    if !msg.chat.is_private() {
        let replied_to = msg.reply_to_message().and_then(|m| m.from()).map(|u| u.id.0);
        let text_mentions: Vec<u64> = msg
            .entities()
            .unwrap_or_default()
            .iter()
            .filter_map(|e| match &e.kind {
                MessageEntityKind::TextMention { user } => Some(user.id.0),
                _ => None,
            })
            .collect();
        if !addressed_to_bot(&state.me, text, replied_to, &text_mentions) {
            return Ok(());
        }
    }

    if let Err(e) = state
        .relay
        .on_fragment(chat_id, text.to_string(), Instant::now())
        .await
    {
        tracing::warn!(conversation_id = %chat_id, error = %e, "conversation not registered");
    }
    Ok(())
}

/// In groups the bot only answers a reply to one of its own messages, an
/// `@username` mention, or a text mention that links to the bot.
pub(crate) fn addressed_to_bot(
    me: &BotIdentity,
    text: &str,
    replied_to: Option<u64>,
    text_mentions: &[u64],
) -> bool {
    replied_to == Some(me.id) || text_mentions.contains(&me.id) || mentions(text, &me.username)
}

/// `@username` as a whole word, case-insensitively.
fn mentions(text: &str, username: &str) -> bool {
    if username.is_empty() {
        return false;
    }
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let text = text.to_lowercase();
    let needle = format!("@{}", username.to_lowercase());

    text.match_indices(&needle).any(|(at, _)| {
        let before = text[..at].chars().next_back();
        let after = text[at + needle.len()..].chars().next();
        !before.is_some_and(is_word) && !after.is_some_and(is_word)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn me() -> BotIdentity {
        BotIdentity {
            id: 42,
            username: "relay_bot".to_string(),
        }
    }

    #[test]
    fn username_mentions_must_be_whole_words() {
        assert!(addressed_to_bot(&me(), "hey @relay_bot, help", None, &[]));
        assert!(addressed_to_bot(&me(), "@Relay_Bot what now?", None, &[]));
        assert!(!addressed_to_bot(&me(), "ask @relay_bot2", None, &[]));
        assert!(!addressed_to_bot(&me(), "mail me at me@relay_bot", None, &[]));
        assert!(!addressed_to_bot(&me(), "just chatting", None, &[]));
    }

    #[test]
    fn replies_and_text_mentions_count() {
        assert!(addressed_to_bot(&me(), "sure", Some(42), &[]));
        assert!(!addressed_to_bot(&me(), "sure", Some(7), &[]));
        assert!(addressed_to_bot(&me(), "Relay, hi", None, &[7, 42]));
        assert!(!addressed_to_bot(&me(), "Relay, hi", None, &[7]));
    }

    #[test]
    fn a_bot_without_username_needs_a_reply_or_text_mention() {
        let anonymous = BotIdentity {
            id: 42,
            username: String::new(),
        };
        assert!(!addressed_to_bot(&anonymous, "@ hello", None, &[]));
        assert!(addressed_to_bot(&anonymous, "hello", Some(42), &[]));
    }
}
