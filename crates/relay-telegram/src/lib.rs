//! Telegram adapter (teloxide).
//!
//! This crate implements the `relay-core` TransportPort over the Telegram Bot
//! API and routes updates into the relay.

use async_trait::async_trait;

use teloxide::{
    prelude::*,
    types::{ChatAction, InputFile, ParseMode},
    ApiError, RequestError,
};

pub mod handlers;
pub mod router;

use relay_core::{
    domain::{ConversationId, MessageId, MessageRef},
    messaging::{
        port::TransportPort,
        types::{OutboundMessage, SendError, TextFormat, TransportCapabilities},
    },
};

/// Telegram's hard limit for message text.
pub const MAX_MESSAGE_LEN: usize = 4096;

#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(id: ConversationId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(id.0)
    }

    fn parse_mode(format: TextFormat) -> Option<ParseMode> {
        match format {
            TextFormat::MarkdownV2 => Some(ParseMode::MarkdownV2),
            TextFormat::Plain => None,
        }
    }
}

/// Map a teloxide failure to the platform-neutral shape the classifier reads.
pub fn send_error_from(e: RequestError) -> SendError {
    match e {
        RequestError::RetryAfter(d) => SendError::new(
            Some(429),
            format!("Too Many Requests: retry after {}", d.as_secs()),
        ),
        RequestError::Api(api) => api_send_error(&api),
        RequestError::MigrateToChatId(_) => SendError::new(
            Some(400),
            "Bad Request: group chat was upgraded to a supergroup chat",
        ),
        other => SendError::new(None, other.to_string()),
    }
}

fn api_send_error(api: &ApiError) -> SendError {
    let message = api.to_string();
    let code = if message.starts_with("Forbidden") {
        403
    } else {
        400
    };
    SendError::new(Some(code), message)
}

#[async_trait]
impl TransportPort for TelegramTransport {
    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            supports_markdown: true,
            supports_attachments: true,
            max_message_len: MAX_MESSAGE_LEN,
        }
    }

    async fn send(
        &self,
        conversation_id: ConversationId,
        message: &OutboundMessage,
    ) -> Result<MessageRef, SendError> {
        let chat = Self::tg_chat(conversation_id);
        let mode = Self::parse_mode(message.format);

        let sent = match &message.attachment {
            Some(attachment) => {
                let mut req = self
                    .bot
                    .send_document(chat, InputFile::file_id(attachment.file_id.clone()));
                if !message.text.is_empty() {
                    req = req.caption(message.text.clone());
                }
                if let Some(mode) = mode {
                    req = req.parse_mode(mode);
                }
                req.await
            }
            None => {
                let mut req = self.bot.send_message(chat, message.text.clone());
                if let Some(mode) = mode {
                    req = req.parse_mode(mode);
                }
                req.await
            }
        };

        let msg = sent.map_err(send_error_from)?;
        Ok(MessageRef {
            conversation_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn typing(&self, conversation_id: ConversationId) -> Result<(), SendError> {
        self.bot
            .send_chat_action(Self::tg_chat(conversation_id), ChatAction::Typing)
            .await
            .map(|_| ())
            .map_err(send_error_from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::classify::{classify_send_error, DeliveryError};
    use std::time::Duration;

    #[test]
    fn retry_after_becomes_a_classified_rate_limit() {
        let err = send_error_from(RequestError::RetryAfter(Duration::from_secs(7)));
        assert_eq!(err.code, Some(429));
        assert_eq!(
            classify_send_error(&err),
            DeliveryError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
    }

    #[test]
    fn blocked_bot_is_recipient_gone() {
        let err = send_error_from(RequestError::Api(ApiError::BotBlocked));
        assert_eq!(err.code, Some(403));
        assert_eq!(classify_send_error(&err), DeliveryError::PermanentRecipientGone);
    }

    #[test]
    fn entity_parse_errors_keep_their_offset() {
        let err = send_error_from(RequestError::Api(ApiError::Unknown(
            "Bad Request: can't parse entities: Character '.' is reserved and must be escaped with the preceding '\\' at byte offset 12"
                .to_string(),
        )));
        assert_eq!(err.code, Some(400));
        assert_eq!(
            classify_send_error(&err),
            DeliveryError::MalformedContent { offset: 12 }
        );
    }

    #[test]
    fn parse_modes() {
        assert_eq!(
            TelegramTransport::parse_mode(TextFormat::MarkdownV2),
            Some(ParseMode::MarkdownV2)
        );
        assert_eq!(TelegramTransport::parse_mode(TextFormat::Plain), None);
    }
}
