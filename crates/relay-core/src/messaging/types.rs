use std::fmt;

/// How the transport should interpret the message text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextFormat {
    /// Telegram MarkdownV2 rich text.
    MarkdownV2,
    /// No markup; the text is shown verbatim.
    Plain,
}

/// A reference to media already known to the platform (e.g. a Telegram file id).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub file_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub text: String,
    pub format: TextFormat,
    pub attachment: Option<Attachment>,
}

impl OutboundMessage {
    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            format: TextFormat::MarkdownV2,
            attachment: None,
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            format: TextFormat::Plain,
            attachment: None,
        }
    }

    /// Same message with different text (used when resending repaired markup).
    pub fn with_text(&self, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            format: self.format,
            attachment: self.attachment.clone(),
        }
    }
}

/// A failed send as reported by the platform.
///
/// `code` is the platform's numeric error code (HTTP-like: 400, 403, 429, 5xx).
/// `None` means no API response was received at all (network-level failure).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendError {
    pub code: Option<i32>,
    pub message: String,
}

impl SendError {
    pub fn new(code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Capabilities / limits of a transport implementation.
#[derive(Clone, Copy, Debug)]
pub struct TransportCapabilities {
    pub supports_markdown: bool,
    pub supports_attachments: bool,
    pub max_message_len: usize,
}
