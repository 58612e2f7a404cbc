//! Transport error classification.
//!
//! Turns the platform's error code + description into an actionable
//! [`DeliveryError`]. Never fails: anything unrecognized is `Unknown`.

use std::{sync::OnceLock, time::Duration};

use regex::Regex;

use crate::messaging::types::SendError;

/// What a failed send means for the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryError {
    /// Network-level failure or 5xx; worth retrying with backoff.
    Transient,
    /// Flood control. `retry_after` is present when the platform reported it.
    RateLimited { retry_after: Option<Duration> },
    /// The rich text was rejected; `offset` is in UTF-16 code units.
    MalformedContent { offset: usize },
    /// Blocked by the user, chat deleted, bot kicked, ...
    PermanentRecipientGone,
    /// Unrecognized; treated as non-retryable.
    Unknown,
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::Transient
                | DeliveryError::RateLimited { .. }
                | DeliveryError::MalformedContent { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeliveryError::Transient => "transient",
            DeliveryError::RateLimited { .. } => "rate_limited",
            DeliveryError::MalformedContent { .. } => "malformed_content",
            DeliveryError::PermanentRecipientGone => "recipient_gone",
            DeliveryError::Unknown => "unknown",
        }
    }
}

const RATE_LIMIT_CODE: i32 = 429;
const FORBIDDEN_CODE: i32 = 403;

const RECIPIENT_GONE_MARKERS: &[&str] = &[
    "bot was blocked by the user",
    "user is deactivated",
    "bot was kicked",
    "chat not found",
    "user not found",
    "peer_id_invalid",
    "group chat was upgraded",
    "bot can't initiate conversation",
];

fn retry_after_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)retry[ _-]?after:?\s*(\d+)").expect("valid regex"))
}

fn entity_offset_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)can't parse entities.*?byte offset\s+(\d+)").expect("valid regex")
    })
}

/// Classify a transport failure. Rules are applied in priority order:
/// rate limit, malformed content, recipient gone, transient, unknown.
pub fn classify(code: Option<i32>, message: &str) -> DeliveryError {
    if code == Some(RATE_LIMIT_CODE) {
        return DeliveryError::RateLimited {
            retry_after: parse_retry_after(message),
        };
    }

    if let Some(offset) = parse_entity_offset(message) {
        return DeliveryError::MalformedContent { offset };
    }

    let lower = message.to_lowercase();
    if code == Some(FORBIDDEN_CODE) || RECIPIENT_GONE_MARKERS.iter().any(|m| lower.contains(m)) {
        return DeliveryError::PermanentRecipientGone;
    }

    match code {
        None => DeliveryError::Transient,
        Some(c) if (500..600).contains(&c) => DeliveryError::Transient,
        _ => DeliveryError::Unknown,
    }
}

pub fn classify_send_error(err: &SendError) -> DeliveryError {
    classify(err.code, &err.message)
}

fn parse_retry_after(message: &str) -> Option<Duration> {
    let caps = retry_after_re().captures(message)?;
    let secs = caps.get(1)?.as_str().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

fn parse_entity_offset(message: &str) -> Option<usize> {
    let caps = entity_offset_re().captures(message)?;
    caps.get(1)?.as_str().parse::<usize>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_extracts_retry_after() {
        let e = classify(Some(429), "Too Many Requests: retry after 5");
        assert_eq!(
            e,
            DeliveryError::RateLimited {
                retry_after: Some(Duration::from_secs(5))
            }
        );
    }

    #[test]
    fn rate_limit_without_duration() {
        let e = classify(Some(429), "Too Many Requests");
        assert_eq!(e, DeliveryError::RateLimited { retry_after: None });
    }

    #[test]
    fn rate_limit_code_wins_over_message_content() {
        let e = classify(
            Some(429),
            "can't parse entities: Can't find end of the entity starting at byte offset 3",
        );
        assert!(matches!(e, DeliveryError::RateLimited { .. }));
    }

    #[test]
    fn parse_entities_offset() {
        let e = classify(
            Some(400),
            "Bad Request: can't parse entities: Can't find end of the entity starting at byte offset 12",
        );
        assert_eq!(e, DeliveryError::MalformedContent { offset: 12 });
    }

    #[test]
    fn parse_entities_without_offset_is_unknown() {
        let e = classify(
            Some(400),
            "Bad Request: can't parse entities: Character '!' is reserved and must be escaped",
        );
        assert_eq!(e, DeliveryError::Unknown);
    }

    #[test]
    fn offset_overflow_degrades_to_unknown() {
        let e = classify(
            Some(400),
            "can't parse entities at byte offset 99999999999999999999999999",
        );
        assert_eq!(e, DeliveryError::Unknown);
    }

    #[test]
    fn blocked_and_missing_recipients_are_gone() {
        assert_eq!(
            classify(Some(403), "Forbidden: bot was blocked by the user"),
            DeliveryError::PermanentRecipientGone
        );
        assert_eq!(
            classify(Some(400), "Bad Request: chat not found"),
            DeliveryError::PermanentRecipientGone
        );
        assert_eq!(
            classify(Some(403), "Forbidden: something new"),
            DeliveryError::PermanentRecipientGone
        );
    }

    #[test]
    fn network_and_server_errors_are_transient() {
        assert_eq!(classify(None, "connection reset"), DeliveryError::Transient);
        assert_eq!(
            classify(Some(502), "Bad Gateway"),
            DeliveryError::Transient
        );
    }

    #[test]
    fn garbage_is_unknown_and_never_panics() {
        for msg in ["", "???", "byte offset", "\u{0}\u{1}", "retry after x"] {
            let e = classify(Some(400), msg);
            assert_eq!(e, DeliveryError::Unknown, "message: {msg:?}");
            assert!(!e.is_retryable());
        }
        assert_eq!(classify(Some(-1), "weird"), DeliveryError::Unknown);
    }
}
