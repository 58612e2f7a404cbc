use chrono::Utc;

/// RFC3339 timestamp in UTC (for history entries and logs).
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

/// Truncate to `max_len` characters, appending `...` when something was cut.
pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

/// Split into chunks of at most `max_chars` characters, preferring to cut
/// after a newline.
pub fn split_text(s: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut out = Vec::new();
    let mut rest: Vec<char> = s.chars().collect();

    while rest.len() > max_chars {
        let window = &rest[..max_chars];
        let cut = match window.iter().rposition(|c| *c == '\n') {
            Some(nl) if nl > 0 => nl + 1,
            _ => max_chars,
        };
        out.push(rest.drain(..cut).collect());
    }
    if !rest.is_empty() {
        out.push(rest.into_iter().collect());
    }
    out
}
