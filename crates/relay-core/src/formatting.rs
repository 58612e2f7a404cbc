//! Formatting utilities (Markdown → Telegram MarkdownV2).

use std::sync::OnceLock;

use regex::Regex;

use crate::repair::MARKDOWN_V2_RESERVED;

/// Escape every MarkdownV2 reserved character (and the backslash itself).
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 4);
    for c in text.chars() {
        if c == '\\' || MARKDOWN_V2_RESERVED.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape for `code`/`pre` entities: only backtick and backslash.
pub fn escape_code(text: &str) -> String {
    escape_only(text, &['`', '\\'])
}

/// Escape for the URL part of a link: only `)` and backslash.
pub fn escape_url(text: &str) -> String {
    escape_only(text, &[')', '\\'])
}

fn escape_only(text: &str, set: &[char]) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if set.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Convert common Markdown (as produced by LLMs) to Telegram MarkdownV2.
///
/// Supported: fenced code blocks, inline code, bold, italic, strikethrough,
/// headers (rendered bold), links, bullet lists. Everything else is escaped,
/// so the result always parses.
pub fn to_markdown_v2(input: &str) -> String {
    let (text, code_blocks) = extract_code_blocks(input);
    let (text, inline_codes) = extract_inline_codes(&text);

    let mut out = text
        .split('\n')
        .filter(|line| !is_horizontal_rule(line))
        .map(convert_line)
        .collect::<Vec<_>>()
        .join("\n");

    for (i, code) in code_blocks.iter().enumerate() {
        out = out.replace(
            &format!("\0CODEBLOCK{i}\0"),
            &format!("```\n{}```", escape_code(code)),
        );
    }

    for (i, code) in inline_codes.iter().enumerate() {
        out = out.replace(
            &format!("\0INLINECODE{i}\0"),
            &format!("`{}`", escape_code(code)),
        );
    }

    while out.contains("\n\n\n") {
        out = out.replace("\n\n\n", "\n\n");
    }

    out
}

fn is_horizontal_rule(line: &str) -> bool {
    let t = line.trim();
    t.len() >= 3 && t.chars().all(|c| c == '-' || c == '*')
}

fn convert_line(line: &str) -> String {
    if let Some(title) = header_text(line) {
        return format!("*{}*", escape_text(title));
    }
    if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
        return format!("• {}", convert_inline(rest));
    }
    if let Some(rest) = line.strip_prefix("> ") {
        return format!(">{}", convert_inline(rest));
    }
    convert_inline(line)
}

fn header_text(line: &str) -> Option<&str> {
    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    line[hashes..].strip_prefix(' ')
}

fn inline_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"\*\*(?P<b1>.+?)\*\*",
            r"|__(?P<b2>.+?)__",
            r"|~~(?P<s>.+?)~~",
            r"|\*(?P<i1>[^*\s][^*]*?)\*",
            r"|_(?P<i2>[^_\s][^_]*?)_",
            r"|\[(?P<lt>[^\]]+)\]\((?P<lu>[^)\s]+)\)",
        ))
        .expect("valid regex")
    })
}

fn convert_inline(line: &str) -> String {
    let re = inline_re();
    let mut out = String::new();
    let mut pos = 0usize;

    while let Some(caps) = re.captures_at(line, pos) {
        let Some(whole) = caps.get(0) else {
            break;
        };

        // `snake_case_words` are not italics.
        let intraword = caps.name("i2").is_some()
            && line[..whole.start()]
                .chars()
                .next_back()
                .is_some_and(char::is_alphanumeric);
        if intraword {
            let first_len = line[whole.start()..]
                .chars()
                .next()
                .map(char::len_utf8)
                .unwrap_or(1);
            out.push_str(&escape_text(&line[pos..whole.start() + first_len]));
            pos = whole.start() + first_len;
            continue;
        }

        out.push_str(&escape_text(&line[pos..whole.start()]));

        if let Some(m) = caps.name("b1").or_else(|| caps.name("b2")) {
            out.push_str(&format!("*{}*", escape_text(m.as_str())));
        } else if let Some(m) = caps.name("s") {
            out.push_str(&format!("~{}~", escape_text(m.as_str())));
        } else if let Some(m) = caps.name("i1").or_else(|| caps.name("i2")) {
            out.push_str(&format!("_{}_", escape_text(m.as_str())));
        } else if let (Some(t), Some(u)) = (caps.name("lt"), caps.name("lu")) {
            out.push_str(&format!(
                "[{}]({})",
                escape_text(t.as_str()),
                escape_url(u.as_str())
            ));
        }

        pos = whole.end();
    }

    out.push_str(&escape_text(&line[pos..]));
    out
}

fn extract_code_blocks(input: &str) -> (String, Vec<String>) {
    let mut blocks = Vec::new();
    let mut out = String::new();

    let mut i = 0usize;
    while let Some(rel) = input[i..].find("```") {
        let start = i + rel;
        out.push_str(&input[i..start]);

        let mut p = start + 3;
        // Optional language identifier: [A-Za-z0-9_+-]+
        while p < input.len() {
            let b = input.as_bytes()[p];
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'+' || b == b'-' {
                p += 1;
            } else {
                break;
            }
        }
        if p < input.len() && input.as_bytes()[p] == b'\n' {
            p += 1;
        }

        if let Some(end_rel) = input[p..].find("```") {
            let end = p + end_rel;
            let idx = blocks.len();
            blocks.push(input[p..end].to_string());
            out.push_str(&format!("\0CODEBLOCK{idx}\0"));
            i = end + 3;
            continue;
        }

        // Unclosed fence: treat the rest as text (it gets escaped).
        out.push_str(&input[start..]);
        return (out, blocks);
    }

    out.push_str(&input[i..]);
    (out, blocks)
}

fn extract_inline_codes(input: &str) -> (String, Vec<String>) {
    let mut codes = Vec::new();
    let mut out = String::new();

    let mut i = 0usize;
    while let Some(rel) = input[i..].find('`') {
        let start = i + rel;
        out.push_str(&input[i..start]);

        let content_start = start + 1;
        if let Some(end_rel) = input[content_start..].find(['`', '\n']) {
            let end = content_start + end_rel;
            if input.as_bytes()[end] == b'`' {
                let idx = codes.len();
                codes.push(input[content_start..end].to_string());
                out.push_str(&format!("\0INLINECODE{idx}\0"));
                i = end + 1;
                continue;
            }
            // Newline before the closing backtick: not inline code.
            out.push('`');
            i = content_start;
            continue;
        }

        out.push_str(&input[start..]);
        return (out, codes);
    }

    out.push_str(&input[i..]);
    (out, codes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repair::validate_markdown_v2;

    #[test]
    fn escapes_reserved_characters() {
        assert_eq!(escape_text("a.b!(c)"), "a\\.b\\!\\(c\\)");
        assert_eq!(escape_text("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn converts_bold_and_escapes_punctuation() {
        assert_eq!(to_markdown_v2("**Hello**, world!"), "*Hello*, world\\!");
    }

    #[test]
    fn converts_headers_and_bullets() {
        let md = "# Title\n- item one\n- item.two";
        assert_eq!(to_markdown_v2(md), "*Title*\n• item one\n• item\\.two");
    }

    #[test]
    fn keeps_code_contents_verbatim() {
        assert_eq!(to_markdown_v2("Use `a_b()` now."), "Use `a_b()` now\\.");
        assert_eq!(
            to_markdown_v2("```rust\nfn main() {}\n```"),
            "```\nfn main() {}\n```"
        );
    }

    #[test]
    fn converts_links() {
        assert_eq!(
            to_markdown_v2("[docs](https://example.com/x)"),
            "[docs](https://example.com/x)"
        );
    }

    #[test]
    fn snake_case_is_not_italic() {
        assert_eq!(to_markdown_v2("snake_case_name"), "snake\\_case\\_name");
        assert_eq!(to_markdown_v2("an _italic_ word"), "an _italic_ word");
    }

    #[test]
    fn output_always_validates() {
        let inputs = [
            "Hello! How are you? (fine) #tag 1+1=2 {x} a|b",
            "**bold *nested* bold** and ~~gone~~",
            "unclosed **bold and `code",
            "> quoted line\n---\n1. first\n2. second",
            "```\nlet x = `y`;\n```\ntext after.",
            "Привет, мир! 😀 [ссылка](https://t.me/a_b)",
        ];
        for input in inputs {
            let out = to_markdown_v2(input);
            assert_eq!(validate_markdown_v2(&out), Ok(()), "input {input:?} -> {out:?}");
        }
    }
}
