//! Deterministic repair of rich text rejected by the platform.
//!
//! Given the text and the offset the platform complained about, escape the
//! offending markup at/after that offset until the text parses. When no
//! targeted repair is derivable, fall back to escaping every markup-significant
//! character. Output always parses, so repairing it again is a no-op.

use crate::messaging::types::TextFormat;

/// Characters that must be escaped outside of entities in Telegram MarkdownV2.
pub const MARKDOWN_V2_RESERVED: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

const ESCAPE: char = '\\';

/// Markup dialect of the text being repaired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    MarkdownV2,
    Plain,
}

impl Dialect {
    pub fn for_format(format: TextFormat) -> Self {
        match format {
            TextFormat::MarkdownV2 => Dialect::MarkdownV2,
            TextFormat::Plain => Dialect::Plain,
        }
    }

    pub fn reserved(self) -> &'static [char] {
        match self {
            Dialect::MarkdownV2 => MARKDOWN_V2_RESERVED,
            Dialect::Plain => &[],
        }
    }
}

/// Repair `text` given the UTF-16 `offset` reported by the platform.
///
/// Never fails. Same input, same output.
pub fn repair(text: &str, offset: Option<usize>, dialect: Dialect) -> String {
    if dialect == Dialect::Plain || check_markdown_v2(&chars_of(text)).is_ok() {
        return text.to_string();
    }

    let Some(offset) = offset else {
        return escape_all(text, dialect);
    };

    targeted_repair(text, offset, dialect).unwrap_or_else(|| escape_all(text, dialect))
}

fn targeted_repair(text: &str, offset: usize, dialect: Dialect) -> Option<String> {
    let mut chars = chars_of(text);
    let start = char_index_at_utf16(&chars, offset)?;
    if is_escaped(&chars, start) {
        return None;
    }

    let first = (start..chars.len()).find(|&i| is_unescaped_reserved(&chars, i, dialect))?;
    chars.insert(first, ESCAPE);

    // Each step escapes one more reserved character, so this terminates.
    for _ in 0..=chars.len() {
        match check_markdown_v2(&chars) {
            Ok(()) => return Some(chars.into_iter().collect()),
            Err(idx) => {
                if !is_unescaped_reserved(&chars, idx, dialect) {
                    return None;
                }
                chars.insert(idx, ESCAPE);
            }
        }
    }
    None
}

/// Maximally conservative rendering: every markup-significant character is
/// escaped; escape pairs already present are kept as they are.
pub fn escape_all(text: &str, dialect: Dialect) -> String {
    if dialect == Dialect::Plain {
        return text.to_string();
    }

    let reserved = dialect.reserved();
    let chars = chars_of(text);
    let mut out = String::with_capacity(text.len() + text.len() / 4);
    let mut i = 0usize;
    while i < chars.len() {
        let c = chars[i];
        if c == ESCAPE {
            match chars.get(i + 1) {
                Some(&next) if next == ESCAPE || reserved.contains(&next) => {
                    out.push(ESCAPE);
                    out.push(next);
                    i += 2;
                }
                _ => {
                    out.push(ESCAPE);
                    out.push(ESCAPE);
                    i += 1;
                }
            }
            continue;
        }
        if reserved.contains(&c) {
            out.push(ESCAPE);
        }
        out.push(c);
        i += 1;
    }
    out
}

/// Check `text` against MarkdownV2 parsing rules.
///
/// On failure returns the UTF-16 offset of the offending character (an
/// unescaped reserved char, or the opener of an entity that is never closed).
pub fn validate_markdown_v2(text: &str) -> Result<(), usize> {
    let chars = chars_of(text);
    check_markdown_v2(&chars).map_err(|idx| utf16_offset_of(&chars, idx))
}

fn chars_of(text: &str) -> Vec<char> {
    text.chars().collect()
}

fn char_index_at_utf16(chars: &[char], offset: usize) -> Option<usize> {
    let mut units = 0usize;
    for (idx, c) in chars.iter().enumerate() {
        if units == offset {
            return Some(idx);
        }
        if units > offset {
            // Offset lands inside a surrogate pair.
            return None;
        }
        units += c.len_utf16();
    }
    None
}

fn utf16_offset_of(chars: &[char], idx: usize) -> usize {
    chars[..idx.min(chars.len())]
        .iter()
        .map(|c| c.len_utf16())
        .sum()
}

/// True when `chars[idx]` is preceded by an odd run of escape characters.
fn is_escaped(chars: &[char], idx: usize) -> bool {
    let run = chars[..idx].iter().rev().take_while(|&&c| c == ESCAPE).count();
    run % 2 == 1
}

fn is_unescaped_reserved(chars: &[char], idx: usize, dialect: Dialect) -> bool {
    chars
        .get(idx)
        .is_some_and(|c| dialect.reserved().contains(c))
        && !is_escaped(chars, idx)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Entity {
    Bold,
    Italic,
    Underline,
    Strike,
    Spoiler,
    LinkText,
}

fn check_markdown_v2(chars: &[char]) -> Result<(), usize> {
    let mut stack: Vec<(Entity, usize)> = Vec::new();
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ESCAPE => i = skip_escape(chars, i)?,
            '`' if starts_with(chars, i, "```") => i = scan_pre(chars, i)?,
            '`' => i = scan_code(chars, i)?,
            '*' => {
                toggle(&mut stack, Entity::Bold, i)?;
                i += 1;
            }
            '_' if chars.get(i + 1) == Some(&'_') => {
                toggle(&mut stack, Entity::Underline, i)?;
                i += 2;
            }
            '_' => {
                toggle(&mut stack, Entity::Italic, i)?;
                i += 1;
            }
            '~' => {
                toggle(&mut stack, Entity::Strike, i)?;
                i += 1;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                toggle(&mut stack, Entity::Spoiler, i)?;
                i += 2;
            }
            '[' => {
                stack.push((Entity::LinkText, i));
                i += 1;
            }
            ']' => {
                if !matches!(stack.last(), Some((Entity::LinkText, _))) {
                    return Err(i);
                }
                if chars.get(i + 1) != Some(&'(') {
                    return Err(i);
                }
                stack.pop();
                i = scan_url(chars, i + 1)?;
            }
            '>' if i == 0 || chars[i - 1] == '\n' => i += 1,
            c if MARKDOWN_V2_RESERVED.contains(&c) => return Err(i),
            _ => i += 1,
        }
    }

    match stack.last() {
        Some(&(_, opener)) => Err(opener),
        None => Ok(()),
    }
}

fn toggle(stack: &mut Vec<(Entity, usize)>, entity: Entity, i: usize) -> Result<(), usize> {
    match stack.iter().rposition(|(e, _)| *e == entity) {
        None => {
            stack.push((entity, i));
            Ok(())
        }
        Some(pos) if pos + 1 == stack.len() => {
            stack.pop();
            Ok(())
        }
        // Closing across another open entity: improper nesting.
        Some(_) => Err(i),
    }
}

fn skip_escape(chars: &[char], i: usize) -> Result<usize, usize> {
    match chars.get(i + 1) {
        Some(&next) if (1..=126).contains(&(next as u32)) => Ok(i + 2),
        _ => Err(i),
    }
}

fn starts_with(chars: &[char], i: usize, pat: &str) -> bool {
    let mut j = i;
    for p in pat.chars() {
        if chars.get(j) != Some(&p) {
            return false;
        }
        j += 1;
    }
    true
}

fn scan_code(chars: &[char], open: usize) -> Result<usize, usize> {
    let mut j = open + 1;
    while j < chars.len() {
        match chars[j] {
            ESCAPE => j = skip_escape(chars, j)?,
            '`' => return Ok(j + 1),
            _ => j += 1,
        }
    }
    Err(open)
}

fn scan_pre(chars: &[char], open: usize) -> Result<usize, usize> {
    let mut j = open + 3;
    while j < chars.len() {
        if starts_with(chars, j, "```") {
            return Ok(j + 3);
        }
        match chars[j] {
            ESCAPE => j = skip_escape(chars, j)?,
            '`' => return Err(j),
            _ => j += 1,
        }
    }
    Err(open)
}

fn scan_url(chars: &[char], open: usize) -> Result<usize, usize> {
    let mut j = open + 1;
    while j < chars.len() {
        match chars[j] {
            ESCAPE => j = skip_escape(chars, j)?,
            ')' => return Ok(j + 1),
            _ => j += 1,
        }
    }
    Err(open)
}
