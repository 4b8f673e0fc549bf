//! Text shaping for radio-sized replies. All limits count characters, not bytes.

use std::sync::OnceLock;

use regex::Regex;

static REASONING_BLOCK: OnceLock<Option<Regex>> = OnceLock::new();

/// Remove `<think>...</think>` blocks (case-insensitive, spanning lines) and trim.
pub fn strip_reasoning(text: &str) -> String {
    let re = REASONING_BLOCK.get_or_init(|| Regex::new(r"(?is)<think>.*?</think>").ok());
    match re {
        Some(re) => re.replace_all(text, "").trim().to_string(),
        None => text.trim().to_string(),
    }
}

/// Byte offset of the `n`th char, or the string length.
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

/// Split `text` into chunks of at most `limit` chars, breaking at the last
/// whitespace at or before the limit and hard-cutting only when a chunk
/// has no whitespace at all.
pub fn chunk_response(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut remaining = text.trim();
    let mut chunks = Vec::new();
    while !remaining.is_empty() {
        if remaining.chars().count() <= limit {
            chunks.push(remaining.to_string());
            break;
        }
        let hard = byte_offset(remaining, limit);
        let window = &remaining[..byte_offset(remaining, limit + 1)];
        let split = window
            .rfind(char::is_whitespace)
            .filter(|&pos| pos > 0)
            .unwrap_or(hard);
        let mut chunk = remaining[..split].trim_end();
        if chunk.is_empty() {
            chunk = remaining[..hard].trim_end();
        }
        chunks.push(chunk.to_string());
        remaining = remaining[chunk.len()..].trim_start();
    }
    chunks
}

/// Chunk with room for a `(i/n) ` prefix on every part when there is more
/// than one. The prefix width depends on `n`, so this settles iteratively.
pub fn chunk_with_markers(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = chunk_response(text, limit);
    for _ in 0..3 {
        if chunks.len() <= 1 {
            return chunks;
        }
        let width = marker(chunks.len(), chunks.len()).chars().count();
        let next = chunk_response(text, limit.saturating_sub(width).max(1));
        let settled = next.len() == chunks.len();
        chunks = next;
        if settled {
            break;
        }
    }
    let total = chunks.len();
    if total <= 1 {
        return chunks;
    }
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, c)| format!("{}{}", marker(i + 1, total), c))
        .collect()
}

fn marker(index: usize, total: usize) -> String {
    format!("({}/{}) ", index, total)
}

/// Keep the most recent `max_chars` characters of a prompt. `0` disables the cap.
pub fn cap_context(prompt: &str, max_chars: usize) -> String {
    let count = prompt.chars().count();
    if max_chars == 0 || count <= max_chars {
        return prompt.to_string();
    }
    prompt[byte_offset(prompt, count - max_chars)..].to_string()
}

/// Split a persona file into messages headed `<name> config (i/n):`. Bodies
/// pack whole lines; lines longer than a body are hard-split.
pub fn split_config_chunks(persona_name: &str, text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(80);
    let header_width = format!("{} config (000/000):\n", persona_name).chars().count();
    let body_limit = limit.saturating_sub(header_width).max(40);
    let bodies = chunk_config_body(text, body_limit);
    let total = bodies.len().max(1);
    bodies
        .into_iter()
        .enumerate()
        .map(|(i, body)| format!("{} config ({}/{}):\n{}", persona_name, i + 1, total, body))
        .collect()
}

fn chunk_config_body(text: &str, limit: usize) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len <= limit {
            current.push_str(line);
            current_len += line_len;
            continue;
        }
        if !current.is_empty() {
            pieces.push(current.trim_end_matches('\n').to_string());
            current.clear();
        }
        let mut rest = line;
        while rest.chars().count() > limit {
            let cut = byte_offset(rest, limit);
            pieces.push(rest[..cut].to_string());
            rest = &rest[cut..];
        }
        current.push_str(rest);
        current_len = rest.chars().count();
    }
    if !current.is_empty() {
        pieces.push(current.trim_end_matches('\n').to_string());
    }
    if pieces.is_empty() {
        pieces.push(String::new());
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_reasoning_blocks() {
        let raw = "<THINK>plan\nsteps</think>  Answer <think>x</think>here ";
        assert_eq!(strip_reasoning(raw), "Answer here");
        assert_eq!(strip_reasoning("<think>only</think>"), "");
    }

    #[test]
    fn chunks_respect_limit_and_word_boundaries() {
        let words: Vec<String> = (0..100).map(|i| format!("w{:03}", i)).collect();
        let text = words.join(" ");
        assert_eq!(text.len(), 499);
        let chunks = chunk_response(&text, 200);
        assert!(chunks.len() >= 3);
        for c in &chunks {
            assert!(c.chars().count() <= 200);
            assert!(!c.starts_with(' ') && !c.ends_with(' '));
            assert!(c.split(' ').all(|w| w.len() == 4));
        }
        assert_eq!(chunks.join(" "), text);
    }

    #[test]
    fn hard_cut_without_whitespace() {
        let text = "x".repeat(450);
        let chunks = chunk_response(&text, 200);
        assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![200, 200, 50]);
    }

    #[test]
    fn multibyte_text_is_cut_on_char_boundaries() {
        let text = "é".repeat(30);
        let chunks = chunk_response(&text, 7);
        assert!(chunks.iter().all(|c| c.chars().count() <= 7));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn markers_fit_within_limit() {
        let text = "lorem ipsum dolor sit amet ".repeat(20);
        let chunks = chunk_with_markers(&text, 60);
        let total = chunks.len();
        assert!(total > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert!(c.starts_with(&format!("({}/{}) ", i + 1, total)));
            assert!(c.chars().count() <= 60, "{}", c);
        }
        assert_eq!(chunk_with_markers("short", 60), vec!["short"]);
    }

    #[test]
    fn cap_context_keeps_tail() {
        assert_eq!(cap_context("abcdef", 3), "def");
        assert_eq!(cap_context("abc", 0), "abc");
    }

    #[test]
    fn config_chunks_have_headers_and_fit() {
        let text = (0..20)
            .map(|i| format!("key_{} = \"value number {}\"", i, i))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = split_config_chunks("librarian", &text, 120);
        let total = chunks.len();
        assert!(total > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert!(c.starts_with(&format!("librarian config ({}/{}):\n", i + 1, total)));
            assert!(c.chars().count() <= 120);
        }
        let long = "y".repeat(300);
        let chunks = split_config_chunks("x", &long, 80);
        assert!(chunks.len() >= 4);
    }
}
