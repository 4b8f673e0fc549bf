//! Single-line previews of message text and model output for log records.

use std::fmt::Write;

/// Default preview length for message content in logs.
pub const PREVIEW_CHARS: usize = 120;

/// Escape control characters and cap the length so a log record never spans
/// lines. Backslashes are doubled so `\n` in the output is unambiguous.
pub fn log_preview(s: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(s.len().min(max_chars) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= max_chars {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// [`log_preview`] at [`PREVIEW_CHARS`].
pub fn preview(s: &str) -> String {
    log_preview(s, PREVIEW_CHARS)
}
