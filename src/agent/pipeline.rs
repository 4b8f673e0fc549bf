//! Trigger detection and reply row construction.

use std::fmt;

use crate::persona::PersonaRegistry;
use crate::thread::{new_reply_id, Direction, Meta, MessageRecord, ThreadType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Stop,
    Status,
    Config,
    Help,
}

impl ControlCommand {
    pub const ALL: [ControlCommand; 5] = [
        ControlCommand::Start,
        ControlCommand::Stop,
        ControlCommand::Status,
        ControlCommand::Config,
        ControlCommand::Help,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::Start => "start",
            ControlCommand::Stop => "stop",
            ControlCommand::Status => "status",
            ControlCommand::Config => "config",
            ControlCommand::Help => "help",
        }
    }

    /// Case-insensitive.
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.to_lowercase();
        Self::ALL.into_iter().find(|c| c.as_str() == token)
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound message addressed to a persona.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaMatch {
    pub persona: String,
    /// The first token as typed.
    pub trigger: String,
    pub command: Option<ControlCommand>,
    /// Text after the trigger (after the command when there is one), trimmed.
    pub remainder: String,
}

impl PersonaMatch {
    /// Prompt for the model: the remainder, or the whole message when the
    /// trigger was sent alone.
    pub fn prompt<'a>(&'a self, content: &'a str) -> &'a str {
        if self.remainder.is_empty() {
            content.trim()
        } else {
            &self.remainder
        }
    }
}

/// Split off the first whitespace-delimited token.
fn split_token(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    match text.find(char::is_whitespace) {
        Some(end) => Some((&text[..end], text[end..].trim_start())),
        None => Some((text, "")),
    }
}

/// Match the first token of `content` against persona triggers. There is no
/// catch-all persona: unmatched messages yield `None`.
pub fn detect(registry: &PersonaRegistry, content: &str) -> Option<PersonaMatch> {
    let (trigger, rest) = split_token(content)?;
    let persona = registry.find_by_trigger(trigger)?;
    let (command, remainder) = match split_token(rest) {
        Some((second, after)) => match ControlCommand::parse(second) {
            Some(command) => (Some(command), after.trim_end()),
            None => (None, rest.trim_end()),
        },
        None => (None, ""),
    };
    Some(PersonaMatch {
        persona: persona.name.clone(),
        trigger: trigger.to_string(),
        command,
        remainder: remainder.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Control,
    Llm,
}

impl ReplyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyKind::Control => "control",
            ReplyKind::Llm => "llm",
        }
    }
}

/// The inbound row a reply answers.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplySource {
    pub thread_type: ThreadType,
    pub thread_key: String,
    pub message_id: String,
    pub meta: Meta,
}

impl ReplySource {
    pub fn from_row(row: &MessageRecord, fallback_type: ThreadType, fallback_key: &str, message_id: &str) -> Self {
        let thread_key = if row.thread_key.trim().is_empty() {
            fallback_key.to_string()
        } else {
            row.thread_key.clone()
        };
        Self {
            thread_type: row.thread_type.unwrap_or(fallback_type),
            thread_key,
            message_id: message_id.to_string(),
            meta: row.meta.clone(),
        }
    }
}

/// A queued reply row. Meta is the source meta overlaid with the reply
/// identity and then `extra`.
pub fn build_reply(
    source: &ReplySource,
    persona: &str,
    trigger: &str,
    kind: ReplyKind,
    content: &str,
    extra: &Meta,
) -> MessageRecord {
    let mut row = MessageRecord::new(source.thread_type, &source.thread_key, Direction::Queued);
    row.message_id = new_reply_id();
    row.sender_id = persona.to_string();
    row.reply_to_id = Some(source.message_id.clone());
    row.content = content.to_string();
    row.meta = source.meta.clone();
    row.meta.insert("persona", persona);
    row.meta.insert("trigger", trigger);
    row.meta.insert("source_message_id", source.message_id.as_str());
    row.meta.insert("reply_type", kind.as_str());
    row.meta.merge(extra);
    row
}

/// One row per chunk, each tagged with `chunk_index`/`chunk_total`.
pub fn build_chunked_replies(
    source: &ReplySource,
    persona: &str,
    trigger: &str,
    kind: ReplyKind,
    chunks: &[String],
    extra: &Meta,
) -> Vec<MessageRecord> {
    let total = chunks.len();
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut meta = extra.clone();
            meta.insert("chunk_index", i + 1);
            meta.insert("chunk_total", total);
            build_reply(source, persona, trigger, kind, chunk, &meta)
        })
        .collect()
}
