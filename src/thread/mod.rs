//! # Thread Module - Conversation Logs
//!
//! One log file per conversation ("thread"), each row a [`MessageRecord`].
//! Rows flow through three directions:
//!
//! ```text
//! inbound  ── written by the bridge when a packet arrives
//! queued   ── written by the agent as a reply waiting for the radio
//! outbound ── rewritten by the bridge once the radio accepted it
//! ```
//!
//! Row order is insertion order, which is not strictly chronological when
//! both processes append; `timestamp` is authoritative.

pub mod layout;
pub mod log_file;
pub mod meta;

pub use layout::{sanitize_name, NodeLayout, ThreadFile};
pub use log_file::{abandoned_count, has_reply, ThreadLog};
pub use meta::{Meta, MetaError};

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;

use crate::storage::Record;

/// Ordered columns of every thread log.
pub const THREAD_SCHEMA: [&str; 12] = [
    "processed",
    "thread_type",
    "thread_key",
    "message_id",
    "direction",
    "sender_id",
    "reply_to_id",
    "timestamp",
    "content",
    "send_attempts",
    "send_status",
    "meta",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ThreadType {
    Channel,
    Dm,
}

impl ThreadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadType::Channel => "channel",
            ThreadType::Dm => "dm",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "channel" => Some(ThreadType::Channel),
            "dm" => Some(ThreadType::Dm),
            _ => None,
        }
    }

    /// Directory name under `threads/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            ThreadType::Channel => "channels",
            ThreadType::Dm => "dms",
        }
    }
}

impl std::fmt::Display for ThreadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Queued,
    Outbound,
    /// Anything else found on disk; preserved verbatim on rewrite.
    Other(String),
}

impl Direction {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "inbound" => Direction::Inbound,
            "queued" => Direction::Queued,
            "outbound" => Direction::Outbound,
            _ => Direction::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Queued => "queued",
            Direction::Outbound => "outbound",
            Direction::Other(s) => s,
        }
    }
}

/// One message row.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub processed: bool,
    /// `None` when the column is empty or unrecognized; readers fall back to
    /// the directory the file lives in.
    pub thread_type: Option<ThreadType>,
    /// Unrecognized `thread_type` text, written back unchanged.
    pub raw_thread_type: Option<String>,
    pub thread_key: String,
    pub message_id: String,
    pub direction: Direction,
    pub sender_id: String,
    pub reply_to_id: Option<String>,
    /// ISO-8601 UTC, kept as text so rewrites are byte-stable.
    pub timestamp: String,
    pub content: String,
    pub send_attempts: u32,
    pub send_status: String,
    pub meta: Meta,
}

impl MessageRecord {
    pub fn new(thread_type: ThreadType, thread_key: &str, direction: Direction) -> Self {
        Self {
            processed: false,
            thread_type: Some(thread_type),
            raw_thread_type: None,
            thread_key: thread_key.to_string(),
            message_id: String::new(),
            direction,
            sender_id: String::new(),
            reply_to_id: None,
            timestamp: iso_now(),
            content: String::new(),
            send_attempts: 0,
            send_status: String::new(),
            meta: Meta::new(),
        }
    }

    pub fn from_record(record: &Record) -> Self {
        let field = |name: &str| record.get(name).cloned().unwrap_or_default();
        let processed = field("processed");
        let reply_to = field("reply_to_id");
        let raw_type = field("thread_type");
        let thread_type = ThreadType::parse(&raw_type);
        Self {
            processed: !matches!(processed.trim(), "" | "0"),
            thread_type,
            raw_thread_type: if thread_type.is_none() && !raw_type.is_empty() {
                Some(raw_type)
            } else {
                None
            },
            thread_key: field("thread_key"),
            message_id: field("message_id"),
            direction: Direction::parse(&field("direction")),
            sender_id: field("sender_id"),
            reply_to_id: if reply_to.is_empty() { None } else { Some(reply_to) },
            timestamp: field("timestamp"),
            content: field("content"),
            send_attempts: field("send_attempts").trim().parse().unwrap_or(0),
            send_status: field("send_status"),
            meta: Meta::parse_lenient(&field("meta")),
        }
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        let mut put = |k: &str, v: String| {
            record.insert(k.to_string(), v);
        };
        put("processed", if self.processed { "1" } else { "0" }.to_string());
        put(
            "thread_type",
            self.thread_type
                .map(|t| t.as_str().to_string())
                .or_else(|| self.raw_thread_type.clone())
                .unwrap_or_default(),
        );
        put("thread_key", self.thread_key.clone());
        put("message_id", self.message_id.clone());
        put("direction", self.direction.as_str().to_string());
        put("sender_id", self.sender_id.clone());
        put("reply_to_id", self.reply_to_id.clone().unwrap_or_default());
        put("timestamp", self.timestamp.clone());
        put("content", self.content.clone());
        put("send_attempts", self.send_attempts.to_string());
        put("send_status", self.send_status.clone());
        put("meta", self.meta.encode());
        record
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(self.timestamp.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Current time as ISO-8601 with an explicit UTC offset.
pub fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Deterministic id for a row that arrived without one. The row index keeps
/// two otherwise identical rows apart.
pub fn synthesize_message_id(file_stem: &str, index: usize, record: &MessageRecord) -> String {
    const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    let mut digest = CRC32.digest();
    digest.update(file_stem.as_bytes());
    digest.update(b"|");
    digest.update(record.thread_key.as_bytes());
    digest.update(b"|");
    digest.update(record.timestamp.as_bytes());
    digest.update(b"|");
    digest.update(record.content.as_bytes());
    format!("gen_{}_{}_{:08x}", file_stem, index, digest.finalize())
}

/// Fresh id for a generated reply: a random unsigned 32-bit integer, the same
/// shape radio packet ids have.
pub fn new_reply_id() -> String {
    rand::thread_rng().gen::<u32>().to_string()
}
