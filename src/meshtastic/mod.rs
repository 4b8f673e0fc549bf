//! # Meshtastic Transport Seam
//!
//! The radio driver lives outside this crate. The bridge only needs to hand a
//! text payload to "something that can put it on the mesh", which is the
//! [`Transport`] trait. [`ConsoleTransport`] prints instead of transmitting and
//! is what `meshllm bridge` uses when no radio driver is linked in.
//!
//! Packets coming the other way arrive as a [`Packet`]: text messages
//! ([`InboundText`], recorded by [`crate::bridge::Bridge::record_inbound`])
//! or telemetry ([`Telemetry`], recorded by
//! [`crate::bridge::Bridge::record_sighting`]).

use std::fmt;

use log::info;
use thiserror::Error;

use crate::logutil::preview;
use crate::thread::Meta;

/// Broadcast address as a decimal node number.
pub const BROADCAST_NUM: u32 = 0xffff_ffff;

/// Where an outbound payload goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Direct message to a node id (e.g. `!a1b2c3d4`).
    Direct(String),
    /// Broadcast on a channel index.
    Channel(u32),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Direct(node) => write!(f, "dm:{}", node),
            Destination::Channel(idx) => write!(f, "channel:{}", idx),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no radio connected")]
    NoDevice,
    #[error("send rejected: {0}")]
    Rejected(String),
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Synchronous "send text to destination". Implementations may block until
/// the radio accepts the packet.
pub trait Transport: Send {
    fn send_text(&mut self, text: &str, destination: &Destination) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_text(&mut self, text: &str, destination: &Destination) -> Result<(), TransportError> {
        (**self).send_text(text, destination)
    }
}

/// Logs each payload at info level and reports success.
#[derive(Debug, Default)]
pub struct ConsoleTransport {
    sent: u64,
}

impl ConsoleTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

impl Transport for ConsoleTransport {
    fn send_text(&mut self, text: &str, destination: &Destination) -> Result<(), TransportError> {
        self.sent += 1;
        info!("[console] -> {} ({} chars): {}", destination, text.chars().count(), preview(text));
        Ok(())
    }
}

/// A decoded text packet as reported by the radio driver.
#[derive(Debug, Clone, Default)]
pub struct InboundText {
    /// Packet id; a UUID is assigned when absent.
    pub message_id: Option<String>,
    /// Sender node id, e.g. `!a1b2c3d4`.
    pub from: String,
    /// Destination node id or a broadcast marker; `None` means broadcast.
    pub to: Option<String>,
    pub channel_index: u32,
    pub channel_name: Option<String>,
    pub text: String,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    /// ISO-8601 receive time; defaults to now.
    pub timestamp: Option<String>,
    /// Packet id this message answers, when the sender used the reply feature.
    pub reply_to_id: Option<String>,
}

/// A telemetry or position report from a node.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    pub from: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub rssi: Option<i32>,
    /// Decoded payload, stored verbatim as `telemetry_json`.
    pub payload: Meta,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    /// ISO-8601 receive time; defaults to now.
    pub timestamp: Option<String>,
}

/// Everything the radio driver hands to the bridge.
#[derive(Debug, Clone)]
pub enum Packet {
    Text(InboundText),
    Telemetry(Telemetry),
}

impl From<InboundText> for Packet {
    fn from(text: InboundText) -> Self {
        Packet::Text(text)
    }
}

impl From<Telemetry> for Packet {
    fn from(report: Telemetry) -> Self {
        Packet::Telemetry(report)
    }
}

impl InboundText {
    /// True when `to` names a single node rather than the broadcast address.
    pub fn is_direct(&self) -> bool {
        match self.to.as_deref().map(str::trim) {
            None | Some("") => false,
            Some(to) => !is_broadcast(to),
        }
    }
}

fn is_broadcast(to: &str) -> bool {
    let lowered = to.to_ascii_lowercase();
    let bare = lowered.trim_start_matches('!');
    matches!(lowered.as_str(), "^all" | "^broadcast")
        || bare == "ffffffff"
        || bare.parse::<u64>().map(|n| n == BROADCAST_NUM as u64).unwrap_or(false)
}
