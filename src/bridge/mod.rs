//! # Bridge Module - Radio Side of the Mailbox
//!
//! The bridge owns one node namespace (`<nodes_base>/<node_uid>`). It records
//! every inbound text packet into the matching thread log and every
//! telemetry report into `sightings.csv`, keeps the node registry current,
//! and drains queued replies through the [`OutboundDispatcher`].
//!
//! ```text
//! radio ──Packet::Text──▶ record_inbound ──▶ threads/{channels,dms}/<key>.csv
//!                                                   │ (agent appends queued rows)
//! radio ◀──Transport── OutboundDispatcher ◀────────┘
//! ```

pub mod dispatch;

pub use dispatch::{BackoffPolicy, FlushReport, OutboundDispatcher};

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::logutil::preview;
use crate::meshtastic::{InboundText, Packet, Telemetry, Transport};
use crate::metrics;
use crate::storage::{Record, RecordStore, StoreError};
use crate::thread::{iso_now, Direction, MessageRecord, NodeLayout, ThreadLog, ThreadType};

pub const NODES_SCHEMA: [&str; 5] = ["node_id", "short_name", "long_name", "first_seen_at", "last_seen_at"];

pub const SIGHTINGS_SCHEMA: [&str; 7] = [
    "node_id",
    "latitude",
    "longitude",
    "rssi",
    "telemetry_json",
    "observed_at",
    "sighting_hash",
];

/// Result of [`Bridge::record_sighting`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SightingOutcome {
    Recorded { sighting_hash: String },
    /// Same node reported the same readings earlier that day.
    Duplicate { sighting_hash: String },
}

/// Result of [`Bridge::record_inbound`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Recorded { path: PathBuf, message_id: String },
    Duplicate { path: PathBuf, message_id: String },
}

pub struct Bridge<T: Transport> {
    layout: NodeLayout,
    node_uid: String,
    store: RecordStore,
    log: ThreadLog,
    dispatcher: OutboundDispatcher<T>,
    poll_interval: Duration,
}

impl<T: Transport> Bridge<T> {
    pub fn new(config: &Config, transport: T) -> Self {
        let store = RecordStore::new(config.lock.options());
        let log = ThreadLog::new(store.clone());
        let policy = BackoffPolicy {
            max_attempts: config.bridge.max_send_attempts.max(1),
            base: Duration::from_secs(config.bridge.backoff_base_seconds),
            cap: Duration::from_secs(config.bridge.backoff_cap_seconds),
        };
        Self {
            layout: NodeLayout::new(config.nodes_base()),
            node_uid: config.bridge.node_uid.clone(),
            dispatcher: OutboundDispatcher::new(log.clone(), policy, transport),
            store,
            log,
            poll_interval: Duration::from_millis(config.bridge.poll_interval_ms.max(10)),
        }
    }

    pub fn node_dir(&self) -> PathBuf {
        self.layout.node_dir(&self.node_uid)
    }

    pub fn dispatcher(&self) -> &OutboundDispatcher<T> {
        &self.dispatcher
    }

    /// Create the thread directories and the node registry.
    pub fn ensure_node_paths(&self) -> Result<(), StoreError> {
        for t in [ThreadType::Channel, ThreadType::Dm] {
            std::fs::create_dir_all(self.layout.threads_dir(&self.node_uid, t))?;
        }
        self.store
            .ensure(&self.layout.nodes_registry(&self.node_uid), &NODES_SCHEMA)?;
        self.store
            .ensure(&self.layout.sightings_log(&self.node_uid), &SIGHTINGS_SCHEMA)?;
        info!("Initialized node directories at {}", self.node_dir().display());
        Ok(())
    }

    /// Append an inbound row for `packet` unless the log already has it.
    pub fn record_inbound(&self, packet: &InboundText) -> Result<InboundOutcome, StoreError> {
        let (thread_type, thread_key) = derive_thread(packet);
        let path = self.layout.thread_path(&self.node_uid, thread_type, &thread_key);

        let mut row = MessageRecord::new(thread_type, &thread_key, Direction::Inbound);
        row.message_id = packet
            .message_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        row.sender_id = packet.from.clone();
        row.reply_to_id = packet
            .reply_to_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        row.content = packet.text.clone();
        if let Some(ts) = packet.timestamp.as_deref().filter(|t| !t.trim().is_empty()) {
            row.timestamp = ts.to_string();
        }
        row.meta.insert("channel_index", packet.channel_index);
        if let Some(name) = packet.channel_name.as_deref().filter(|n| !n.is_empty()) {
            row.meta.insert("channel_name", name);
        }

        let recorded = self.log.update(&path, |rows: &mut Vec<MessageRecord>| {
            let duplicate = rows.iter().any(|r| {
                r.message_id == row.message_id
                    || (r.direction == Direction::Inbound
                        && r.sender_id == row.sender_id
                        && r.timestamp == row.timestamp
                        && r.content == row.content)
            });
            if duplicate {
                return Ok::<_, StoreError>((false, false));
            }
            rows.push(row.clone());
            Ok((true, true))
        })?;
        if !recorded {
            metrics::inc_inbound_duplicates();
            debug!("Duplicate inbound {} in {}", row.message_id, path.display());
            return Ok(InboundOutcome::Duplicate {
                path,
                message_id: row.message_id,
            });
        }
        metrics::inc_inbound_recorded();
        info!(
            "Recorded inbound message {} ({}:{}) from {}: {}",
            row.message_id,
            thread_type,
            thread_key,
            row.sender_id,
            preview(&row.content)
        );
        if let Err(e) = self.upsert_node(&packet.from, packet.short_name.as_deref(), packet.long_name.as_deref()) {
            warn!("Failed to update node registry for {}: {}", packet.from, e);
        }
        Ok(InboundOutcome::Recorded {
            path,
            message_id: row.message_id,
        })
    }

    /// Append a sighting unless this node already reported identical
    /// readings on the same UTC day, then refresh the node registry.
    pub fn record_sighting(&self, report: &Telemetry) -> Result<SightingOutcome, StoreError> {
        let node_id = report.from.trim().to_string();
        let telemetry_json = report.payload.encode();
        let sighting_hash = sighting_hash(report, &telemetry_json);
        let observed_at = report
            .timestamp
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(iso_now);
        let day = observed_at.split('T').next().unwrap_or_default().to_string();
        let optional = |v: Option<String>| v.unwrap_or_default();

        let path = self.layout.sightings_log(&self.node_uid);
        let recorded = self.store.update(&path, &SIGHTINGS_SCHEMA, |rows: &mut Vec<Record>| {
            let field = |r: &Record, k: &str| r.get(k).cloned().unwrap_or_default();
            let seen_today = rows.iter().rev().any(|r| {
                field(r, "node_id") == node_id
                    && field(r, "sighting_hash") == sighting_hash
                    && field(r, "observed_at").split('T').next() == Some(day.as_str())
            });
            if seen_today {
                return Ok::<_, StoreError>((false, false));
            }
            let mut row = Record::new();
            row.insert("node_id".into(), node_id.clone());
            row.insert("latitude".into(), optional(report.latitude.map(|v| v.to_string())));
            row.insert("longitude".into(), optional(report.longitude.map(|v| v.to_string())));
            row.insert("rssi".into(), optional(report.rssi.map(|v| v.to_string())));
            row.insert("telemetry_json".into(), telemetry_json.clone());
            row.insert("observed_at".into(), observed_at.clone());
            row.insert("sighting_hash".into(), sighting_hash.clone());
            rows.push(row);
            Ok((true, true))
        })?;
        if !recorded {
            debug!("Sighting {} for {} already stored today", sighting_hash, node_id);
            return Ok(SightingOutcome::Duplicate { sighting_hash });
        }
        info!("Stored sighting for node {}", node_id);
        if let Err(e) = self.upsert_node(&node_id, report.short_name.as_deref(), report.long_name.as_deref()) {
            warn!("Failed to update node registry for {}: {}", node_id, e);
        }
        Ok(SightingOutcome::Recorded { sighting_hash })
    }

    /// Insert or refresh a node registry row; names only overwrite when given.
    pub fn upsert_node(&self, node_id: &str, short_name: Option<&str>, long_name: Option<&str>) -> Result<(), StoreError> {
        let node_id = node_id.trim();
        if node_id.is_empty() {
            return Ok(());
        }
        let path = self.layout.nodes_registry(&self.node_uid);
        let now = iso_now();
        self.store.update(&path, &NODES_SCHEMA, |rows: &mut Vec<Record>| {
            let set_name = |row: &mut Record, column: &str, value: Option<&str>| {
                if let Some(v) = value.filter(|v| !v.is_empty()) {
                    row.insert(column.to_string(), v.to_string());
                }
            };
            match rows.iter_mut().find(|r| r.get("node_id").map(String::as_str) == Some(node_id)) {
                Some(row) => {
                    row.insert("last_seen_at".into(), now.clone());
                    set_name(row, "short_name", short_name);
                    set_name(row, "long_name", long_name);
                }
                None => {
                    let mut row = Record::new();
                    row.insert("node_id".into(), node_id.to_string());
                    row.insert("short_name".into(), short_name.unwrap_or_default().to_string());
                    row.insert("long_name".into(), long_name.unwrap_or_default().to_string());
                    row.insert("first_seen_at".into(), now.clone());
                    row.insert("last_seen_at".into(), now.clone());
                    rows.push(row);
                }
            }
            Ok::<_, StoreError>((true, ()))
        })
    }

    /// One outbound pass over this node's thread logs.
    pub fn flush_outbound(&mut self) -> FlushReport {
        let node_dir = self.node_dir();
        let report = self.dispatcher.flush_node(&node_dir);
        if report.sent + report.failed > 0 {
            info!(
                "Outbound pass: {} sent, {} failed ({} abandoned), {} deferred",
                report.sent, report.failed, report.abandoned, report.deferred
            );
        }
        report
    }

    /// Record packets as they arrive and flush the outbound queue every poll
    /// interval until Ctrl+C, or after one pass when `once` is set.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<Packet>, once: bool) -> Result<()> {
        self.ensure_node_paths()?;
        if once {
            while let Ok(packet) = inbound.try_recv() {
                self.handle_packet(&packet);
            }
            self.flush_outbound();
            return Ok(());
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut inbound_open = true;
        loop {
            tokio::select! {
                maybe = inbound.recv(), if inbound_open => {
                    match maybe {
                        Some(packet) => self.handle_packet(&packet),
                        None => {
                            debug!("Inbound channel closed");
                            inbound_open = false;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.flush_outbound();
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down bridge");
                    break;
                }
            }
        }
        info!("Bridge metrics: {}", metrics::snapshot());
        Ok(())
    }

    fn handle_packet(&self, packet: &Packet) {
        let (from, result) = match packet {
            Packet::Text(text) => (&text.from, self.record_inbound(text).map(drop)),
            Packet::Telemetry(report) => (&report.from, self.record_sighting(report).map(drop)),
        };
        if let Err(e) = result {
            if e.is_lock_timeout() {
                metrics::inc_lock_timeouts();
            }
            warn!("Failed to record packet from {}: {}", from, e);
        }
    }
}

/// UUIDv5 (OID namespace) over the readings that make two reports the same.
fn sighting_hash(report: &Telemetry, telemetry_json: &str) -> String {
    let readings = serde_json::json!({
        "latitude": report.latitude,
        "longitude": report.longitude,
        "rssi": report.rssi,
        "telemetry_json": telemetry_json,
    });
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, readings.to_string().as_bytes()).to_string()
}

/// Thread identity of a packet: DMs keyed by sender, named channels by name,
/// anything else by `channel_<index>`.
pub fn derive_thread(packet: &InboundText) -> (ThreadType, String) {
    if packet.is_direct() {
        let key = if packet.from.trim().is_empty() {
            packet.to.clone().unwrap_or_default()
        } else {
            packet.from.clone()
        };
        return (ThreadType::Dm, key);
    }
    match packet.channel_name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => (ThreadType::Channel, name.to_string()),
        None => (ThreadType::Channel, format!("channel_{}", packet.channel_index)),
    }
}

/// Packet receive time (epoch seconds) as an ISO-8601 UTC string.
pub fn timestamp_from_epoch(secs: f64) -> String {
    let millis = (secs * 1000.0) as i64;
    let ts: DateTime<Utc> = Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now);
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}
