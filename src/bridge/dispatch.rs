//! Outbound dispatcher: moves `queued` rows onto the radio.
//!
//! Each pass walks the node's thread logs. For every queued row below the
//! attempt cap whose backoff deadline has passed, the payload goes to the
//! [`Transport`]. The whole log is rewritten once per pass under its lock.
//!
//! ```text
//! queued ──send ok──▶ outbound (send_status = sent, meta.sent_at)
//!    │
//!    └──send err──▶ queued (send_status = failed, meta.next_attempt_ts)
//!                      └─ attempts == cap ─▶ left in place, never retried
//! ```

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::meshtastic::{Destination, Transport, TransportError};
use crate::metrics;
use crate::storage::StoreError;
use crate::thread::{iso_now, Direction, MessageRecord, NodeLayout, ThreadLog, ThreadType};

pub const NEXT_ATTEMPT_KEY: &str = "next_attempt_ts";
pub const SENT_AT_KEY: &str = "sent_at";

/// Retry schedule: `min(cap, base * 2^(attempts-1))` after each failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next try, given the attempt count after a failure.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base.checked_mul(factor).unwrap_or(self.cap).min(self.cap)
    }
}

/// What one pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub failed: usize,
    /// Failures that used up the last attempt.
    pub abandoned: usize,
    /// Rows still waiting for their backoff deadline.
    pub deferred: usize,
    /// Logs skipped because their lock could not be taken.
    pub skipped_files: usize,
}

impl FlushReport {
    fn absorb(&mut self, other: FlushReport) {
        self.sent += other.sent;
        self.failed += other.failed;
        self.abandoned += other.abandoned;
        self.deferred += other.deferred;
        self.skipped_files += other.skipped_files;
    }
}

pub struct OutboundDispatcher<T: Transport> {
    log: ThreadLog,
    policy: BackoffPolicy,
    transport: T,
}

impl<T: Transport> OutboundDispatcher<T> {
    pub fn new(log: ThreadLog, policy: BackoffPolicy, transport: T) -> Self {
        Self { log, policy, transport }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// One pass over every thread log of `node_dir`. Per-file failures are
    /// logged and the pass continues.
    pub fn flush_node(&mut self, node_dir: &Path) -> FlushReport {
        let mut report = FlushReport::default();
        for file in NodeLayout::thread_files(node_dir) {
            match self.flush_file(&file.path, file.thread_type, Utc::now()) {
                Ok(r) => report.absorb(r),
                Err(e) => {
                    if e.is_lock_timeout() {
                        metrics::inc_lock_timeouts();
                    }
                    warn!("Skipping outbound flush for {}: {}", file.path.display(), e);
                    report.skipped_files += 1;
                }
            }
        }
        report
    }

    /// Flush one log as of `now`. `fallback_type` applies to rows whose
    /// `thread_type` column is empty.
    pub fn flush_file(
        &mut self,
        path: &Path,
        fallback_type: ThreadType,
        now: DateTime<Utc>,
    ) -> Result<FlushReport, StoreError> {
        let now_ts = now.timestamp_millis() as f64 / 1000.0;
        let policy = self.policy;
        let transport = &mut self.transport;
        self.log.update(path, |rows: &mut Vec<MessageRecord>| {
            let mut report = FlushReport::default();
            let mut changed = false;
            for row in rows.iter_mut() {
                if row.direction != Direction::Queued || row.send_attempts >= policy.max_attempts {
                    continue;
                }
                if let Some(deadline) = row.meta.get_f64(NEXT_ATTEMPT_KEY) {
                    if deadline > now_ts {
                        report.deferred += 1;
                        continue;
                    }
                }
                let outcome = destination_for(row, fallback_type)
                    .and_then(|dest| transport.send_text(&row.content, &dest).map(|_| dest));
                row.send_attempts += 1;
                changed = true;
                match outcome {
                    Ok(dest) => {
                        row.direction = Direction::Outbound;
                        row.send_status = "sent".to_string();
                        row.meta.remove(NEXT_ATTEMPT_KEY);
                        row.meta.insert(SENT_AT_KEY, iso_now());
                        report.sent += 1;
                        metrics::inc_outbound_sent();
                        info!("Sent queued message {} to {}", row.message_id, dest);
                    }
                    Err(e) => {
                        row.send_status = "failed".to_string();
                        let delay = policy.delay_after(row.send_attempts);
                        row.meta.insert(NEXT_ATTEMPT_KEY, now_ts + delay.as_secs_f64());
                        report.failed += 1;
                        metrics::inc_outbound_failed();
                        if row.send_attempts >= policy.max_attempts {
                            report.abandoned += 1;
                            metrics::inc_outbound_abandoned();
                            warn!(
                                "Giving up on message {} after {} attempts: {}",
                                row.message_id, row.send_attempts, e
                            );
                        } else {
                            warn!(
                                "Send of message {} failed (attempt {}/{}), retry in {:?}: {}",
                                row.message_id, row.send_attempts, policy.max_attempts, delay, e
                            );
                        }
                    }
                }
            }
            if !changed {
                debug!("No sendable rows in {}", path.display());
            }
            Ok::<_, StoreError>((changed, report))
        })
    }
}

/// DMs go to the thread key; channel rows to `meta.channel_index` (default 0).
pub fn destination_for(row: &MessageRecord, fallback_type: ThreadType) -> Result<Destination, TransportError> {
    match row.thread_type.unwrap_or(fallback_type) {
        ThreadType::Dm => {
            let key = row.thread_key.trim();
            if key.is_empty() {
                Err(TransportError::Rejected("missing thread_key for DM send".to_string()))
            } else {
                Ok(Destination::Direct(key.to_string()))
            }
        }
        ThreadType::Channel => {
            let index = row.meta.channel_index().unwrap_or(0);
            u32::try_from(index)
                .map(Destination::Channel)
                .map_err(|_| TransportError::Rejected(format!("invalid channel index {}", index)))
        }
    }
}
