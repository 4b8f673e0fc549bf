//! Process-wide counters. Each process (agent or bridge) only moves the
//! counters for the work it does; `snapshot()` reads them all.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

static OUTBOUND_SENT: AtomicU64 = AtomicU64::new(0);
static OUTBOUND_FAILED: AtomicU64 = AtomicU64::new(0);
static OUTBOUND_ABANDONED: AtomicU64 = AtomicU64::new(0);
static INBOUND_RECORDED: AtomicU64 = AtomicU64::new(0);
static INBOUND_DUPLICATES: AtomicU64 = AtomicU64::new(0);
static CONTROL_REPLIES: AtomicU64 = AtomicU64::new(0);
static GENERATED_REPLIES: AtomicU64 = AtomicU64::new(0);
static INFERENCE_FAILURES: AtomicU64 = AtomicU64::new(0);
static LOCK_TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static GENERATION_MS_SUM: AtomicU64 = AtomicU64::new(0);
static GENERATION_COUNT: AtomicU64 = AtomicU64::new(0);

static PERSONA_REPLIES: OnceLock<Mutex<BTreeMap<String, u64>>> = OnceLock::new();

pub fn inc_outbound_sent() {
    OUTBOUND_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_outbound_failed() {
    OUTBOUND_FAILED.fetch_add(1, Ordering::Relaxed);
}
/// A row reached the attempt cap on this failure.
pub fn inc_outbound_abandoned() {
    OUTBOUND_ABANDONED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_inbound_recorded() {
    INBOUND_RECORDED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_inbound_duplicates() {
    INBOUND_DUPLICATES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_control_replies() {
    CONTROL_REPLIES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_inference_failures() {
    INFERENCE_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_lock_timeouts() {
    LOCK_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}

/// One successful generation for `persona`, taking `elapsed`.
pub fn record_generation(persona: &str, elapsed: Duration) {
    GENERATED_REPLIES.fetch_add(1, Ordering::Relaxed);
    GENERATION_MS_SUM.fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    GENERATION_COUNT.fetch_add(1, Ordering::Relaxed);
    let mut guard = persona_replies().lock().unwrap_or_else(|e| e.into_inner());
    *guard.entry(persona.to_string()).or_default() += 1;
}

fn persona_replies() -> &'static Mutex<BTreeMap<String, u64>> {
    PERSONA_REPLIES.get_or_init(|| Mutex::new(BTreeMap::new()))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub outbound_sent: u64,
    pub outbound_failed: u64,
    pub outbound_abandoned: u64,
    pub inbound_recorded: u64,
    pub inbound_duplicates: u64,
    pub control_replies: u64,
    pub generated_replies: u64,
    pub inference_failures: u64,
    pub lock_timeouts: u64,
    pub generation_avg_ms: Option<u64>,
    pub replies_by_persona: BTreeMap<String, u64>,
}

pub fn snapshot() -> Snapshot {
    let sum = GENERATION_MS_SUM.load(Ordering::Relaxed);
    let count = GENERATION_COUNT.load(Ordering::Relaxed);
    Snapshot {
        outbound_sent: OUTBOUND_SENT.load(Ordering::Relaxed),
        outbound_failed: OUTBOUND_FAILED.load(Ordering::Relaxed),
        outbound_abandoned: OUTBOUND_ABANDONED.load(Ordering::Relaxed),
        inbound_recorded: INBOUND_RECORDED.load(Ordering::Relaxed),
        inbound_duplicates: INBOUND_DUPLICATES.load(Ordering::Relaxed),
        control_replies: CONTROL_REPLIES.load(Ordering::Relaxed),
        generated_replies: GENERATED_REPLIES.load(Ordering::Relaxed),
        inference_failures: INFERENCE_FAILURES.load(Ordering::Relaxed),
        lock_timeouts: LOCK_TIMEOUTS.load(Ordering::Relaxed),
        generation_avg_ms: if count > 0 { Some(sum / count) } else { None },
        replies_by_persona: persona_replies().lock().unwrap_or_else(|e| e.into_inner()).clone(),
    }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "inbound={} dup={} control={} generated={} inference_fail={} sent={} failed={} abandoned={} lock_timeouts={}",
            self.inbound_recorded,
            self.inbound_duplicates,
            self.control_replies,
            self.generated_replies,
            self.inference_failures,
            self.outbound_sent,
            self.outbound_failed,
            self.outbound_abandoned,
            self.lock_timeouts
        )?;
        if let Some(avg) = self.generation_avg_ms {
            write!(f, " gen_avg_ms={}", avg)?;
        }
        Ok(())
    }
}
