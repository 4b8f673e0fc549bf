//! # Agent Module - Reply Pipeline
//!
//! The agent scans every thread log under the nodes directory, answers
//! persona control commands on the spot and hands free-text prompts to a
//! single background worker that calls the inference server.
//!
//! ```text
//! scan pass (every poll interval)
//!   reload personas ─▶ sync queue counts ─▶ for each thread log (locked):
//!     inbound, unprocessed, not ignored, not yet answered
//!       ├─ "<trigger> <command>" ─▶ control reply rows, source processed
//!       └─ "<trigger> <prompt>"  ─▶ running? allowed? cooled down? not in flight?
//!                                      └─▶ Task ─▶ worker ─▶ chunked reply rows
//! ```
//!
//! Failed generations leave the source row unprocessed, so the next scan
//! picks it up again.

pub mod chunk;
pub mod commands;
pub mod pipeline;
mod worker;

pub use pipeline::{detect, ControlCommand, PersonaMatch, ReplyKind, ReplySource};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::config::Config;
use crate::inference::{probe, required_models, InferenceBackend, InferenceStatus, SharedStatus};
use crate::logutil::preview;
use crate::metrics;
use crate::persona::PersonaRegistry;
use crate::storage::{RecordStore, StoreError};
use crate::thread::{
    has_reply, synthesize_message_id, Direction, Meta, MessageRecord, NodeLayout, ThreadFile, ThreadLog,
    ThreadType,
};

use commands::run_control;
use pipeline::{build_chunked_replies, build_reply};
use worker::{Task, WorkerHandle};

/// Minimum spacing between inference probes while something is unsettled.
const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// `(thread file, message_id)`
pub(crate) type TaskKey = (PathBuf, String);
/// `(lower-cased persona name, thread type, thread key)`
type CooldownKey = (String, ThreadType, String);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the scan loop and the worker.
pub(crate) struct AgentState {
    pub config: Config,
    pub log: ThreadLog,
    pub registry: Mutex<PersonaRegistry>,
    pub inflight: Mutex<HashSet<TaskKey>>,
    /// Pending tasks per lower-cased persona name.
    pub queue_counts: Mutex<HashMap<String, u64>>,
    pub cooldowns: Mutex<HashMap<CooldownKey, Instant>>,
    pub status: SharedStatus,
}

impl AgentState {
    /// Models the `status` command reports on. Empty when no server is configured.
    pub fn required_for(&self, persona_model: Option<&str>) -> BTreeSet<String> {
        if self.config.ollama.base_url.trim().is_empty() {
            return BTreeSet::new();
        }
        required_models(&self.config.ollama, persona_model)
    }

    fn cooldown_active(&self, key: &CooldownKey, cooldown: Duration) -> bool {
        if cooldown.is_zero() {
            return false;
        }
        lock(&self.cooldowns)
            .get(key)
            .map(|last| last.elapsed() < cooldown)
            .unwrap_or(false)
    }

    /// Change a persona's pending count and mirror it into its file.
    pub fn adjust_queue(&self, persona: &str, delta: i64) {
        let key = persona.to_lowercase();
        let value = {
            let mut counts = lock(&self.queue_counts);
            let entry = counts.entry(key).or_insert(0);
            *entry = if delta < 0 {
                entry.saturating_sub(delta.unsigned_abs())
            } else {
                entry.saturating_add(delta as u64)
            };
            *entry
        };
        let mut registry = lock(&self.registry);
        if let Some(p) = registry.get_by_name_mut(persona) {
            if p.runtime.queue_count != value {
                p.runtime.queue_count = value;
                if let Err(e) = p.write_runtime() {
                    warn!("Failed to persist queue count for {}: {}", p.name, e);
                }
            }
        }
    }

    /// Drop counts for vanished personas and write any count that drifted
    /// from the file.
    fn sync_queue_counts(&self) {
        let mut registry = lock(&self.registry);
        let mut counts = lock(&self.queue_counts);
        let known: HashSet<String> = registry.all().map(|p| p.name.to_lowercase()).collect();
        counts.retain(|name, _| known.contains(name));
        for name in known {
            let value = counts.get(&name).copied().unwrap_or(0);
            if let Some(p) = registry.get_by_name_mut(&name) {
                if p.runtime.queue_count != value {
                    p.runtime.queue_count = value;
                    if let Err(e) = p.write_runtime() {
                        warn!("Failed to persist queue count for {}: {}", p.name, e);
                    }
                }
            }
        }
    }

    /// Bookkeeping after the worker is done with a task, whatever the outcome.
    pub fn finish_task(&self, task: &Task, success: bool) {
        lock(&self.inflight).remove(&task.key);
        self.adjust_queue(&task.persona.name, -1);
        if success {
            lock(&self.cooldowns).insert(task.cooldown_key(), Instant::now());
        }
    }
}

/// What one scan pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub files: usize,
    /// Files skipped because of lock timeouts or IO errors.
    pub skipped_files: usize,
    pub control_replies: usize,
    pub enqueued: usize,
}

impl ScanReport {
    fn absorb(&mut self, other: ScanReport) {
        self.files += other.files;
        self.skipped_files += other.skipped_files;
        self.control_replies += other.control_replies;
        self.enqueued += other.enqueued;
    }
}

/// Requests a running [`Agent::run`] loop to stop.
#[derive(Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

pub struct Agent {
    state: Arc<AgentState>,
    layout: NodeLayout,
    backend: Arc<dyn InferenceBackend>,
    worker: Option<WorkerHandle>,
    last_probe: Option<Instant>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl Agent {
    pub fn new(config: Config, backend: Arc<dyn InferenceBackend>) -> Self {
        let lock_options = config.lock.options();
        let registry = PersonaRegistry::new(config.personas_dir(), &config.ai.default_persona, lock_options)
            .with_default_timezone(&config.general.timezone);
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            layout: NodeLayout::new(config.nodes_base()),
            state: Arc::new(AgentState {
                log: ThreadLog::new(RecordStore::new(lock_options)),
                registry: Mutex::new(registry),
                inflight: Mutex::new(HashSet::new()),
                queue_counts: Mutex::new(HashMap::new()),
                cooldowns: Mutex::new(HashMap::new()),
                status: Arc::new(Mutex::new(InferenceStatus::default())),
                config,
            }),
            backend,
            worker: None,
            last_probe: None,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        }
    }

    pub fn config(&self) -> &Config {
        &self.state.config
    }

    pub fn inference_status(&self) -> SharedStatus {
        Arc::clone(&self.state.status)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop_tx))
    }

    /// Tasks queued or being generated.
    pub fn inflight_len(&self) -> usize {
        lock(&self.state.inflight).len()
    }

    pub fn queue_count(&self, persona: &str) -> u64 {
        lock(&self.state.queue_counts)
            .get(&persona.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    /// Spawn the reply worker if it is not running. Must be called from
    /// within a Tokio runtime.
    pub fn start_worker(&mut self) {
        if let Some(worker) = &self.worker {
            if !worker.is_finished() {
                return;
            }
            error!("Reply worker exited unexpectedly; restarting with a fresh queue");
            lock(&self.state.inflight).clear();
            lock(&self.state.queue_counts).clear();
        }
        self.worker = Some(worker::spawn(Arc::clone(&self.state), Arc::clone(&self.backend)));
    }

    /// Probe the inference server when connectivity or a required model is
    /// unsettled, at most once per [`PROBE_INTERVAL`].
    pub async fn refresh_inference_status(&mut self) {
        let required = {
            let registry = lock(&self.state.registry);
            let mut set = self.state.required_for(None);
            for p in registry.all() {
                set.extend(self.state.required_for(p.model.as_deref()));
            }
            set
        };
        if required.is_empty() || !lock(&self.state.status).needs_probe(&required) {
            return;
        }
        if self.last_probe.map(|t| t.elapsed() < PROBE_INTERVAL).unwrap_or(false) {
            return;
        }
        self.last_probe = Some(Instant::now());
        let (connected, statuses) = probe(self.backend.as_ref(), &required).await;
        lock(&self.state.status).apply_probe(connected, &statuses);
        debug!("Inference probe: connected={} models={:?}", connected, statuses);
    }

    /// One pass over every thread log. Per-file failures are logged and
    /// counted; the pass continues with the next file.
    pub fn scan_once(&mut self) -> ScanReport {
        lock(&self.state.registry).reload();
        self.state.sync_queue_counts();

        let mut report = ScanReport::default();
        for file in self.layout.all_thread_files() {
            report.files += 1;
            match self.scan_file(&file) {
                Ok(r) => report.absorb(r),
                Err(e) => {
                    if e.is_lock_timeout() {
                        metrics::inc_lock_timeouts();
                    }
                    warn!("Skipping {} this pass: {}", file.path.display(), e);
                    report.skipped_files += 1;
                }
            }
        }
        if report.control_replies + report.enqueued > 0 {
            info!(
                "Scan pass: {} files, {} control replies, {} prompts queued",
                report.files, report.control_replies, report.enqueued
            );
        }
        report
    }

    fn scan_file(&self, file: &ThreadFile) -> Result<ScanReport, StoreError> {
        let stem = file.stem();
        let ignore = &self.state.config.ai.ignore_channel_indexes;
        self.state.log.update(&file.path, |rows: &mut Vec<MessageRecord>| {
            let mut report = ScanReport::default();
            let mut changed = false;
            let mut appended = Vec::new();
            // ids answered or queued earlier in this pass; `appended` is not in `rows` yet
            let mut claimed: HashSet<String> = HashSet::new();

            for idx in 0..rows.len() {
                let row = &rows[idx];
                if row.direction != Direction::Inbound || row.processed {
                    continue;
                }
                let thread_type = row.thread_type.unwrap_or(file.thread_type);
                let channel_index = match thread_type {
                    ThreadType::Channel => row.meta.channel_index(),
                    ThreadType::Dm => None,
                };
                if channel_index.map(|i| ignore.contains(&i)).unwrap_or(false) {
                    continue;
                }
                let synthesized = row.message_id.trim().is_empty();
                let message_id = if synthesized {
                    synthesize_message_id(&stem, idx, row)
                } else {
                    row.message_id.clone()
                };
                if claimed.contains(&message_id) || has_reply(rows, &message_id) {
                    continue;
                }
                let content = row.content.clone();
                let sender_id = row.sender_id.clone();
                let source = ReplySource::from_row(row, file.thread_type, &stem, &message_id);

                let detected = detect(&lock(&self.state.registry), &content);
                let Some(found) = detected else {
                    continue;
                };

                match found.command {
                    Some(command) => match self.control_replies(&found, command, &source) {
                        Ok(replies) => {
                            claimed.insert(message_id.clone());
                            rows[idx].processed = true;
                            if synthesized {
                                rows[idx].message_id = message_id;
                            }
                            appended.extend(replies);
                            changed = true;
                            report.control_replies += 1;
                        }
                        Err(e) => {
                            if e.is_lock_timeout() {
                                metrics::inc_lock_timeouts();
                            }
                            warn!("Control command '{}' for {} failed: {}", command, found.persona, e);
                        }
                    },
                    None => {
                        let prompt = found.prompt(&content).to_string();
                        if prompt.is_empty() {
                            continue;
                        }
                        let task = self.prepare_task(&file.path, &found, source, sender_id, prompt, channel_index);
                        if let Some(task) = task {
                            if self.enqueue(task) {
                                claimed.insert(message_id.clone());
                                if synthesized {
                                    rows[idx].message_id = message_id;
                                    changed = true;
                                }
                                report.enqueued += 1;
                            }
                        }
                    }
                }
            }

            rows.extend(appended);
            Ok::<_, StoreError>((changed, report))
        })
    }

    fn control_replies(
        &self,
        found: &PersonaMatch,
        command: ControlCommand,
        source: &ReplySource,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let (name, texts) = {
            let mut registry = lock(&self.state.registry);
            let Some(persona) = registry.get_by_name_mut(&found.persona) else {
                return Ok(Vec::new());
            };
            let required = self.state.required_for(persona.model.as_deref());
            let inference_line = lock(&self.state.status).status_line(&required);
            let texts = run_control(
                persona,
                command,
                &found.trigger,
                &inference_line,
                self.state.config.ai.max_message_chars,
                Utc::now(),
            )?;
            (persona.name.clone(), texts)
        };

        let mut extra = Meta::new();
        extra.insert("control_command", command.as_str());
        let rows = if command == ControlCommand::Config {
            build_chunked_replies(source, &name, &found.trigger, ReplyKind::Control, &texts, &extra)
        } else {
            texts
                .iter()
                .map(|text| build_reply(source, &name, &found.trigger, ReplyKind::Control, text, &extra))
                .collect()
        };
        Ok(rows)
    }

    /// Apply the running, channel and cooldown gates.
    fn prepare_task(
        &self,
        path: &std::path::Path,
        found: &PersonaMatch,
        source: ReplySource,
        sender_id: String,
        prompt: String,
        channel_index: Option<i64>,
    ) -> Option<Task> {
        let (running, snapshot) = {
            let registry = lock(&self.state.registry);
            let persona = registry.get_by_name(&found.persona)?;
            (persona.runtime.running, persona.snapshot())
        };
        if !running {
            debug!("Persona {} is stopped; leaving {} unanswered", snapshot.name, source.message_id);
            return None;
        }
        if !snapshot.allows_channel(channel_index) {
            debug!("Persona {} does not answer on channel {:?}", snapshot.name, channel_index);
            return None;
        }
        let cooldown = if snapshot.cooldown_seconds > 0 {
            snapshot.cooldown_seconds
        } else {
            self.state.config.ai.reply_cooldown_seconds
        };
        let task = Task {
            key: (path.to_path_buf(), source.message_id.clone()),
            thread_path: path.to_path_buf(),
            source,
            sender_id,
            prompt,
            trigger: found.trigger.clone(),
            persona: snapshot,
            enqueued_at: Instant::now(),
        };
        if self.state.cooldown_active(&task.cooldown_key(), Duration::from_secs(cooldown)) {
            debug!(
                "Persona {} cooling down in {}:{}",
                task.persona.name, task.source.thread_type, task.source.thread_key
            );
            return None;
        }
        Some(task)
    }

    /// Hand a task to the worker unless the same message is already in flight.
    fn enqueue(&self, task: Task) -> bool {
        let Some(worker) = self.worker.as_ref() else {
            debug!("Reply worker not running; deferring {}", task.source.message_id);
            return false;
        };
        if !lock(&self.state.inflight).insert(task.key.clone()) {
            return false;
        }
        let persona = task.persona.name.clone();
        info!(
            "Queued prompt {} for {} from {}: {}",
            task.source.message_id,
            persona,
            task.sender_id,
            preview(&task.prompt)
        );
        if let Err(task) = worker.submit(task) {
            lock(&self.state.inflight).remove(&task.key);
            warn!("Reply worker queue closed; {} stays pending", task.source.message_id);
            return false;
        }
        self.state.adjust_queue(&persona, 1);
        true
    }

    /// Wait until no task is in flight. Returns false on timeout or when the
    /// worker is gone.
    pub async fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let started = Instant::now();
        loop {
            if self.inflight_len() == 0 {
                return true;
            }
            if self.worker.as_ref().map(|w| w.is_finished()).unwrap_or(true) {
                return false;
            }
            if timeout.map(|t| started.elapsed() >= t).unwrap_or(false) {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Close the worker queue and wait for the worker to drain it. With a
    /// timeout, a worker still busy afterwards is aborted.
    pub async fn shutdown(&mut self, timeout: Option<Duration>) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown(timeout).await;
        }
    }

    /// Scan every poll interval until Ctrl+C or [`StopHandle::stop`]. With
    /// `once`, run a single pass and wait for its queued prompts.
    pub async fn run(mut self, once: bool) -> Result<()> {
        info!(
            "Agent watching {} (personas in {})",
            self.layout.nodes_base().display(),
            self.state.config.personas_dir().display()
        );
        self.start_worker();

        if once {
            self.refresh_inference_status().await;
            self.scan_once();
            self.wait_idle(None).await;
            self.shutdown(None).await;
            return Ok(());
        }

        let poll = Duration::from_millis(self.state.config.ai.poll_interval_ms.max(10));
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut stop = self.stop_rx.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.start_worker();
                    self.refresh_inference_status().await;
                    self.scan_once();
                }
                _ = stop.changed() => {
                    info!("Stop requested, shutting down agent");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down agent");
                    break;
                }
            }
        }

        let join_timeout = Duration::from_secs(self.state.config.ai.worker_join_timeout_seconds);
        self.shutdown(Some(join_timeout)).await;
        info!("Agent metrics: {}", metrics::snapshot());
        Ok(())
    }
}
