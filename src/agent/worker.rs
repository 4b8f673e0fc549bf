//! The reply worker: one long-lived task that runs generations strictly one
//! at a time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::chunk::{cap_context, chunk_response, chunk_with_markers, strip_reasoning};
use super::pipeline::{build_chunked_replies, ReplyKind, ReplySource};
use super::{lock, AgentState, CooldownKey, TaskKey};
use crate::inference::{model_installed, GenerateRequest, InferenceBackend, InferenceError, ModelStatus};
use crate::logutil::preview;
use crate::metrics;
use crate::persona::PersonaSnapshot;
use crate::storage::StoreError;
use crate::thread::{has_reply, Direction, Meta, MessageRecord, ThreadLog};

/// One prompt waiting for generation. The persona snapshot is taken at
/// enqueue time and never refreshed.
#[derive(Debug, Clone)]
pub(crate) struct Task {
    pub key: TaskKey,
    pub thread_path: PathBuf,
    pub source: ReplySource,
    pub sender_id: String,
    pub prompt: String,
    pub trigger: String,
    pub persona: PersonaSnapshot,
    pub enqueued_at: Instant,
}

impl Task {
    pub fn cooldown_key(&self) -> CooldownKey {
        (
            self.persona.name.to_lowercase(),
            self.source.thread_type,
            self.source.thread_key.clone(),
        )
    }
}

#[derive(Debug, Error)]
enum TaskError {
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("reply write task failed: {0}")]
    Join(String),
}

enum TaskOutcome {
    Replied { chunks: usize },
    /// Persona stopped or removed while the task waited.
    Postponed,
}

#[derive(Default)]
struct WorkerState {
    connected: bool,
    ready_models: HashSet<String>,
}

pub(crate) struct WorkerHandle {
    tx: mpsc::UnboundedSender<Task>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Gives the task back when the worker is gone.
    pub fn submit(&self, task: Task) -> Result<(), Task> {
        self.tx.send(task).map_err(|e| e.0)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn shutdown(self, timeout: Option<Duration>) {
        let WorkerHandle { tx, mut join } = self;
        drop(tx);
        match timeout {
            None => {
                if let Err(e) = join.await {
                    warn!("Reply worker ended abnormally: {}", e);
                }
            }
            Some(limit) => match tokio::time::timeout(limit, &mut join).await {
                Ok(Ok(())) => debug!("Reply worker stopped"),
                Ok(Err(e)) => warn!("Reply worker ended abnormally: {}", e),
                Err(_) => {
                    warn!("Reply worker still busy after {:?}; aborting it", limit);
                    join.abort();
                }
            },
        }
    }
}

pub(crate) fn spawn(state: Arc<AgentState>, backend: Arc<dyn InferenceBackend>) -> WorkerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let join = tokio::spawn(run(state, backend, rx));
    WorkerHandle { tx, join }
}

async fn run(state: Arc<AgentState>, backend: Arc<dyn InferenceBackend>, mut rx: mpsc::UnboundedReceiver<Task>) {
    debug!("Reply worker started");
    let mut worker = WorkerState::default();
    while let Some(task) = rx.recv().await {
        let waited = task.enqueued_at.elapsed();
        let success = match process(&state, backend.as_ref(), &mut worker, &task).await {
            Ok(TaskOutcome::Replied { chunks }) => {
                info!(
                    "Replied to {} as {} in {} part(s) (queued {:?})",
                    task.source.message_id, task.persona.name, chunks, waited
                );
                true
            }
            Ok(TaskOutcome::Postponed) => {
                info!(
                    "Persona {} not running; {} left for a later pass",
                    task.persona.name, task.source.message_id
                );
                false
            }
            Err(e) => {
                metrics::inc_inference_failures();
                if matches!(e, TaskError::Inference(InferenceError::Unavailable(_))) {
                    worker.connected = false;
                    lock(&state.status).set_connected(None);
                }
                warn!("Generation for {} failed: {}", task.source.message_id, e);
                false
            }
        };
        let bookkeeping = Arc::clone(&state);
        if let Err(e) = tokio::task::spawn_blocking(move || bookkeeping.finish_task(&task, success)).await {
            warn!("Task bookkeeping failed: {}", e);
        }
    }
    debug!("Reply worker queue closed");
}

async fn process(
    state: &Arc<AgentState>,
    backend: &dyn InferenceBackend,
    worker: &mut WorkerState,
    task: &Task,
) -> Result<TaskOutcome, TaskError> {
    let running = lock(&state.registry)
        .get_by_name(&task.persona.name)
        .map(|p| p.runtime.running)
        .unwrap_or(false);
    if !running {
        return Ok(TaskOutcome::Postponed);
    }

    if !worker.connected {
        match backend.list_models().await {
            Ok(_) => {
                worker.connected = true;
                lock(&state.status).set_connected(Some(true));
            }
            Err(e) => {
                lock(&state.status).set_connected(Some(false));
                return Err(e.into());
            }
        }
    }

    let config = &state.config;
    let model = task
        .persona
        .model
        .clone()
        .or_else(|| config.ollama.instruct_model().map(str::to_string))
        .ok_or_else(|| InferenceError::ModelUnavailable {
            model: String::new(),
            reason: "no model configured".to_string(),
        })?;
    ensure_model(state, backend, worker, &model).await?;

    let max_context = if task.persona.max_context_chars > 0 {
        task.persona.max_context_chars
    } else {
        config.ai.max_context_chars
    };
    let request = GenerateRequest {
        model: model.clone(),
        prompt: cap_context(&task.prompt, max_context),
        system: Some(task.persona.system_prompt.clone()).filter(|s| !s.is_empty()),
        temperature: task.persona.temperature,
    };
    let started = Instant::now();
    let raw = backend.generate(&request).await?;
    let elapsed = started.elapsed();
    if raw.trim().is_empty() {
        return Err(InferenceError::EmptyResponse.into());
    }
    let text = strip_reasoning(&raw);
    if text.is_empty() {
        return Err(InferenceError::EmptyResponse.into());
    }
    debug!("Model {} answered in {:?}: {}", model, elapsed, preview(&text));

    let limit = if task.persona.max_message_chars > 0 {
        task.persona.max_message_chars
    } else {
        config.ai.max_message_chars
    };
    let chunks = if config.ai.show_chunk_markers {
        chunk_with_markers(&text, limit)
    } else {
        chunk_response(&text, limit)
    };

    let mut extra = Meta::new();
    extra.insert("model", model.as_str());
    extra.insert("duration_ms", elapsed.as_millis() as u64);
    if let Some(t) = task.persona.temperature {
        extra.insert("temperature", t);
    }
    let rows = build_chunked_replies(
        &task.source,
        &task.persona.name,
        &task.trigger,
        ReplyKind::Llm,
        &chunks,
        &extra,
    );
    let count = rows.len();

    let log = state.log.clone();
    let path = task.thread_path.clone();
    let source_id = task.source.message_id.clone();
    tokio::task::spawn_blocking(move || write_replies(&log, &path, &source_id, rows))
        .await
        .map_err(|e| TaskError::Join(e.to_string()))??;

    let counters = Arc::clone(state);
    let persona = task.persona.name.clone();
    tokio::task::spawn_blocking(move || record_call(&counters, &persona))
        .await
        .map_err(|e| TaskError::Join(e.to_string()))?;
    metrics::record_generation(&task.persona.name, elapsed);
    Ok(TaskOutcome::Replied { chunks: count })
}

/// Bump and persist the persona's call counters. Waits on the persona file
/// lock, so it runs on the blocking pool.
fn record_call(state: &AgentState, name: &str) {
    let mut registry = lock(&state.registry);
    match registry.get_by_name_mut(name) {
        Some(persona) => {
            persona.record_call(Utc::now());
            if let Err(e) = persona.write_runtime() {
                warn!("Failed to persist call counters for {}: {}", persona.name, e);
            }
        }
        None => warn!("Persona {} vanished before its counters were updated", name),
    }
}

/// Make sure `model` is installed, pulling it once if the server lacks it.
async fn ensure_model(
    state: &Arc<AgentState>,
    backend: &dyn InferenceBackend,
    worker: &mut WorkerState,
    model: &str,
) -> Result<(), InferenceError> {
    if worker.ready_models.contains(model) {
        return Ok(());
    }
    let installed = backend.list_models().await?;
    if !model_installed(&installed, model) {
        info!("Model {} not installed; pulling", model);
        lock(&state.status).set_model(model, ModelStatus::Downloading);
        if let Err(e) = backend.pull_model(model).await {
            lock(&state.status).set_model(model, ModelStatus::Error);
            return Err(e);
        }
        info!("Model {} is ready", model);
    }
    lock(&state.status).set_model(model, ModelStatus::Available);
    worker.ready_models.insert(model.to_string());
    Ok(())
}

/// Mark the source processed and append the reply rows under one lock. A
/// reply that appeared meanwhile wins and `rows` are dropped.
fn write_replies(log: &ThreadLog, path: &Path, source_id: &str, rows: Vec<MessageRecord>) -> Result<(), StoreError> {
    log.update(path, |records: &mut Vec<MessageRecord>| {
        let already_answered = has_reply(records, source_id);
        let mut found = false;
        for r in records.iter_mut() {
            if r.direction == Direction::Inbound && r.message_id == source_id && !r.processed {
                r.processed = true;
                found = true;
            }
        }
        if already_answered {
            warn!("Message {} was answered meanwhile; dropping generated reply", source_id);
            return Ok::<_, StoreError>((found, ()));
        }
        if !found {
            warn!("Source message {} not found in {}; appending reply anyway", source_id, path.display());
        }
        records.extend(rows);
        Ok((true, ()))
    })
}
