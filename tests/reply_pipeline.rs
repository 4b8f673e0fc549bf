//! End-to-end scan passes against a scripted inference backend.

mod common;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use meshllm::agent::Agent;
use meshllm::config::Config;
use meshllm::inference::{GenerateRequest, InferenceBackend, InferenceError, ModelStatus};
use meshllm::storage::{FileLock, RecordStore};
use meshllm::thread::{Direction, MessageRecord, ThreadLog, ThreadType};
use tempfile::tempdir;

use common::{inbound, test_config, thread_path, write_persona};

const MODEL: &str = "qwen3-4b-q8-instruct";
const LIBRARIAN: &str = "triggers = [\"librarian\"]\nsystem_prompt = \"Be brief.\"\n";
const RUNNING_LIBRARIAN: &str = "triggers = [\"librarian\"]\nsystem_prompt = \"Be brief.\"\nrunning = true\n";

/// Answers from a script ("ok" once it runs dry) and records every call.
#[derive(Default)]
struct ScriptedBackend {
    installed: Mutex<Vec<String>>,
    responses: Mutex<VecDeque<Result<String, InferenceError>>>,
    requests: Mutex<Vec<GenerateRequest>>,
    pulls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn with_models(models: &[&str]) -> Arc<Self> {
        let backend = Self::default();
        *backend.installed.lock().unwrap() = models.iter().map(|m| m.to_string()).collect();
        Arc::new(backend)
    }

    fn respond(&self, response: Result<String, InferenceError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        Ok(self.installed.lock().unwrap().clone())
    }

    async fn pull_model(&self, model: &str) -> Result<(), InferenceError> {
        self.pulls.lock().unwrap().push(model.to_string());
        self.installed.lock().unwrap().push(format!("{}:latest", model));
        Ok(())
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, InferenceError> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("ok".to_string()))
    }
}

fn config(root: &std::path::Path) -> Config {
    let mut config = test_config(root);
    config.ai.reply_cooldown_seconds = 0;
    config
}

fn log(config: &Config) -> ThreadLog {
    ThreadLog::new(RecordStore::new(config.lock.options()))
}

fn replies_to<'a>(rows: &'a [MessageRecord], id: &str) -> Vec<&'a MessageRecord> {
    rows.iter()
        .filter(|r| r.reply_to_id.as_deref() == Some(id))
        .collect()
}

fn source<'a>(rows: &'a [MessageRecord], id: &str) -> &'a MessageRecord {
    rows.iter()
        .find(|r| r.direction == Direction::Inbound && r.message_id == id)
        .unwrap()
}

#[test]
fn test_status_command_answers_once() {
    let tmp = tempdir().unwrap();
    let config = config(tmp.path());
    write_persona(&config, "librarian", LIBRARIAN);
    let path = thread_path(&config, ThreadType::Channel, "mesh");
    let log = log(&config);
    log.append(&path, &inbound(ThreadType::Channel, "mesh", "3001", "!a", "librarian status")).unwrap();

    let mut agent = Agent::new(config.clone(), ScriptedBackend::with_models(&[]));
    let report = agent.scan_once();
    assert_eq!(report.control_replies, 1);
    assert_eq!(report.enqueued, 0);

    let rows = log.read_all(&path).unwrap();
    let replies = replies_to(&rows, "3001");
    assert_eq!(replies.len(), 1);
    let reply = replies[0];
    assert_eq!(reply.direction, Direction::Queued);
    assert_eq!(reply.sender_id, "librarian");
    assert_eq!(reply.thread_key, "mesh");
    assert!(reply.content.contains("librarian is stopped"), "{}", reply.content);
    assert!(reply.content.contains("\nOllama: "), "{}", reply.content);
    assert_eq!(reply.meta.get_str("control_command"), Some("status"));
    assert_eq!(reply.meta.get_str("reply_type"), Some("control"));
    assert!(source(&rows, "3001").processed);

    // a second pass sees the processed row and the reply; nothing new
    let report = agent.scan_once();
    assert_eq!(report.control_replies, 0);
    assert_eq!(log.read_all(&path).unwrap().len(), 2);
    assert!(std::fs::read_to_string(config.personas_dir().join("librarian.toml"))
        .unwrap()
        .contains("control_calls = 1"));
}

#[tokio::test]
async fn test_start_then_prompt_produces_chunked_reply() {
    let tmp = tempdir().unwrap();
    let mut config = config(tmp.path());
    config.ai.max_message_chars = 40;
    let persona_path = write_persona(&config, "librarian", LIBRARIAN);
    let path = thread_path(&config, ThreadType::Channel, "mesh");
    let log = log(&config);
    log.append(&path, &inbound(ThreadType::Channel, "mesh", "1", "!a", "librarian start")).unwrap();
    log.append(&path, &inbound(ThreadType::Channel, "mesh", "2", "!a", "Librarian what is a mesh?")).unwrap();

    let backend = ScriptedBackend::with_models(&["qwen3-4b-q8-instruct:latest"]);
    backend.respond(Ok(
        "<think>keep it short</think>A mesh is a network where every radio relays packets for its neighbours.".into(),
    ));
    let mut agent = Agent::new(config.clone(), backend.clone());
    agent.start_worker();
    let report = agent.scan_once();
    assert_eq!((report.control_replies, report.enqueued), (1, 1));
    assert!(agent.wait_idle(Some(Duration::from_secs(10))).await);

    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].model, MODEL);
    assert_eq!(requests[0].prompt, "what is a mesh?");
    assert_eq!(requests[0].system.as_deref(), Some("Be brief."));
    assert!(backend.pulls.lock().unwrap().is_empty());

    let rows = log.read_all(&path).unwrap();
    assert_eq!(replies_to(&rows, "1")[0].content, "librarian is now running.");
    let chunks = replies_to(&rows, "2");
    assert!(chunks.len() > 1);
    for (i, chunk) in chunks.iter().enumerate() {
        assert!(chunk.content.chars().count() <= 40);
        assert!(!chunk.content.contains("think"));
        assert_eq!(chunk.meta.get_i64("chunk_index"), Some(i as i64 + 1));
        assert_eq!(chunk.meta.get_i64("chunk_total"), Some(chunks.len() as i64));
        assert_eq!(chunk.meta.get_str("model"), Some(MODEL));
        assert_eq!(chunk.meta.get_str("reply_type"), Some("llm"));
    }
    let joined: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(
        joined.join(" "),
        "A mesh is a network where every radio relays packets for its neighbours."
    );
    assert!(source(&rows, "2").processed);
    assert_eq!(agent.queue_count("librarian"), 0);

    let text = std::fs::read_to_string(&persona_path).unwrap();
    assert!(text.contains("running = true"));
    assert!(text.contains("total_calls = 1"));
    assert!(text.contains("queue_count = 0"));
    agent.shutdown(None).await;
}

#[tokio::test]
async fn test_failed_generation_leaves_source_pending() {
    let tmp = tempdir().unwrap();
    let config = config(tmp.path());
    write_persona(&config, "librarian", RUNNING_LIBRARIAN);
    let path = thread_path(&config, ThreadType::Dm, "!a");
    let log = log(&config);
    log.append(&path, &inbound(ThreadType::Dm, "!a", "10", "!a", "librarian hello")).unwrap();

    let backend = ScriptedBackend::with_models(&[MODEL]);
    backend.respond(Ok("<think>only thoughts</think>   ".into()));
    let mut agent = Agent::new(config.clone(), backend.clone());
    agent.start_worker();
    assert_eq!(agent.scan_once().enqueued, 1);
    assert!(agent.wait_idle(Some(Duration::from_secs(10))).await);

    let rows = log.read_all(&path).unwrap();
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].processed);
    assert_eq!(agent.queue_count("librarian"), 0);

    // the next pass retries and succeeds
    assert_eq!(agent.scan_once().enqueued, 1);
    assert!(agent.wait_idle(Some(Duration::from_secs(10))).await);
    let rows = log.read_all(&path).unwrap();
    assert!(rows[0].processed);
    assert_eq!(replies_to(&rows, "10")[0].content, "ok");
    assert_eq!(replies_to(&rows, "10")[0].thread_type, Some(ThreadType::Dm));
    assert_eq!(backend.requests().len(), 2);
    agent.shutdown(None).await;
}

#[tokio::test]
async fn test_stopped_persona_is_not_answered() {
    let tmp = tempdir().unwrap();
    let config = config(tmp.path());
    write_persona(&config, "librarian", LIBRARIAN);
    let path = thread_path(&config, ThreadType::Channel, "mesh");
    let log = log(&config);
    log.append(&path, &inbound(ThreadType::Channel, "mesh", "5", "!a", "librarian anyone there?")).unwrap();

    let backend = ScriptedBackend::with_models(&[MODEL]);
    let mut agent = Agent::new(config, backend.clone());
    agent.start_worker();
    assert_eq!(agent.scan_once().enqueued, 0);
    assert!(agent.wait_idle(Some(Duration::from_secs(1))).await);

    let rows = log.read_all(&path).unwrap();
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].processed);
    assert!(backend.requests().is_empty());
    agent.shutdown(None).await;
}

#[tokio::test]
async fn test_cooldown_is_per_thread() {
    let tmp = tempdir().unwrap();
    let mut config = config(tmp.path());
    config.ai.reply_cooldown_seconds = 600;
    write_persona(&config, "librarian", RUNNING_LIBRARIAN);
    let mesh = thread_path(&config, ThreadType::Channel, "mesh");
    let other = thread_path(&config, ThreadType::Channel, "other");
    let log = log(&config);
    log.append(&mesh, &inbound(ThreadType::Channel, "mesh", "1", "!a", "librarian first")).unwrap();

    let backend = ScriptedBackend::with_models(&[MODEL]);
    let mut agent = Agent::new(config, backend.clone());
    agent.start_worker();
    assert_eq!(agent.scan_once().enqueued, 1);
    assert!(agent.wait_idle(Some(Duration::from_secs(10))).await);

    log.append(&mesh, &inbound(ThreadType::Channel, "mesh", "2", "!b", "librarian second")).unwrap();
    log.append(&other, &inbound(ThreadType::Channel, "other", "3", "!b", "librarian third")).unwrap();
    assert_eq!(agent.scan_once().enqueued, 1);
    assert!(agent.wait_idle(Some(Duration::from_secs(10))).await);

    let mesh_rows = log.read_all(&mesh).unwrap();
    assert!(replies_to(&mesh_rows, "2").is_empty());
    assert!(!source(&mesh_rows, "2").processed);
    let other_rows = log.read_all(&other).unwrap();
    assert_eq!(replies_to(&other_rows, "3").len(), 1);
    agent.shutdown(None).await;
}

#[test]
fn test_ignored_channel_index_is_skipped() {
    let tmp = tempdir().unwrap();
    let mut config = config(tmp.path());
    config.ai.ignore_channel_indexes = vec![0];
    write_persona(&config, "librarian", LIBRARIAN);
    let path = thread_path(&config, ThreadType::Channel, "mesh");
    let log = log(&config);
    let mut primary = inbound(ThreadType::Channel, "mesh", "1", "!a", "librarian status");
    primary.meta.insert("channel_index", 0);
    let mut secondary = inbound(ThreadType::Channel, "mesh", "2", "!a", "librarian status");
    secondary.meta.insert("channel_index", 1);
    log.append(&path, &primary).unwrap();
    log.append(&path, &secondary).unwrap();

    let mut agent = Agent::new(config, ScriptedBackend::with_models(&[]));
    assert_eq!(agent.scan_once().control_replies, 1);

    let rows = log.read_all(&path).unwrap();
    assert!(!source(&rows, "1").processed);
    assert!(replies_to(&rows, "1").is_empty());
    assert_eq!(replies_to(&rows, "2").len(), 1);
}

#[tokio::test]
async fn test_missing_model_is_pulled_first() {
    let tmp = tempdir().unwrap();
    let config = config(tmp.path());
    write_persona(&config, "librarian", RUNNING_LIBRARIAN);
    let path = thread_path(&config, ThreadType::Channel, "mesh");
    let log = log(&config);
    log.append(&path, &inbound(ThreadType::Channel, "mesh", "1", "!a", "librarian hi")).unwrap();

    let backend = ScriptedBackend::with_models(&[]);
    let mut agent = Agent::new(config, backend.clone());
    agent.start_worker();
    agent.scan_once();
    assert!(agent.wait_idle(Some(Duration::from_secs(10))).await);

    assert_eq!(*backend.pulls.lock().unwrap(), vec![MODEL.to_string()]);
    assert_eq!(agent.inference_status().lock().unwrap().model(MODEL), ModelStatus::Available);
    assert_eq!(agent.inference_status().lock().unwrap().connected(), Some(true));
    assert_eq!(replies_to(&log.read_all(&path).unwrap(), "1").len(), 1);
    agent.shutdown(None).await;
}

#[test]
fn test_identical_rows_without_ids_get_distinct_replies() {
    let tmp = tempdir().unwrap();
    let config = config(tmp.path());
    write_persona(&config, "librarian", LIBRARIAN);
    let path = thread_path(&config, ThreadType::Channel, "mesh");
    let log = log(&config);
    let mut row = inbound(ThreadType::Channel, "mesh", "", "!a", "librarian help");
    row.timestamp = "2025-01-01T00:00:00.000000+00:00".into();
    log.append(&path, &row).unwrap();
    log.append(&path, &row).unwrap();

    let mut agent = Agent::new(config, ScriptedBackend::with_models(&[]));
    assert_eq!(agent.scan_once().control_replies, 2);

    let rows = log.read_all(&path).unwrap();
    let (a, b) = (&rows[0].message_id, &rows[1].message_id);
    assert!(a.starts_with("gen_mesh_0_"), "{}", a);
    assert!(b.starts_with("gen_mesh_1_"), "{}", b);
    assert_eq!(replies_to(&rows, a).len(), 1);
    assert_eq!(replies_to(&rows, b).len(), 1);
    assert!(replies_to(&rows, a)[0]
        .content
        .starts_with("librarian help: send 'librarian <question>'"));

    assert_eq!(agent.scan_once().control_replies, 0);
}

#[test]
fn test_repeated_message_id_is_answered_once() {
    let tmp = tempdir().unwrap();
    let config = config(tmp.path());
    write_persona(&config, "librarian", LIBRARIAN);
    let path = thread_path(&config, ThreadType::Channel, "mesh");
    let log = log(&config);
    // a packet heard twice before the bridge could dedupe it
    log.append(&path, &inbound(ThreadType::Channel, "mesh", "42", "!a", "librarian status")).unwrap();
    log.append(&path, &inbound(ThreadType::Channel, "mesh", "42", "!a", "librarian status")).unwrap();

    let mut agent = Agent::new(config, ScriptedBackend::with_models(&[]));
    assert_eq!(agent.scan_once().control_replies, 1);
    assert_eq!(replies_to(&log.read_all(&path).unwrap(), "42").len(), 1);

    assert_eq!(agent.scan_once().control_replies, 0);
    assert_eq!(replies_to(&log.read_all(&path).unwrap(), "42").len(), 1);
}

#[tokio::test]
async fn test_repeated_message_id_is_queued_once() {
    let tmp = tempdir().unwrap();
    let config = config(tmp.path());
    write_persona(&config, "librarian", RUNNING_LIBRARIAN);
    let path = thread_path(&config, ThreadType::Channel, "mesh");
    let log = log(&config);
    log.append(&path, &inbound(ThreadType::Channel, "mesh", "42", "!a", "librarian hi")).unwrap();
    log.append(&path, &inbound(ThreadType::Channel, "mesh", "42", "!a", "librarian hi")).unwrap();

    let backend = ScriptedBackend::with_models(&[MODEL]);
    let mut agent = Agent::new(config, backend.clone());
    agent.start_worker();
    assert_eq!(agent.scan_once().enqueued, 1);
    assert!(agent.wait_idle(Some(Duration::from_secs(10))).await);

    assert_eq!(backend.requests().len(), 1);
    assert_eq!(replies_to(&log.read_all(&path).unwrap(), "42").len(), 1);
    agent.shutdown(None).await;
}

#[test]
fn test_second_pass_leaves_files_untouched() {
    let tmp = tempdir().unwrap();
    let config = config(tmp.path());
    let persona_path = write_persona(&config, "librarian", LIBRARIAN);
    let path = thread_path(&config, ThreadType::Channel, "mesh");
    let log = log(&config);
    log.append(&path, &inbound(ThreadType::Channel, "mesh", "1", "!a", "librarian status")).unwrap();
    log.append(&path, &inbound(ThreadType::Channel, "mesh", "", "!b", "librarian help")).unwrap();
    log.append(&path, &inbound(ThreadType::Channel, "mesh", "3", "!c", "no trigger here")).unwrap();

    let mut agent = Agent::new(config, ScriptedBackend::with_models(&[]));
    assert_eq!(agent.scan_once().control_replies, 2);

    let snapshot = |p: &std::path::Path| {
        let bytes = std::fs::read(p).unwrap();
        let modified = std::fs::metadata(p).unwrap().modified().unwrap();
        (bytes, modified)
    };
    let thread_before = snapshot(&path);
    let persona_before = snapshot(&persona_path);
    std::thread::sleep(Duration::from_millis(20));

    let report = agent.scan_once();
    assert_eq!((report.control_replies, report.enqueued), (0, 0));
    assert_eq!(snapshot(&path), thread_before);
    assert_eq!(snapshot(&persona_path), persona_before);
}

#[tokio::test]
async fn test_persona_lock_wait_does_not_stall_the_runtime() {
    let tmp = tempdir().unwrap();
    let config = config(tmp.path());
    let persona_path = write_persona(&config, "librarian", RUNNING_LIBRARIAN);
    let path = thread_path(&config, ThreadType::Channel, "mesh");
    let log = log(&config);
    log.append(&path, &inbound(ThreadType::Channel, "mesh", "1", "!a", "librarian hi")).unwrap();

    let backend = ScriptedBackend::with_models(&[MODEL]);
    let mut agent = Agent::new(config.clone(), backend.clone());
    agent.start_worker();
    assert_eq!(agent.scan_once().enqueued, 1);

    // the worker has not run yet; it will find the persona file locked
    let held = FileLock::for_target(&persona_path, config.lock.options()).acquire().unwrap();
    let started = Instant::now();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "runtime stalled for {:?}",
        started.elapsed()
    );
    drop(held);

    assert!(agent.wait_idle(Some(Duration::from_secs(10))).await);
    assert_eq!(replies_to(&log.read_all(&path).unwrap(), "1").len(), 1);
    let text = std::fs::read_to_string(&persona_path).unwrap();
    assert!(text.contains("total_calls = 1"), "{}", text);
    assert!(text.contains("queue_count = 0"), "{}", text);
    agent.shutdown(None).await;
}
