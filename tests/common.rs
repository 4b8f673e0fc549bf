//! Test utilities & fixtures shared by the integration tests.

use std::path::{Path, PathBuf};

use meshllm::config::Config;
use meshllm::thread::{Direction, MessageRecord, NodeLayout, ThreadType};

/// Node namespace every fixture writes into.
#[allow(dead_code)]
pub const NODE: &str = "local";

/// Defaults rooted at `root`, with fast locks and no ignored channels.
#[allow(dead_code)]
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.data.root = root.to_string_lossy().into_owned();
    config.ai.ignore_channel_indexes = Vec::new();
    config.bridge.node_uid = NODE.to_string();
    config.lock.timeout_ms = 2_000;
    config.lock.poll_interval_ms = 5;
    config.logging.file = None;
    config
}

/// Write `personas/<file>.toml` and return its path.
#[allow(dead_code)]
pub fn write_persona(config: &Config, file: &str, body: &str) -> PathBuf {
    let dir = config.personas_dir();
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.toml", file));
    std::fs::write(&path, body).unwrap();
    path
}

#[allow(dead_code)]
pub fn thread_path(config: &Config, thread_type: ThreadType, key: &str) -> PathBuf {
    NodeLayout::new(config.nodes_base()).thread_path(NODE, thread_type, key)
}

/// Unprocessed inbound row.
#[allow(dead_code)]
pub fn inbound(thread_type: ThreadType, key: &str, id: &str, sender: &str, content: &str) -> MessageRecord {
    let mut row = MessageRecord::new(thread_type, key, Direction::Inbound);
    row.message_id = id.to_string();
    row.sender_id = sender.to_string();
    row.content = content.to_string();
    row
}
