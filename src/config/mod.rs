//! # Configuration Management Module
//!
//! Both processes read the same TOML file. Every value has a working
//! default, so an empty file (or none at all) yields a usable setup.
//!
//! ## Configuration File Format
//!
//! ```toml
//! [general]
//! timezone = "America/Los_Angeles"
//!
//! [data]
//! root = "./data"
//!
//! [ai]
//! default_persona = "librarian"
//! ignore_channel_indexes = [0]
//! max_message_chars = 200
//!
//! [ollama]
//! base_url = "http://localhost:11434"
//! model_instruct = "qwen3-4b-q8-instruct"
//! ```
//!
//! ## Environment Integration
//!
//! Variables starting with the prefix (`MESHTASTIC_LLM_` unless `[env] prefix`
//! says otherwise) override file values. The prefix is stripped, the rest is
//! lower-cased and `__` separates path segments:
//!
//! ```text
//! MESHTASTIC_LLM_AI__MAX_MESSAGE_CHARS=180   ->  ai.max_message_chars = 180
//! MESHTASTIC_LLM_AI__IGNORE_CHANNEL_INDEXES=0,2
//! ```
//!
//! Precedence: CLI args > Environment > Config file > Defaults

use anyhow::{anyhow, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::storage::LockOptions;

pub const DEFAULT_ENV_PREFIX: &str = "MESHTASTIC_LLM_";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub env: EnvConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default timezone for personas that do not name one.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_root")]
    pub root: String,
    /// Defaults to `<root>/nodes`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes_base: Option<String>,
    /// Defaults to `<root>/personas`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personas_dir: Option<String>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: default_data_root(),
            nodes_base: None,
            personas_dir: None,
        }
    }
}

fn default_data_root() -> String {
    "./data".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_ai_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_persona_name")]
    pub default_persona: String,
    /// Inbound rows on these channel indexes are never answered.
    #[serde(default = "default_ignore_channels", deserialize_with = "int_list::deserialize")]
    pub ignore_channel_indexes: Vec<i64>,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_reply_cooldown")]
    pub reply_cooldown_seconds: u64,
    /// Prefix multi-part replies with `(i/n) `
    #[serde(default)]
    pub show_chunk_markers: bool,
    #[serde(default = "default_worker_join_timeout")]
    pub worker_join_timeout_seconds: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_ai_poll_ms(),
            default_persona: default_persona_name(),
            ignore_channel_indexes: default_ignore_channels(),
            max_message_chars: default_max_message_chars(),
            max_context_chars: default_max_context_chars(),
            reply_cooldown_seconds: default_reply_cooldown(),
            show_chunk_markers: false,
            worker_join_timeout_seconds: default_worker_join_timeout(),
        }
    }
}

fn default_ai_poll_ms() -> u64 {
    1000
}

fn default_persona_name() -> String {
    "librarian".to_string()
}

fn default_ignore_channels() -> Vec<i64> {
    vec![0]
}

fn default_max_message_chars() -> usize {
    200 // leaves room for mesh packet overhead
}

fn default_max_context_chars() -> usize {
    2000
}

fn default_reply_cooldown() -> u64 {
    120
}

fn default_worker_join_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Empty disables inference entirely.
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    #[serde(default = "default_model_instruct")]
    pub model_instruct: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_think: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            model_instruct: default_model_instruct(),
            model_think: None,
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model_instruct() -> String {
    "qwen3-4b-q8-instruct".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

impl OllamaConfig {
    pub fn instruct_model(&self) -> Option<&str> {
        non_empty(&self.model_instruct)
    }

    pub fn think_model(&self) -> Option<&str> {
        self.model_think.as_deref().and_then(non_empty)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds.max(1))
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_poll_ms")]
    pub poll_interval_ms: u64,
    /// Namespace directory for the locally attached radio.
    #[serde(default = "default_node_uid")]
    pub node_uid: String,
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: u64,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_seconds: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_bridge_poll_ms(),
            node_uid: default_node_uid(),
            max_send_attempts: default_max_send_attempts(),
            backoff_base_seconds: default_backoff_base(),
            backoff_cap_seconds: default_backoff_cap(),
        }
    }
}

fn default_bridge_poll_ms() -> u64 {
    500
}

fn default_node_uid() -> String {
    "local".to_string()
}

fn default_max_send_attempts() -> u32 {
    5
}

fn default_backoff_base() -> u64 {
    5
}

fn default_backoff_cap() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_lock_poll_ms")]
    pub poll_interval_ms: u64,
    /// Sentinels older than this are presumed abandoned by a crashed process.
    /// `0` disables stale-lock breaking.
    #[serde(default = "default_lock_stale_seconds")]
    pub stale_after_seconds: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_lock_timeout_ms(),
            poll_interval_ms: default_lock_poll_ms(),
            stale_after_seconds: default_lock_stale_seconds(),
        }
    }
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

fn default_lock_poll_ms() -> u64 {
    50
}

fn default_lock_stale_seconds() -> u64 {
    120
}

impl LockConfig {
    pub fn options(&self) -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            stale_after: match self.stale_after_seconds {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: Some("meshllm.log".to_string()),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    #[serde(default = "default_env_prefix")]
    pub prefix: String,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            prefix: default_env_prefix(),
        }
    }
}

fn default_env_prefix() -> String {
    DEFAULT_ENV_PREFIX.to_string()
}

impl Config {
    /// Load configuration from a file, then apply environment overrides.
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;
        Self::from_toml_with_env(&content, std::env::vars())
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))
    }

    /// Like [`Config::load`], but a missing file yields defaults plus
    /// environment overrides.
    pub async fn load_or_default(path: &str) -> Result<Self> {
        if fs::metadata(path).await.is_ok() {
            return Self::load(path).await;
        }
        log::warn!("Config file {} not found; using defaults", path);
        Self::from_toml_with_env("", std::env::vars())
    }

    /// Parse `content` and overlay every `(name, value)` pair whose name
    /// carries the configured prefix.
    pub fn from_toml_with_env<I>(content: &str, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut table: toml::Table = toml::from_str(content)?;
        let prefix = table
            .get("env")
            .and_then(|v| v.get("prefix"))
            .and_then(|v| v.as_str())
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_ENV_PREFIX)
            .to_string();
        for (name, value) in vars {
            if let Some(path) = override_path(&prefix, &name) {
                apply_override(&mut table, &path, &value)?;
            }
        }
        let config: Config = toml::Value::Table(table).try_into()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn data_root(&self) -> PathBuf {
        PathBuf::from(&self.data.root)
    }

    pub fn nodes_base(&self) -> PathBuf {
        self.resolve_under_root(self.data.nodes_base.as_deref(), "nodes")
    }

    pub fn personas_dir(&self) -> PathBuf {
        self.resolve_under_root(self.data.personas_dir.as_deref(), "personas")
    }

    fn resolve_under_root(&self, configured: Option<&str>, fallback: &str) -> PathBuf {
        match configured.map(str::trim).filter(|s| !s.is_empty()) {
            Some(p) if Path::new(p).is_absolute() => PathBuf::from(p),
            Some(p) => self.data_root().join(p),
            None => self.data_root().join(fallback),
        }
    }
}

/// `MESHTASTIC_LLM_AI__MAX_MESSAGE_CHARS` -> `["ai", "max_message_chars"]`
fn override_path(prefix: &str, name: &str) -> Option<Vec<String>> {
    let stripped = name.strip_prefix(prefix)?;
    if stripped.is_empty() {
        return None;
    }
    let lowered = stripped.to_ascii_lowercase();
    Some(
        lowered
            .split("__")
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

fn apply_override(table: &mut toml::Table, path: &[String], raw: &str) -> Result<()> {
    let Some((leaf, parents)) = path.split_last() else {
        return Ok(());
    };
    let mut cursor = table;
    for segment in parents {
        let entry = cursor
            .entry(segment.clone())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        cursor = entry
            .as_table_mut()
            .ok_or_else(|| anyhow!("override path {} crosses a non-table value", path.join(".")))?;
    }
    cursor.insert(leaf.clone(), parse_literal(raw));
    Ok(())
}

/// A TOML literal when `raw` parses as one, otherwise the plain string.
fn parse_literal(raw: &str) -> toml::Value {
    let trimmed = raw.trim();
    if let Ok(mut doc) = format!("v = {}", trimmed).parse::<toml::Table>() {
        if let Some(value) = doc.remove("v") {
            return value;
        }
    }
    toml::Value::String(raw.to_string())
}

/// Deserializers for integer lists written as `[0, 2]`, `3` or `"0,2"`.
pub mod int_list {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        List(Vec<Raw>),
        Text(String),
    }

    fn flatten(raw: Raw, out: &mut Vec<i64>) {
        match raw {
            Raw::Int(i) => out.push(i),
            Raw::List(items) => items.into_iter().for_each(|r| flatten(r, out)),
            Raw::Text(text) => out.extend(parse(&text)),
        }
    }

    /// Comma-separated integers; unparseable parts are skipped.
    pub fn parse(text: &str) -> Vec<i64> {
        text.trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .split(',')
            .filter_map(|p| p.trim().parse().ok())
            .collect()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut out = Vec::new();
        flatten(Raw::deserialize(deserializer)?, &mut out);
        Ok(out)
    }

    pub fn deserialize_opt<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<i64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize(deserializer).map(Some)
    }
}
