//! # Persona Module - Named Responders
//!
//! A persona is one TOML file in the personas directory. Its static fields
//! (triggers, prompt, limits, channel lists) are written by a human; its
//! runtime counters are written by the agent into a trailing block of the
//! same file (see [`document`]).
//!
//! ```text
//! personas/
//! ├── librarian.toml
//! └── oracle.toml
//! ```

pub mod document;
pub mod registry;

pub use document::PersonaDocument;
pub use registry::PersonaRegistry;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use log::warn;
use serde::Deserialize;
use thiserror::Error;

use crate::storage::{atomic_write, FileLock, LockOptions, StoreError};

#[derive(Debug, Error)]
pub enum PersonaError {
    #[error("failed to read persona file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid persona file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Mutable counters persisted in the runtime block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersonaRuntime {
    pub running: bool,
    pub total_calls: u64,
    pub today_calls: u64,
    /// Local calendar date (`YYYY-MM-DD`) that `today_calls` counts for.
    pub today_date: String,
    /// RFC 3339 in the persona's timezone, or empty.
    pub last_started: String,
    pub control_calls: u64,
    pub queue_count: u64,
}

/// Static fields as written by a human.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Definition {
    name: Option<String>,
    triggers: Option<Vec<String>>,
    timezone: Option<String>,
    description: String,
    model: Option<String>,
    temperature: Option<f64>,
    max_message_chars: usize,
    max_context_chars: usize,
    cooldown_seconds: u64,
    rag: bool,
    tools: Vec<String>,
    system_prompt: String,
    #[serde(deserialize_with = "crate::config::int_list::deserialize_opt")]
    allow_channels: Option<Vec<i64>>,
    #[serde(deserialize_with = "crate::config::int_list::deserialize_opt")]
    block_channels: Option<Vec<i64>>,
}

#[derive(Debug, Clone)]
pub struct Persona {
    pub path: PathBuf,
    pub name: String,
    pub triggers: Vec<String>,
    pub timezone: String,
    pub description: String,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    /// `0` means "use the global default"; likewise for the other limits.
    pub max_message_chars: usize,
    pub max_context_chars: usize,
    pub cooldown_seconds: u64,
    pub rag: bool,
    pub tools: Vec<String>,
    pub system_prompt: String,
    pub allow_channels: Option<Vec<i64>>,
    pub block_channels: Option<Vec<i64>>,
    pub runtime: PersonaRuntime,
    document: PersonaDocument,
    lock: LockOptions,
}

/// Immutable copy of the fields a queued task needs, taken at enqueue time.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonaSnapshot {
    pub name: String,
    pub system_prompt: String,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_message_chars: usize,
    pub max_context_chars: usize,
    pub cooldown_seconds: u64,
    pub allow_channels: Option<Vec<i64>>,
    pub block_channels: Option<Vec<i64>>,
}

impl Persona {
    /// Parse a persona file. `default_timezone` applies when the file names none.
    pub fn load(path: &Path, default_timezone: &str, lock: LockOptions) -> Result<Self, PersonaError> {
        let text = fs::read_to_string(path).map_err(|source| PersonaError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &text, default_timezone, lock)
    }

    pub fn parse(path: &Path, text: &str, default_timezone: &str, lock: LockOptions) -> Result<Self, PersonaError> {
        let parse_err = |source| PersonaError::Parse {
            path: path.to_path_buf(),
            source,
        };
        let def: Definition = toml::from_str(text).map_err(parse_err)?;
        let runtime: PersonaRuntime = toml::from_str(text).map_err(parse_err)?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = def.name.filter(|n| !n.trim().is_empty()).unwrap_or(stem);
        let triggers = match def.triggers {
            Some(t) if !t.is_empty() => t,
            _ => vec![name.clone()],
        };
        let timezone = def.timezone.unwrap_or_else(|| default_timezone.to_string());
        if timezone.parse::<Tz>().is_err() {
            warn!(
                "Persona {} has unknown timezone '{}'; using UTC",
                path.display(),
                timezone
            );
        }
        Ok(Self {
            path: path.to_path_buf(),
            triggers,
            timezone,
            description: def.description,
            model: def.model.filter(|m| !m.trim().is_empty()),
            temperature: def.temperature,
            max_message_chars: def.max_message_chars,
            max_context_chars: def.max_context_chars,
            cooldown_seconds: def.cooldown_seconds,
            rag: def.rag,
            tools: def.tools,
            system_prompt: def.system_prompt,
            allow_channels: def.allow_channels,
            block_channels: def.block_channels,
            runtime,
            document: PersonaDocument::split(text),
            lock,
            name,
        })
    }

    pub fn has_trigger(&self, token: &str) -> bool {
        let token = token.to_lowercase();
        self.triggers.iter().any(|t| t.to_lowercase() == token)
    }

    /// Persona timezone, UTC when the name does not resolve.
    pub fn zone(&self) -> Tz {
        self.timezone.parse().unwrap_or(Tz::UTC)
    }

    /// Reset `today_calls` when the local calendar day differs from `today_date`.
    pub fn refresh_today(&mut self, now: DateTime<Utc>) {
        let today = now.with_timezone(&self.zone()).format("%Y-%m-%d").to_string();
        if self.runtime.today_date != today {
            self.runtime.today_date = today;
            self.runtime.today_calls = 0;
        }
    }

    pub fn mark_started(&mut self, now: DateTime<Utc>) {
        self.runtime.running = true;
        self.runtime.last_started = now.with_timezone(&self.zone()).to_rfc3339();
    }

    pub fn mark_stopped(&mut self) {
        self.runtime.running = false;
    }

    pub fn increment_control(&mut self) {
        self.runtime.control_calls += 1;
    }

    /// One successful generation.
    pub fn record_call(&mut self, now: DateTime<Utc>) {
        self.refresh_today(now);
        self.runtime.total_calls += 1;
        self.runtime.today_calls += 1;
    }

    pub fn snapshot(&self) -> PersonaSnapshot {
        PersonaSnapshot {
            name: self.name.clone(),
            system_prompt: self.system_prompt.trim().to_string(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_message_chars: self.max_message_chars,
            max_context_chars: self.max_context_chars,
            cooldown_seconds: self.cooldown_seconds,
            allow_channels: self.allow_channels.clone(),
            block_channels: self.block_channels.clone(),
        }
    }

    /// Regenerate the runtime block and atomically replace the file, leaving
    /// the head untouched.
    pub fn write_runtime(&self) -> Result<(), StoreError> {
        let text = self.document.render(&self.runtime);
        let _guard = FileLock::for_target(&self.path, self.lock).acquire()?;
        atomic_write(&self.path, &text)?;
        Ok(())
    }

    /// Current file text, read under the file's lock.
    pub fn read_config_text(&self) -> Result<String, StoreError> {
        let _guard = FileLock::for_target(&self.path, self.lock).acquire()?;
        Ok(fs::read_to_string(&self.path)?)
    }

    /// `2025-03-01 08:00:00 PST | librarian is running. Calls: 4 total, 1 today. Last start: ...`
    pub fn status_summary(&self, now: DateTime<Utc>) -> String {
        let zone = self.zone();
        let local_now = now.with_timezone(&zone);
        let last = if self.runtime.last_started.is_empty() {
            "never".to_string()
        } else {
            match DateTime::parse_from_rfc3339(&self.runtime.last_started) {
                Ok(ts) => ts.with_timezone(&zone).format("%Y-%m-%d %H:%M:%S %Z").to_string(),
                Err(_) => self.runtime.last_started.clone(),
            }
        };
        format!(
            "{} | {} is {}. Calls: {} total, {} today. Last start: {}.",
            local_now.format("%Y-%m-%d %H:%M:%S %Z"),
            self.name,
            if self.runtime.running { "running" } else { "stopped" },
            self.runtime.total_calls,
            self.runtime.today_calls,
            last
        )
    }
}

impl PersonaSnapshot {
    /// Channel allow/block lists only constrain channel threads with a known index.
    pub fn allows_channel(&self, channel_index: Option<i64>) -> bool {
        let Some(index) = channel_index else {
            return true;
        };
        if let Some(allow) = &self.allow_channels {
            if !allow.contains(&index) {
                return false;
            }
        }
        if let Some(block) = &self.block_channels {
            if block.contains(&index) {
                return false;
            }
        }
        true
    }
}
