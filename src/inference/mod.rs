//! # Inference Seam
//!
//! The agent talks to a local model server through [`InferenceBackend`]. The
//! default implementation is the Ollama HTTP client (feature `ollama`); tests
//! plug in scripted backends.
//!
//! Model readiness is cached in an [`InferenceStatus`] shared between the
//! worker (which pulls missing models) and the `status` control command
//! (which only reads the cache).
//!
//! ```text
//! unknown ──probe──▶ available
//!    │                  ▲
//!    └──▶ missing ──pull──▶ downloading ──▶ available | error
//! ```

#[cfg(feature = "ollama")]
pub mod ollama;

#[cfg(feature = "ollama")]
pub use ollama::OllamaClient;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;
use thiserror::Error;

use crate::config::OllamaConfig;

#[derive(Debug, Error)]
pub enum InferenceError {
    /// Server unreachable or refused the connection.
    #[error("inference server unavailable: {0}")]
    Unavailable(String),
    #[error("model '{model}' unavailable: {reason}")]
    ModelUnavailable { model: String, reason: String },
    /// Nothing usable left after trimming and reasoning removal.
    #[error("empty response")]
    EmptyResponse,
    #[error("http error: {0}")]
    Http(String),
    #[error("unexpected response: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub system: Option<String>,
    pub temperature: Option<f64>,
}

/// A text-generation server.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Names of locally installed models.
    async fn list_models(&self) -> Result<Vec<String>, InferenceError>;

    /// Download `model`; returns once the server reports it installed.
    async fn pull_model(&self, model: &str) -> Result<(), InferenceError>;

    /// Single non-streaming completion; returns the raw response text.
    async fn generate(&self, request: &GenerateRequest) -> Result<String, InferenceError>;
}

/// Stand-in used when no server is configured or the client is compiled out.
#[derive(Debug, Default)]
pub struct DisabledBackend;

#[async_trait]
impl InferenceBackend for DisabledBackend {
    async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        Err(InferenceError::Unavailable("no inference backend configured".to_string()))
    }

    async fn pull_model(&self, model: &str) -> Result<(), InferenceError> {
        Err(InferenceError::ModelUnavailable {
            model: model.to_string(),
            reason: "no inference backend configured".to_string(),
        })
    }

    async fn generate(&self, _request: &GenerateRequest) -> Result<String, InferenceError> {
        Err(InferenceError::Unavailable("no inference backend configured".to_string()))
    }
}

/// The configured backend for `config`.
pub fn backend_from_config(config: &OllamaConfig) -> Arc<dyn InferenceBackend> {
    #[cfg(feature = "ollama")]
    {
        if !config.base_url.trim().is_empty() {
            match OllamaClient::new(&config.base_url, config.request_timeout()) {
                Ok(client) => return Arc::new(client),
                Err(e) => log::error!("Failed to build Ollama client: {}", e),
            }
        }
    }
    #[cfg(not(feature = "ollama"))]
    let _ = config;
    Arc::new(DisabledBackend)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Unknown,
    Downloading,
    Available,
    Missing,
    Error,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Unknown => "unknown",
            ModelStatus::Downloading => "downloading",
            ModelStatus::Available => "available",
            ModelStatus::Missing => "missing",
            ModelStatus::Error => "error",
        }
    }

    /// States that warrant a fresh probe.
    pub fn is_unsettled(&self) -> bool {
        matches!(self, ModelStatus::Unknown | ModelStatus::Missing | ModelStatus::Error)
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached connectivity and per-model readiness.
#[derive(Debug, Default, Clone)]
pub struct InferenceStatus {
    connected: Option<bool>,
    models: HashMap<String, ModelStatus>,
}

pub type SharedStatus = Arc<Mutex<InferenceStatus>>;

impl InferenceStatus {
    pub fn connected(&self) -> Option<bool> {
        self.connected
    }

    pub fn set_connected(&mut self, value: Option<bool>) {
        self.connected = value;
    }

    pub fn model(&self, name: &str) -> ModelStatus {
        self.models.get(name).copied().unwrap_or(ModelStatus::Unknown)
    }

    pub fn set_model(&mut self, name: &str, status: ModelStatus) {
        if !name.is_empty() {
            self.models.insert(name.to_string(), status);
        }
    }

    /// True when connectivity is unknown or any required model is unsettled.
    pub fn needs_probe(&self, required: &BTreeSet<String>) -> bool {
        self.connected.is_none() || required.iter().any(|m| self.model(m).is_unsettled())
    }

    /// Merge probe results. A download in progress is not downgraded to
    /// missing/unknown by a probe that raced it.
    pub fn apply_probe(&mut self, connected: bool, statuses: &BTreeMap<String, ModelStatus>) {
        self.connected = Some(connected);
        for (model, status) in statuses {
            if self.model(model) == ModelStatus::Downloading
                && matches!(status, ModelStatus::Missing | ModelStatus::Unknown)
            {
                continue;
            }
            self.set_model(model, *status);
        }
    }

    /// `Ollama: connected | downloading a; missing b` and friends.
    pub fn status_line(&self, required: &BTreeSet<String>) -> String {
        if required.is_empty() {
            return "Ollama: not configured".to_string();
        }
        if self.connected != Some(true) {
            return "Ollama: offline | models unavailable".to_string();
        }
        let mut downloading = Vec::new();
        let mut missing = Vec::new();
        for model in required {
            match self.model(model) {
                ModelStatus::Downloading => downloading.push(model.as_str()),
                s if s.is_unsettled() => missing.push(model.as_str()),
                _ => {}
            }
        }
        if downloading.is_empty() && missing.is_empty() {
            return "Ollama: connected | all required models ready".to_string();
        }
        let mut parts = Vec::new();
        if !downloading.is_empty() {
            parts.push(format!("downloading {}", downloading.join(", ")));
        }
        if !missing.is_empty() {
            parts.push(format!("missing {}", missing.join(", ")));
        }
        format!("Ollama: connected | {}", parts.join("; "))
    }
}

/// Default instruct model, the persona override and the optional think model.
pub fn required_models(config: &OllamaConfig, persona_model: Option<&str>) -> BTreeSet<String> {
    [config.instruct_model(), persona_model, config.think_model()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

/// Installed names match either exactly or by the part before `:tag`.
pub fn model_installed(installed: &[String], model: &str) -> bool {
    installed
        .iter()
        .any(|name| name == model || name.split(':').next() == Some(model))
}

/// Ask the backend which of `required` are installed. Connection failures
/// report every model as unknown.
pub async fn probe(
    backend: &dyn InferenceBackend,
    required: &BTreeSet<String>,
) -> (bool, BTreeMap<String, ModelStatus>) {
    if required.is_empty() {
        return (true, BTreeMap::new());
    }
    match backend.list_models().await {
        Ok(installed) => {
            let statuses = required
                .iter()
                .map(|m| {
                    let status = if model_installed(&installed, m) {
                        ModelStatus::Available
                    } else {
                        ModelStatus::Missing
                    };
                    (m.clone(), status)
                })
                .collect();
            (true, statuses)
        }
        Err(e) => {
            debug!("Inference probe failed: {}", e);
            (false, required.iter().map(|m| (m.clone(), ModelStatus::Unknown)).collect())
        }
    }
}
