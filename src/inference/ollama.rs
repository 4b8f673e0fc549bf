//! Ollama HTTP client (`/api/tags`, `/api/pull`, `/api/generate`).

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::{GenerateRequest, InferenceBackend, InferenceError};

/// Model downloads can take far longer than a generation.
const PULL_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    #[serde(default)]
    name: String,
    #[serde(default)]
    model: String,
}

#[derive(Debug, Serialize)]
struct PullRequest<'a> {
    name: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaClient {
    /// `timeout` caps every request except model pulls.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::Http(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn send_error(e: reqwest::Error) -> InferenceError {
    if e.is_connect() {
        InferenceError::Unavailable(e.to_string())
    } else {
        InferenceError::Http(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, InferenceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(InferenceError::Http(format!("server returned {}: {}", status, body.trim())))
}

#[async_trait]
impl InferenceBackend for OllamaClient {
    async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        let response = self.client.get(self.url("/api/tags")).send().await.map_err(send_error)?;
        let tags: TagsResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| InferenceError::Protocol(e.to_string()))?;
        Ok(tags
            .models
            .into_iter()
            .map(|t| if t.name.is_empty() { t.model } else { t.name })
            .filter(|n| !n.is_empty())
            .collect())
    }

    async fn pull_model(&self, model: &str) -> Result<(), InferenceError> {
        info!("Pulling Ollama model '{}'", model);
        let response = self
            .client
            .post(self.url("/api/pull"))
            .timeout(PULL_TIMEOUT)
            .json(&PullRequest { name: model, stream: false })
            .send()
            .await
            .map_err(send_error)?;
        let body: PullResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| InferenceError::Protocol(e.to_string()))?;
        if let Some(err) = body.error {
            return Err(InferenceError::ModelUnavailable {
                model: model.to_string(),
                reason: err,
            });
        }
        debug!("ollama pull {}: {}", model, body.status);
        Ok(())
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, InferenceError> {
        let body = GenerateBody {
            model: &request.model,
            prompt: &request.prompt,
            system: request.system.as_deref().filter(|s| !s.is_empty()),
            options: request.temperature.map(|temperature| GenerateOptions { temperature }),
            stream: false,
        };
        let response = self
            .client
            .post(self.url("/api/generate"))
            .json(&body)
            .send()
            .await
            .map_err(send_error)?;
        let parsed: GenerateResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| InferenceError::Protocol(e.to_string()))?;
        if let Some(err) = parsed.error {
            return Err(InferenceError::Http(err));
        }
        Ok(parsed.response)
    }
}
