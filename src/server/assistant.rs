//! Assistant Invocation Pipeline.
//!
//! A room message addressed with `@ai` is handed to a [`TextGenerator`]; the
//! reply becomes an `assistant-text` message from the reserved `ai`
//! participant. The router owns persistence and fan-out of the reply, this
//! module only turns a prompt into an [`AssistantReply`] within a deadline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use commsync_common::AssistantReply;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::errors::AssistantError;

/// Default deadline for one generation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const SYSTEM_INSTRUCTION: &str = "You are an assistant embedded in a project chat room. \
Answer the user's request. Respond with a JSON object that has a \"text\" field holding \
your answer. When the request asks for code, also include a \"fileTree\" object mapping \
file names to { \"file\": { \"contents\": \"...\" } }, and optional \"buildCommand\" and \
\"startCommand\" objects of the form { \"mainItem\": \"npm\", \"commands\": [\"install\"] }.";

/// Abstraction over the text-generation collaborator.
/// Real implementation: `GeminiGenerator`. Test doubles: `StaticGenerator`, `FailingGenerator`.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Google Generative Language `generateContent` client.
pub struct GeminiGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

impl GeminiGenerator {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[async_trait]
impl TextGenerator for GeminiGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "systemInstruction": { "parts": [{ "text": SYSTEM_INSTRUCTION }] },
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "temperature": 0.4
            }
        });

        let resp: GenerateResponse = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send generateContent request")?
            .error_for_status()
            .context("generateContent returned error status")?
            .json()
            .await
            .context("Failed to parse generateContent response")?;

        let text: String = resp
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();
        Ok(text)
    }
}

/// Always answers with the same text.
pub struct StaticGenerator(pub String);

impl StaticGenerator {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }
}

#[async_trait]
impl TextGenerator for StaticGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Always fails.
pub struct FailingGenerator;

#[async_trait]
impl TextGenerator for FailingGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String> {
        anyhow::bail!("generator unavailable")
    }
}

/// Turns a prompt into an assistant reply within a deadline.
#[derive(Clone)]
pub struct AssistantPipeline {
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
}

impl AssistantPipeline {
    pub fn new(generator: Arc<dyn TextGenerator>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }

    pub async fn respond(&self, prompt: &str) -> Result<AssistantReply, AssistantError> {
        debug!(prompt_len = prompt.len(), "Invoking text generator");
        let raw = tokio::time::timeout(self.timeout, self.generator.generate(prompt))
            .await
            .map_err(|_| {
                let ms = self.timeout.as_millis() as u64;
                warn!(timeout_ms = ms, "Text generation timed out");
                AssistantError::Timeout { ms }
            })?
            .map_err(AssistantError::Upstream)?;

        if raw.trim().is_empty() {
            return Err(AssistantError::EmptyResponse);
        }
        Ok(AssistantReply::from_generated(&raw))
    }
}
