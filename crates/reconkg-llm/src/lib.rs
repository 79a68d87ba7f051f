//! LLM adapter
//!
//! A single black-box function: prompt in, schema-validated JSON out.
//!
//! Callers declare the response shape as a `serde` target type; the adapter
//! guarantees either a value of that type or a typed error. Transport
//! failures are retried with exponential backoff; a response that parses as
//! JSON but not as the declared shape gets exactly one re-ask with the
//! violation appended, then surfaces `SchemaViolation`. Every call respects
//! the caller's deadline.
//!
//! The adapter is stateless per call: no caching, no conversation memory.
//! Every caller in the workspace falls back to rule-based logic on
//! `Unavailable`.

pub mod providers;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

pub use providers::{LlmConfig, OpenAiCompatClient, UnifiedLlmClient};

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Transport-level failure, timeout, or missing configuration. Callers
    /// degrade to rule-based behavior.
    #[error("LLM unavailable: {0}")]
    Unavailable(String),
    /// The model responded but not in the declared shape, even after one
    /// re-ask.
    #[error("LLM response violated the expected schema: {0}")]
    SchemaViolation(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    /// Ask the provider for JSON output mode when supported.
    pub json_mode: bool,
}

impl CompletionRequest {
    pub fn json(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            max_tokens: Some(4096),
            temperature: None,
            json_mode: true,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Raw completion transport. Implementations are provider-specific; retry
/// and schema validation live in [`LlmAdapter`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError>;

    fn model_name(&self) -> &str;
}

/// Retry/validation wrapper around any [`LlmClient`].
pub struct LlmAdapter {
    client: Box<dyn LlmClient>,
    max_retries: u32,
    backoff_base: Duration,
}

impl LlmAdapter {
    pub fn new(client: Box<dyn LlmClient>) -> Self {
        Self {
            client,
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Construct from environment configuration; `None` when no provider is
    /// configured (callers then run rule-based only).
    pub fn from_env() -> Option<Self> {
        let config = LlmConfig::from_env().ok()?;
        Some(Self::new(Box::new(UnifiedLlmClient::from_config(config))))
    }

    pub fn model_name(&self) -> &str {
        self.client.model_name()
    }

    /// One completion with transport retry and a hard deadline.
    async fn complete_with_retry(
        &self,
        request: &CompletionRequest,
        deadline: Duration,
    ) -> Result<CompletionResponse, LlmError> {
        let started = tokio::time::Instant::now();
        let mut attempt = 0u32;
        loop {
            let remaining = deadline
                .checked_sub(started.elapsed())
                .ok_or_else(|| LlmError::Unavailable("deadline exhausted".to_string()))?;

            let result = tokio::time::timeout(remaining, self.client.complete(request)).await;
            match result {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(LlmError::SchemaViolation(e))) => {
                    // Not a transport error; the re-ask loop above us owns it.
                    return Err(LlmError::SchemaViolation(e));
                }
                Ok(Err(err)) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(LlmError::Unavailable(err.to_string()));
                    }
                    let backoff = self.backoff_base * 2u32.saturating_pow(attempt - 1);
                    warn!(attempt, error = %err, backoff_ms = backoff.as_millis() as u64,
                          "LLM transport error, backing off");
                    tokio::time::sleep(backoff.min(remaining)).await;
                }
                Err(_elapsed) => {
                    return Err(LlmError::Unavailable(format!(
                        "timed out after {}s",
                        deadline.as_secs()
                    )))
                }
            }
        }
    }

    /// `complete(prompt, shape) -> parsed_json`: the adapter's contract.
    ///
    /// The declared shape is the type parameter. On a shape mismatch the
    /// model is re-asked once with the violation appended; a second mismatch
    /// is a `SchemaViolation`.
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        request: CompletionRequest,
        deadline: Duration,
    ) -> Result<T, LlmError> {
        let response = self.complete_with_retry(&request, deadline).await?;
        match parse_json_response::<T>(&response.content) {
            Ok(value) => Ok(value),
            Err(violation) => {
                debug!(error = %violation, "schema violation, re-asking once");
                let mut retry = request.clone();
                retry.prompt = format!(
                    "{}\n\nYour previous response was not valid for the expected JSON \
                     shape ({violation}). Respond again with ONLY the JSON object.",
                    request.prompt
                );
                let response = self.complete_with_retry(&retry, deadline).await?;
                parse_json_response::<T>(&response.content)
                    .map_err(|e| LlmError::SchemaViolation(e.to_string()))
            }
        }
    }
}

/// Strip markdown code fences and parse into the declared shape.
pub fn parse_json_response<T: DeserializeOwned>(content: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(strip_fences(content))
}

fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}
