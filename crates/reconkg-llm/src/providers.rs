//! LLM API providers
//!
//! Concrete transports behind the adapter: an OpenAI-compatible endpoint
//! (hosted or local vLLM/Ollama in OpenAI mode). Configuration comes from
//! the environment; the adapter never reads env vars itself.

use super::{CompletionRequest, CompletionResponse, LlmClient, LlmError};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no LLM provider configured; set RECONKG_LLM_URL")]
    NoProviderConfigured,
}

impl LlmConfig {
    /// Load from environment variables. `RECONKG_LLM_URL` selects the
    /// provider; the rest have defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint =
            std::env::var("RECONKG_LLM_URL").map_err(|_| ConfigError::NoProviderConfigured)?;
        Ok(Self {
            endpoint,
            api_key: std::env::var("RECONKG_LLM_API_KEY").ok(),
            model: std::env::var("RECONKG_LLM_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            timeout_secs: std::env::var("RECONKG_LLM_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
        })
    }

    pub fn new(endpoint: &str, model: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            api_key: None,
            model: model.to_string(),
            timeout_secs: 60,
        }
    }
}

// ============================================================================
// OpenAI-compatible provider
// ============================================================================

pub struct OpenAiCompatClient {
    client: Client,
    config: LlmConfig,
}

impl OpenAiCompatClient {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = format!(
            "{}/chat/completions",
            self.config.endpoint.trim_end_matches('/')
        );

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": request.prompt}));

        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if request.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        let mut http = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            http = http.header("Authorization", format!("Bearer {key}"));
        }

        let response = http
            .send()
            .await
            .map_err(|e| LlmError::Unavailable(format!("network error: {e}")))?;

        if response.status() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(LlmError::RateLimited {
                retry_after_ms: retry_after * 1000,
            });
        }
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::Unavailable(format!(
                "API error {status}: {error_text}"
            )));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Unavailable(format!("invalid response body: {e}")))?;

        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();

        Ok(CompletionResponse {
            content,
            model: self.config.model.clone(),
            prompt_tokens: data["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as usize,
            completion_tokens: data["usage"]["completion_tokens"].as_u64().unwrap_or(0) as usize,
        })
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

// ============================================================================
// Unified client
// ============================================================================

/// Dispatching wrapper; today all configured providers speak the
/// OpenAI-compatible contract, so this stays a thin enum.
pub enum UnifiedLlmClient {
    OpenAiCompat(OpenAiCompatClient),
    /// Configuration existed but the client could not be constructed; every
    /// call reports unavailable so callers fall back.
    Broken(String),
}

impl UnifiedLlmClient {
    pub fn from_config(config: LlmConfig) -> Self {
        match OpenAiCompatClient::new(config) {
            Ok(client) => Self::OpenAiCompat(client),
            Err(e) => Self::Broken(e.to_string()),
        }
    }
}

#[async_trait]
impl LlmClient for UnifiedLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        match self {
            Self::OpenAiCompat(c) => c.complete(request).await,
            Self::Broken(reason) => Err(LlmError::Unavailable(reason.clone())),
        }
    }

    fn model_name(&self) -> &str {
        match self {
            Self::OpenAiCompat(c) => c.model_name(),
            Self::Broken(_) => "unconfigured",
        }
    }
}
