use crate::compiler::Prompt;
use crate::error::{AnalysisError, Result};
use crate::invoker::{ModelAdapter, ModelError};
use crate::llm::types::*;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use std::time::Duration;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-20241022";
pub const DEFAULT_MAX_TOKENS: u32 = 4000;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: Option<f32>,
    request_timeout: Duration,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: ANTHROPIC_BASE_URL.to_string(),
            model: DEFAULT_ANTHROPIC_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: Some(0.0),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Reads `ANTHROPIC_API_KEY` and, if set, `ANTHROPIC_MODEL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            AnalysisError::ModelUnavailable("ANTHROPIC_API_KEY is not set".to_string())
        })?;
        let client = Self::new(api_key);
        Ok(match std::env::var("ANTHROPIC_MODEL") {
            Ok(model) if !model.trim().is_empty() => client.with_model(model.trim()),
            _ => client,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Transport-level timeout. The pipeline applies its own deadline on top.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn create_message(&self, prompt: &Prompt) -> std::result::Result<String, ModelError> {
        let url = format!("{}/messages", self.base_url);
        let payload = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system: &prompt.system,
            messages: vec![Message {
                role: "user",
                content: &prompt.user,
            }],
        };

        let res = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = res.status();
        if !status.is_success() {
            let err_text = res.text().await.unwrap_or_default();
            return Err(status_error(status, &err_text));
        }

        let body: MessagesResponse = res.json().await.map_err(|e| self.transport_error(e))?;
        if body.stop_reason.as_deref() == Some("max_tokens") {
            warn!(
                "Anthropic response hit the {} token limit; output is truncated",
                self.max_tokens
            );
        }

        let text = body.text();
        if text.trim().is_empty() {
            return Err(ModelError::Unavailable(
                "Anthropic response contained no text".to_string(),
            ));
        }
        debug!("Anthropic returned {} chars from {}", text.len(), self.model);
        Ok(text)
    }

    fn transport_error(&self, e: reqwest::Error) -> ModelError {
        if e.is_timeout() {
            ModelError::Timeout(self.request_timeout)
        } else if e.is_decode() {
            ModelError::Unavailable(format!("unreadable Anthropic response: {}", e))
        } else {
            ModelError::Unavailable(format!("request to Anthropic failed: {}", e))
        }
    }
}

#[async_trait]
impl ModelAdapter for AnthropicClient {
    async fn invoke(&self, prompt: &Prompt) -> std::result::Result<String, ModelError> {
        self.create_message(prompt).await
    }

    fn name(&self) -> &str {
        &self.model
    }
}

fn status_error(status: StatusCode, body: &str) -> ModelError {
    let detail = serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| format!("{}: {}", b.error.kind, b.error.message))
        .unwrap_or_else(|_| body.trim().to_string());

    let reason = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => "authentication failed",
        StatusCode::TOO_MANY_REQUESTS => "rate limited",
        s if s.is_server_error() => "service error",
        _ => "request rejected",
    };
    ModelError::Unavailable(format!(
        "Anthropic API {} (status {}): {}",
        reason, status, detail
    ))
}
