use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, error, warn};

use super::error::LlmCallError;
use super::types::{ModelRequest, ModelResponse};
use super::ModelBackend;

/// Configuration for LlmClient loaded from environment variables
#[derive(Debug, Clone, PartialEq)]
pub struct LlmClientConfig {
    pub base_url: String, // e.g., https://api.anthropic.com
    pub model: String,    // e.g., claude-3-5-sonnet-20240620
    pub api_key: Option<String>,
    pub api_version: String,
    pub request_timeout_ms: u64,
    /// Extra attempts per call on transient failures
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for LlmClientConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("LLM_BASE_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            model: std::env::var("LLM_MODEL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "claude-3-5-sonnet-20240620".to_string()),
            api_key: std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|s| !s.is_empty())
                .or_else(|| std::env::var("CLAUDE_API_KEY").ok().filter(|s| !s.is_empty())),
            api_version: "2023-06-01".to_string(),
            request_timeout_ms: std::env::var("LLM_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60_000),
            max_retries: std::env::var("LLM_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(1),
            retry_backoff_ms: 500,
        }
    }
}

/// HTTP client for an Anthropic-compatible Messages endpoint
#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    cfg: LlmClientConfig,
}

impl LlmClient {
    pub fn new(cfg: LlmClientConfig) -> Result<Self, LlmCallError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| LlmCallError::Network(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http, cfg })
    }

    pub fn from_env() -> Result<Self, LlmCallError> {
        Self::new(LlmClientConfig::default())
    }

    pub fn config(&self) -> &LlmClientConfig {
        &self.cfg
    }

    async fn post_once(&self, url: &str, body: &serde_json::Value) -> Result<ModelResponse, LlmCallError> {
        let mut req = self
            .http
            .post(url)
            .header("content-type", "application/json")
            .header("anthropic-version", &self.cfg.api_version);
        if let Some(key) = &self.cfg.api_key {
            req = req.header("x-api-key", key);
        }

        let resp = req.json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                LlmCallError::Timeout
            } else {
                LlmCallError::Network(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!(target: "llm_client", %status, body = %text, "Messages API error");
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmCallError::Auth(text),
                StatusCode::TOO_MANY_REQUESTS => LlmCallError::RateLimited(text),
                _ => LlmCallError::Api {
                    status: status.as_u16(),
                    body: text,
                },
            });
        }

        let val: serde_json::Value = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                LlmCallError::Timeout
            } else {
                LlmCallError::Decode(format!("Failed to parse Messages JSON: {e}"))
            }
        })?;
        ModelResponse::from_wire(val)
    }
}

#[async_trait]
impl ModelBackend for LlmClient {
    /// Contract:
    /// - Input: full request (history, tools, system prompt)
    /// - Output: parsed response with stop reason and content blocks
    /// - Error: one retry on transient failures, then the last error
    async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, LlmCallError> {
        let url = format!("{}/v1/messages", self.cfg.base_url.trim_end_matches('/'));
        let body = request.to_wire();

        let mut attempt = 0;
        loop {
            debug!(
                target: "llm_client",
                url = %url,
                messages = request.messages.len(),
                attempt,
                "POST Messages API"
            );
            match self.post_once(&url, &body).await {
                Err(e) if e.is_transient() && attempt < self.cfg.max_retries => {
                    attempt += 1;
                    warn!(target: "llm_client", error = %e, attempt, "Transient LLM failure; retrying");
                    tokio::time::sleep(Duration::from_millis(self.cfg.retry_backoff_ms)).await;
                }
                other => return other,
            }
        }
    }
}
