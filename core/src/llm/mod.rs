//! LLM module: Messages API client and the backend seam used by the orchestrator
//!
//! This module provides:
//! - `ModelBackend`, the request/response seam (mocked in tests)
//! - `LlmClientConfig`, `LlmClient` for talking to an Anthropic-compatible Messages endpoint
//! - `ModelRequest`, `ModelResponse`, `StopReason` and their wire mapping

mod client;
mod error;
mod types;

pub use client::{LlmClient, LlmClientConfig};
pub use error::LlmCallError;
pub use types::{ModelRequest, ModelResponse, StopReason};

use async_trait::async_trait;

/// One stateless round trip to the remote model
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, LlmCallError>;
}
