use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmCallError;
use crate::tools::ToolError;

/// Fatal session failure. Specialist failures never end up here; they are
/// forwarded to the model as tool results.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("LLM call failed: {0}")]
    LlmCall(#[from] LlmCallError),

    #[error("Model requested unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for tool {tool}: {reason}")]
    InvalidToolArguments { tool: String, reason: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Tool round limit of {0} exceeded")]
    RoundLimitExceeded(usize),

    #[error("Session timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<ToolError> for SessionError {
    fn from(e: ToolError) -> Self {
        match e {
            ToolError::UnknownTool(name) => SessionError::UnknownTool(name),
            ToolError::InvalidArguments { tool, reason } => {
                SessionError::InvalidToolArguments { tool, reason }
            }
            other => SessionError::InvalidRequest(other.to_string()),
        }
    }
}

impl SessionError {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::LlmCall(_) => "LLM_CALL_FAILED",
            SessionError::UnknownTool(_) => "UNKNOWN_TOOL",
            SessionError::InvalidToolArguments { .. } => "INVALID_TOOL_ARGUMENTS",
            SessionError::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            SessionError::RoundLimitExceeded(_) => "ROUND_LIMIT_EXCEEDED",
            SessionError::Timeout(_) => "SESSION_TIMEOUT",
            SessionError::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }

    pub fn to_failure(&self) -> SessionFailure {
        SessionFailure {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

/// User-visible form of a failed session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionFailure {
    pub kind: String,
    pub message: String,
}
