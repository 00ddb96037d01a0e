use thiserror::Error;

/// Failure of a single LLM round trip
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmCallError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("API error: status={status} body={body}")]
    Api { status: u16, body: String },

    #[error("malformed response: {0}")]
    Decode(String),
}

impl LlmCallError {
    /// Worth one more attempt at the call level
    pub fn is_transient(&self) -> bool {
        match self {
            LlmCallError::RateLimited(_) | LlmCallError::Timeout | LlmCallError::Network(_) => true,
            LlmCallError::Api { status, .. } => *status >= 500,
            LlmCallError::Auth(_) | LlmCallError::Decode(_) => false,
        }
    }
}
