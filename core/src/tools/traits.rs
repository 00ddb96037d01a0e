use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::schema::ToolDefinition;
use crate::patient::PatientContext;
use crate::specialist::{ImageRef, ServiceError};

/// Session data a tool may read
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub image: ImageRef,
    pub patient: PatientContext,
}

/// Serialized tool result. Failures are content too, flagged with `is_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    /// Pretty JSON of `value`
    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_string_pretty(value) {
            Ok(content) => Self {
                content,
                is_error: false,
            },
            Err(e) => Self::failure(&ServiceError::internal(format!(
                "failed to serialize tool output: {e}"
            ))),
        }
    }

    /// `{"error": {"kind": ..., "message": ...}}`
    pub fn failure(error: &ServiceError) -> Self {
        #[derive(Serialize)]
        struct Envelope<'a> {
            error: &'a ServiceError,
        }
        let content = serde_json::to_string_pretty(&Envelope { error })
            .unwrap_or_else(|_| format!("{{\"error\": {{\"kind\": \"{}\"}}}}", error.kind));
        Self {
            content,
            is_error: true,
        }
    }
}

/// A locally callable capability exposed to the model
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Execute with already validated arguments
    async fn call(&self, ctx: &ToolContext, arguments: &Value) -> ToolOutput;
}
