use serde::Deserialize;
use serde_json::{json, Value};

use super::error::LlmCallError;
use crate::conversation::{ContentBlock, ToolCallRecord, Turn};
use crate::tools::ToolDefinition;

/// Why the model stopped generating
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    ToolUse,
    EndTurn,
    MaxTokens,
    StopSequence,
    Other(String),
}

impl StopReason {
    pub fn parse(s: &str) -> Self {
        match s {
            "tool_use" => StopReason::ToolUse,
            "end_turn" => StopReason::EndTurn,
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            other => StopReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            StopReason::ToolUse => "tool_use",
            StopReason::EndTurn => "end_turn",
            StopReason::MaxTokens => "max_tokens",
            StopReason::StopSequence => "stop_sequence",
            StopReason::Other(s) => s,
        }
    }
}

/// Everything the remote side needs for one round: it keeps no state
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: String,
    pub tools: Vec<ToolDefinition>,
    pub messages: Vec<Turn>,
}

impl ModelRequest {
    /// Messages API request body
    pub fn to_wire(&self) -> Value {
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": self.messages.iter().map(turn_to_wire).collect::<Vec<_>>(),
        });
        if !self.system.is_empty() {
            body["system"] = json!(self.system);
        }
        if !self.tools.is_empty() {
            body["tools"] = Value::Array(self.tools.iter().map(ToolDefinition::to_wire).collect());
        }
        body
    }
}

fn block_to_wire(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({"type": "text", "text": text}),
        ContentBlock::Image { media_type, data } => json!({
            "type": "image",
            "source": {"type": "base64", "media_type": media_type, "data": data},
        }),
        ContentBlock::ToolUse { id, name, input } => json!({
            "type": "tool_use", "id": id, "name": name, "input": input,
        }),
    }
}

fn turn_to_wire(turn: &Turn) -> Value {
    match turn {
        Turn::User { content } => json!({
            "role": "user",
            "content": content.iter().map(block_to_wire).collect::<Vec<_>>(),
        }),
        Turn::Assistant { content } => json!({
            "role": "assistant",
            "content": content.iter().map(block_to_wire).collect::<Vec<_>>(),
        }),
        // Tool results travel as a user message holding a tool_result block
        Turn::ToolResult {
            tool_call_id,
            content,
            is_error,
        } => json!({
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": tool_call_id,
                "content": content,
                "is_error": is_error,
            }],
        }),
    }
}

/// Parsed model reply
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub id: Option<String>,
    pub model: Option<String>,
    pub stop_reason: StopReason,
    pub content: Vec<ContentBlock>,
    pub usage: Option<Value>,
}

#[derive(Deserialize)]
struct WireResponse {
    id: Option<String>,
    model: Option<String>,
    stop_reason: Option<String>,
    #[serde(default)]
    content: Vec<WireBlock>,
    usage: Option<Value>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

impl ModelResponse {
    pub fn from_wire(value: Value) -> Result<Self, LlmCallError> {
        let wire: WireResponse =
            serde_json::from_value(value).map_err(|e| LlmCallError::Decode(e.to_string()))?;
        let stop_reason = wire
            .stop_reason
            .as_deref()
            .map(StopReason::parse)
            .ok_or_else(|| LlmCallError::Decode("missing stop_reason".into()))?;
        let content = wire
            .content
            .into_iter()
            .filter_map(|b| match b {
                WireBlock::Text { text } => Some(ContentBlock::Text { text }),
                WireBlock::ToolUse { id, name, input } => Some(ContentBlock::ToolUse {
                    id,
                    name,
                    // The API always sends an object; absent input means no arguments
                    input: if input.is_null() { json!({}) } else { input },
                }),
                WireBlock::Other => None,
            })
            .collect();
        Ok(Self {
            id: wire.id,
            model: wire.model,
            stop_reason,
            content,
            usage: wire.usage,
        })
    }

    /// Reply text with tool-use blocks removed
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_calls(&self) -> Vec<ToolCallRecord> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCallRecord {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}
