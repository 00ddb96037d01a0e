use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::error::{ToolError, ToolResult};
use super::registry::ToolRegistry;
use super::traits::{ToolContext, ToolOutput};
use crate::conversation::{ToolCallRecord, Turn};
use crate::specialist::ServiceError;

/// Routes model tool calls to registered handlers.
///
/// Contract violations by the model (unknown tool, bad arguments) are
/// errors; handler failures come back inside the `ToolResult` turn.
#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    per_tool_timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, per_tool_timeout: Duration) -> Self {
        Self {
            registry,
            per_tool_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    #[tracing::instrument(name = "tool_dispatcher.dispatch", skip(self, call, ctx), fields(tool.name = %call.name, tool.id = %call.id))]
    pub async fn dispatch(&self, call: &ToolCallRecord, ctx: &ToolContext) -> ToolResult<Turn> {
        let (definition, tool) = self
            .registry
            .get(&call.name)
            .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;

        definition.input_schema.validate(&call.name, &call.arguments)?;

        debug!(target: "tool_dispatcher", tool = %call.name, args = %call.arguments, "Invoking tool");
        let started = Instant::now();
        let output = match timeout(self.per_tool_timeout, tool.call(ctx, &call.arguments)).await {
            Ok(output) => output,
            Err(_) => {
                warn!(target: "tool_dispatcher", tool = %call.name, "Tool execution timed out");
                ToolOutput::failure(&ServiceError::unreachable(format!(
                    "tool '{}' timed out after {} ms",
                    call.name,
                    self.per_tool_timeout.as_millis()
                )))
            }
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        info!(
            target: "tool_dispatcher",
            tool = %call.name,
            is_error = output.is_error,
            latency_ms = %elapsed_ms,
            "Tool invocation finished"
        );

        Ok(Turn::ToolResult {
            tool_call_id: call.id.clone(),
            content: output.content,
            is_error: output.is_error,
        })
    }
}
