use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::error::{ToolError, ToolResult};
use super::schema::ToolDefinition;
use super::traits::Tool;

/// Closed set of tools for a session.
///
/// Definitions are captured and validated once at registration; after that
/// the registry is only read, typically behind an `Arc`.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    entries: Vec<(ToolDefinition, Arc<dyn Tool>)>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; names must be unique and schemas well formed
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> ToolResult<()> {
        let definition = tool.definition();
        let name = definition.name.clone();

        if name.trim().is_empty() {
            return Err(ToolError::InvalidDefinition {
                tool: name,
                reason: "empty tool name".into(),
            });
        }
        if self.index.contains_key(&name) {
            return Err(ToolError::DuplicateTool(name));
        }
        definition
            .input_schema
            .check()
            .map_err(|reason| ToolError::InvalidDefinition {
                tool: name.clone(),
                reason,
            })?;

        info!(target: "tool_registry", tool = %name, "Registering tool");
        self.index.insert(name, self.entries.len());
        self.entries.push((definition, tool));
        Ok(())
    }

    /// Definition and handler for `name`
    pub fn get(&self, name: &str) -> Option<(&ToolDefinition, &Arc<dyn Tool>)> {
        self.index
            .get(name)
            .and_then(|&i| self.entries.get(i))
            .map(|(d, t)| (d, t))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Definitions in registration order
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.entries.iter().map(|(d, _)| d.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
