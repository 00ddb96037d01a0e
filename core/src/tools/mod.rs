pub mod dispatcher;
pub mod error;
pub mod patient;
pub mod registry;
pub mod retina;
pub mod schema;
pub mod traits;

// Re-export common types
pub use dispatcher::ToolDispatcher;
pub use error::{ToolError, ToolResult};
pub use patient::{PatientDataTool, PATIENT_TOOL_NAME};
pub use registry::ToolRegistry;
pub use retina::{RetinaAnalysisTool, RETINA_TOOL_NAME};
pub use schema::{FieldSpec, FieldType, InputSchema, ToolDefinition};
pub use traits::{Tool, ToolContext, ToolOutput};

use std::sync::Arc;

use crate::specialist::Specialist;

/// Registry with the retina specialist tool and, optionally, the patient data tool
pub fn default_registry(specialist: Arc<dyn Specialist>, expose_patient_tool: bool) -> ToolResult<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(RetinaAnalysisTool::new(specialist)))?;
    if expose_patient_tool {
        registry.register(Arc::new(PatientDataTool))?;
    }
    Ok(registry)
}
