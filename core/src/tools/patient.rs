use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::schema::{FieldType, InputSchema, ToolDefinition};
use super::traits::{Tool, ToolContext, ToolOutput};

pub const PATIENT_TOOL_NAME: &str = "obtener_datos_paciente";

/// Returns the sensor readings attached to the session
pub struct PatientDataTool;

#[async_trait]
impl Tool for PatientDataTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            PATIENT_TOOL_NAME,
            "Obtiene los datos más recientes del sensor de glucosa y del smartwatch del paciente.",
            InputSchema::new().optional("paciente_id", FieldType::String, "Identificador del paciente."),
        )
    }

    async fn call(&self, ctx: &ToolContext, arguments: &Value) -> ToolOutput {
        debug!(
            target: "tool.patient",
            session = %ctx.session_id,
            paciente_id = ?arguments.get("paciente_id"),
            "Returning patient readings"
        );
        ToolOutput::json(&ctx.patient)
    }
}
