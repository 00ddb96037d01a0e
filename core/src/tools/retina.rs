use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use super::schema::{FieldType, InputSchema, ToolDefinition};
use super::traits::{Tool, ToolContext, ToolOutput};
use crate::classifier::ClassificationResult;
use crate::specialist::{ImageRef, Specialist};

pub const RETINA_TOOL_NAME: &str = "analizar_retina_cnn";

/// Tool content for a successful classification
#[derive(Debug, Serialize)]
struct RetinaFinding<'a> {
    status: &'a str,
    confianza: f32,
    detalles: String,
}

impl<'a> From<&'a ClassificationResult> for RetinaFinding<'a> {
    fn from(r: &'a ClassificationResult) -> Self {
        Self {
            status: r.status(),
            confianza: r.confidence,
            detalles: r.details(),
        }
    }
}

/// Runs a retina image through the specialist: the session image, or the
/// file named by `image_path` when the model supplies one
pub struct RetinaAnalysisTool {
    specialist: Arc<dyn Specialist>,
}

impl RetinaAnalysisTool {
    pub fn new(specialist: Arc<dyn Specialist>) -> Self {
        Self { specialist }
    }
}

#[async_trait]
impl Tool for RetinaAnalysisTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            RETINA_TOOL_NAME,
            "Analiza la imagen de retina del paciente con el modelo CNN especialista local \
             para detectar retinopatía diabética (DR). Devuelve 'status' (DR_DETECTADA o NO_DR) \
             y 'confianza' (0.0-1.0).",
            InputSchema::new()
                .required(
                    "motivo",
                    FieldType::String,
                    "Motivo por el cual se solicita el análisis. Ej: 'Analizar imagen del paciente'.",
                )
                .optional(
                    "image_path",
                    FieldType::String,
                    "Ruta completa a otra imagen de retina en el sistema de archivos. \
                     Si se omite, se analiza la imagen adjunta del paciente.",
                ),
        )
    }

    async fn call(&self, ctx: &ToolContext, arguments: &Value) -> ToolOutput {
        let motivo = arguments.get("motivo").and_then(Value::as_str).unwrap_or_default();
        let image = match arguments.get("image_path").and_then(Value::as_str) {
            Some(path) if !path.is_empty() => ImageRef::path(path),
            _ => ctx.image.clone(),
        };
        info!(
            target: "tool.retina",
            session = %ctx.session_id,
            motivo = %motivo,
            image = %image.file_name(),
            "Calling retina specialist"
        );

        match self.specialist.analyze(&image).await {
            Ok(result) => {
                info!(
                    target: "tool.retina",
                    status = result.status(),
                    confianza = result.confidence,
                    "Specialist answered"
                );
                ToolOutput::json(&RetinaFinding::from(&result))
            }
            Err(e) => {
                warn!(target: "tool.retina", kind = %e.kind, error = %e.message, "Specialist failed");
                ToolOutput::failure(&e)
            }
        }
    }
}
