use base64::{engine::general_purpose, Engine as _};

use crate::classifier::ClassificationResult;
use crate::conversation::{ContentBlock, Turn};
use crate::imaging::media_type;
use crate::patient::PatientContext;
use crate::specialist::{ImageRef, ServiceError};

use super::SessionError;

pub const DEFAULT_SYSTEM_PROMPT: &str = "Eres un asistente médico experto en el análisis de datos de salud. \
Tienes acceso a herramientas locales. Tu trabajo es sintetizar múltiples fuentes de datos \
para entregar al médico un resumen claro y accionable.";

/// Multimodal opening turn: the retina image, then the patient readings and
/// the request to consult the specialist tool first.
pub fn initial_user_turn(
    image_bytes: &[u8],
    patient: &PatientContext,
    specialist_tool: Option<&str>,
) -> Result<Turn, SessionError> {
    let media_type = media_type(image_bytes).ok_or_else(|| {
        SessionError::InvalidRequest("unrecognized image format for the retina image".into())
    })?;

    let mut text = String::from("Aquí están los datos de mi paciente:\n- Imagen de retina (adjunta).\n");
    if !patient.is_empty() {
        text.push_str(&patient.render());
        text.push('\n');
    }
    text.push('\n');
    match specialist_tool {
        Some(tool) => text.push_str(&format!(
            "Por favor, analiza esta información. Primero usa tu herramienta '{tool}' para obtener \
             el diagnóstico de mi especialista local sobre la imagen. Luego dame un resumen completo \
             y sugerencias."
        )),
        None => text.push_str("Por favor, analiza esta información y dame un resumen completo y sugerencias."),
    }

    Ok(Turn::User {
        content: vec![
            ContentBlock::Image {
                media_type: media_type.to_string(),
                data: general_purpose::STANDARD.encode(image_bytes),
            },
            ContentBlock::text(text),
        ],
    })
}

pub const HYBRID_REPORT_OPENING: &str = "Reporte Híbrido del Paciente:";
pub const HYBRID_REPORT_CLOSING: &str = "Sugerencias de Próximos Pasos:";

/// Text-only report request combining the patient readings with a
/// specialist result obtained beforehand. A failed analysis is rendered as
/// status `Error` with confidence 0.
pub fn hybrid_report_prompt(
    patient: &PatientContext,
    image: &ImageRef,
    analysis: &Result<ClassificationResult, ServiceError>,
) -> String {
    let readings = if patient.is_empty() {
        "   - (sin lecturas disponibles)".to_string()
    } else {
        patient
            .render()
            .lines()
            .map(|l| format!("   {l}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let image = match image {
        ImageRef::Path(p) => p.display().to_string(),
        ImageRef::Bytes(_) => "(adjunta)".to_string(),
    };
    let (status, confidence) = match analysis {
        Ok(r) => (r.status(), r.confidence),
        Err(_) => ("Error", 0.0),
    };

    format!(
        "Por favor, genera un reporte para el médico basado ESTRICTAMENTE en la siguiente información:\n\n\
         1. Datos de Sensores del Paciente:\n{readings}\n\n\
         2. Análisis de Retina (realizado por CNN especialista local):\n   \
         - Imagen: {image}\n   \
         - Resultado: {status}\n   \
         - Confianza del modelo: {confidence:.2}\n\n\
         Tarea:\n\
         Sintetiza TODOS estos puntos de datos en un reporte accionable.\n\
         Inicia con '{HYBRID_REPORT_OPENING}'\n\
         Finaliza con '{HYBRID_REPORT_CLOSING}'."
    )
}
