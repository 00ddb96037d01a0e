//! Specialist classifier client.
//!
//! Wraps a preloaded binary image classifier behind [`InferenceEngine`] and
//! turns its per-class probabilities into a [`ClassificationResult`].

mod label;
#[cfg(feature = "onnx")]
mod onnx;

pub use label::{LabelMapping, RetinaLabel, NEGATIVE_CLASS, POSITIVE_CLASS};
#[cfg(feature = "onnx")]
pub use onnx::OnnxEngine;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::imaging::ImageTensor;

/// Probabilities must sum to one within this tolerance
pub const SCORE_SUM_TOLERANCE: f32 = 1e-4;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Specialist model is not loaded")]
    ModelUnavailable,

    #[error("Failed to load model {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("Label convention mismatch: {0}")]
    LabelMismatch(String),

    #[error("Inference failed: {0}")]
    Inference(String),
}

/// A forward pass over one normalized image.
///
/// Implementations are shared across sessions and must tolerate concurrent
/// calls; engines that cannot run in parallel serialize internally.
pub trait InferenceEngine: Send + Sync {
    /// Class names in output order, when the model records them
    fn class_names(&self) -> Option<Vec<String>> {
        None
    }

    /// Per-class probabilities for `input`
    fn forward(&self, input: &ImageTensor) -> Result<Vec<f32>, ClassifierError>;
}

/// Outcome of one classification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationResult {
    pub label: RetinaLabel,
    pub confidence: f32,
    pub raw_scores: Vec<f32>,
    pub class_index: usize,
}

impl ClassificationResult {
    /// Derive label and confidence from softmax scores
    pub fn from_scores(raw_scores: Vec<f32>, mapping: &LabelMapping) -> Result<Self, ClassifierError> {
        if raw_scores.len() != mapping.len() {
            return Err(ClassifierError::Inference(format!(
                "model produced {} scores for {} classes",
                raw_scores.len(),
                mapping.len()
            )));
        }
        if raw_scores.iter().any(|s| !s.is_finite() || *s < 0.0) {
            return Err(ClassifierError::Inference(format!(
                "model produced invalid probabilities {raw_scores:?}"
            )));
        }
        let sum: f32 = raw_scores.iter().sum();
        if (sum - 1.0).abs() > SCORE_SUM_TOLERANCE {
            return Err(ClassifierError::Inference(format!(
                "scores sum to {sum}, expected softmax output"
            )));
        }

        // First maximum wins on ties
        let (class_index, confidence) = raw_scores
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, s)| if s > best.1 { (i, s) } else { best });

        let label = mapping.label_for(class_index).ok_or_else(|| {
            ClassifierError::Inference(format!("no label for class index {class_index}"))
        })?;

        Ok(Self {
            label,
            confidence,
            raw_scores,
            class_index,
        })
    }

    pub fn status(&self) -> &'static str {
        self.label.status()
    }

    /// Human-readable one-liner for the report
    pub fn details(&self) -> String {
        format!(
            "Clase {}: {} con {:.1}% de confianza",
            self.class_index,
            self.label,
            self.confidence * 100.0
        )
    }
}

/// The loaded specialist model plus its label convention
pub struct SpecialistClassifier {
    engine: Option<Arc<dyn InferenceEngine>>,
    mapping: LabelMapping,
}

impl SpecialistClassifier {
    /// Wrap a loaded engine, checking its class ordering against `mapping`
    pub fn new(engine: Arc<dyn InferenceEngine>, mapping: LabelMapping) -> Result<Self, ClassifierError> {
        if let Some(model_classes) = engine.class_names() {
            mapping.check_model_classes(&model_classes)?;
            debug!(target: "classifier", classes = ?model_classes, "Model class order verified");
        }
        info!(
            target: "classifier",
            classes = ?mapping.class_names().collect::<Vec<_>>(),
            "Specialist classifier ready"
        );
        Ok(Self {
            engine: Some(engine),
            mapping,
        })
    }

    /// A classifier with no model; every call reports `ModelUnavailable`
    pub fn unloaded(mapping: LabelMapping) -> Self {
        Self {
            engine: None,
            mapping,
        }
    }

    /// Load an ONNX model from disk
    #[cfg(feature = "onnx")]
    pub fn load_onnx(path: &std::path::Path, mapping: LabelMapping) -> Result<Self, ClassifierError> {
        let engine = OnnxEngine::load(path)?;
        Self::new(Arc::new(engine), mapping)
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.is_some()
    }

    pub fn mapping(&self) -> &LabelMapping {
        &self.mapping
    }

    pub fn classify(&self, tensor: &ImageTensor) -> Result<ClassificationResult, ClassifierError> {
        let engine = self.engine.as_ref().ok_or(ClassifierError::ModelUnavailable)?;
        let scores = engine.forward(tensor)?;
        let result = ClassificationResult::from_scores(scores, &self.mapping)?;
        debug!(
            target: "classifier",
            label = %result.label,
            confidence = result.confidence,
            "Classification complete"
        );
        Ok(result)
    }
}

impl std::fmt::Debug for SpecialistClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecialistClassifier")
            .field("loaded", &self.is_loaded())
            .field("mapping", &self.mapping)
            .finish()
    }
}
