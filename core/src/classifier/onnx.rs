// ONNX Runtime backed specialist
//
// The session is created once from the model file and kept for the process
// lifetime. ONNX Runtime sessions need exclusive access per run, so forward
// passes from concurrent sessions are serialized on a mutex.
//
// Class ordering is read from a `<model>.labels` file (one class name per
// line) exported next to the model at training time, if present.

use std::path::Path;
use std::sync::Mutex;

use ndarray::Axis;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor as OrtTensor;
use tracing::{info, warn};

use super::{ClassifierError, InferenceEngine};
use crate::imaging::ImageTensor;

pub struct OnnxEngine {
    session: Mutex<Session>,
    class_names: Option<Vec<String>>,
}

impl OnnxEngine {
    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let load_err = |reason: String| ClassifierError::Load {
            path: path.to_path_buf(),
            reason,
        };

        if !path.exists() {
            return Err(load_err("model file not found".into()));
        }

        let session = Session::builder()
            .map_err(|e| load_err(format!("failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| load_err(format!("failed to set optimization level: {e}")))?
            .commit_from_file(path)
            .map_err(|e| load_err(format!("failed to load ONNX model: {e}")))?;

        let class_names = read_labels_file(path);
        info!(
            target: "classifier",
            path = %path.display(),
            labels = ?class_names,
            "ONNX specialist loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            class_names,
        })
    }
}

impl InferenceEngine for OnnxEngine {
    fn class_names(&self) -> Option<Vec<String>> {
        self.class_names.clone()
    }

    fn forward(&self, input: &ImageTensor) -> Result<Vec<f32>, ClassifierError> {
        // Batch of one, NHWC as trained
        let batch = input.as_array().clone().insert_axis(Axis(0)).into_dyn();
        let tensor = OrtTensor::from_array(batch)
            .map_err(|e| ClassifierError::Inference(format!("failed to create input tensor: {e}")))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| ClassifierError::Inference("inference session poisoned".into()))?;
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| ClassifierError::Inference(e.to_string()))?;

        let scores: ndarray::ArrayViewD<f32> = outputs[0]
            .try_extract_array()
            .map_err(|e| ClassifierError::Inference(format!("failed to extract scores: {e}")))?;
        Ok(scores.iter().copied().collect())
    }
}

fn read_labels_file(model_path: &Path) -> Option<Vec<String>> {
    let labels_path = model_path.with_extension("labels");
    match std::fs::read_to_string(&labels_path) {
        Ok(text) => Some(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(target: "classifier", path = %labels_path.display(), error = %e, "Failed to read labels file");
            None
        }
    }
}
