use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{ImageRef, ServiceError, Specialist};
use crate::classifier::{ClassificationResult, SpecialistClassifier};
use crate::imaging::{ImageNormalizer, ImageSource};

/// In-process specialist: normalizer + shared classifier.
///
/// Decoding and the forward pass run on the blocking pool under a bounded
/// timeout; a timeout is reported as `UNREACHABLE`.
#[derive(Debug, Clone)]
pub struct LocalSpecialist {
    classifier: Arc<SpecialistClassifier>,
    normalizer: ImageNormalizer,
    inference_timeout: Duration,
}

impl LocalSpecialist {
    pub fn new(
        classifier: Arc<SpecialistClassifier>,
        normalizer: ImageNormalizer,
        inference_timeout: Duration,
    ) -> Self {
        Self {
            classifier,
            normalizer,
            inference_timeout,
        }
    }

    pub fn classifier(&self) -> &Arc<SpecialistClassifier> {
        &self.classifier
    }

    fn analyze_blocking(
        classifier: &SpecialistClassifier,
        normalizer: &ImageNormalizer,
        image: &ImageRef,
    ) -> Result<ClassificationResult, ServiceError> {
        let tensor = match image {
            ImageRef::Path(path) => normalizer.normalize(ImageSource::Path(path))?,
            ImageRef::Bytes(bytes) => normalizer.normalize(ImageSource::Bytes(&bytes[..]))?,
        };
        Ok(classifier.classify(&tensor)?)
    }
}

#[async_trait]
impl Specialist for LocalSpecialist {
    async fn analyze(&self, image: &ImageRef) -> Result<ClassificationResult, ServiceError> {
        if !self.classifier.is_loaded() {
            return Err(crate::classifier::ClassifierError::ModelUnavailable.into());
        }

        let classifier = Arc::clone(&self.classifier);
        let normalizer = self.normalizer;
        let image = image.clone();
        debug!(target: "specialist", image = ?image_label(&image), "Running local inference");

        let task = tokio::task::spawn_blocking(move || {
            Self::analyze_blocking(&classifier, &normalizer, &image)
        });

        match timeout(self.inference_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                warn!(target: "specialist", error = %join_err, "Inference task failed");
                Err(ServiceError::internal(format!("inference task failed: {join_err}")))
            }
            Err(_) => {
                warn!(target: "specialist", timeout_ms = self.inference_timeout.as_millis() as u64, "Inference timed out");
                Err(ServiceError::unreachable(format!(
                    "inference timed out after {} ms",
                    self.inference_timeout.as_millis()
                )))
            }
        }
    }
}

fn image_label(image: &ImageRef) -> String {
    match image {
        ImageRef::Path(p) => p.display().to_string(),
        ImageRef::Bytes(b) => format!("<{} bytes>", b.len()),
    }
}
