//! Specialist service facade.
//!
//! One stable interface over the classifier, reachable in-process
//! ([`LocalSpecialist`]) or across the local network ([`HttpSpecialist`]).
//! Every failure comes back as a [`ServiceError`] value so callers can
//! forward it instead of aborting.

mod http;
mod local;

pub use http::HttpSpecialist;
pub use local::LocalSpecialist;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classifier::{ClassificationResult, ClassifierError, LabelMapping, RetinaLabel};
use crate::imaging::ImageError;

/// Failure category carried across the facade boundary
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceErrorKind {
    NotFound,
    DecodeFailed,
    ModelUnavailable,
    Unreachable,
    Internal,
}

impl ServiceErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceErrorKind::NotFound => "NOT_FOUND",
            ServiceErrorKind::DecodeFailed => "DECODE_FAILED",
            ServiceErrorKind::ModelUnavailable => "MODEL_UNAVAILABLE",
            ServiceErrorKind::Unreachable => "UNREACHABLE",
            ServiceErrorKind::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform error envelope of the specialist
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::NotFound, message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Unreachable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Internal, message)
    }
}

impl From<ImageError> for ServiceError {
    fn from(e: ImageError) -> Self {
        let kind = match &e {
            _ if e.is_not_found() => ServiceErrorKind::NotFound,
            ImageError::Io { .. } => ServiceErrorKind::Internal,
            ImageError::Decode(_) | ImageError::Empty { .. } => ServiceErrorKind::DecodeFailed,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<ClassifierError> for ServiceError {
    fn from(e: ClassifierError) -> Self {
        let kind = match &e {
            ClassifierError::ModelUnavailable => ServiceErrorKind::ModelUnavailable,
            _ => ServiceErrorKind::Internal,
        };
        Self::new(kind, e.to_string())
    }
}

/// Image to analyze: a file on disk or an in-memory encoded buffer
#[derive(Debug, Clone)]
pub enum ImageRef {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

impl ImageRef {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        ImageRef::Path(path.into())
    }

    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        ImageRef::Bytes(Arc::from(bytes.into()))
    }

    /// File name to present when uploading
    pub fn file_name(&self) -> String {
        match self {
            ImageRef::Path(p) => p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".into()),
            ImageRef::Bytes(_) => "image".into(),
        }
    }

    /// Load the encoded bytes
    pub async fn read(&self) -> Result<Arc<[u8]>, ServiceError> {
        match self {
            ImageRef::Bytes(b) => Ok(b.clone()),
            ImageRef::Path(p) => read_file(p).await,
        }
    }
}

async fn read_file(path: &Path) -> Result<Arc<[u8]>, ServiceError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Arc::from(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ServiceError::not_found(format!(
            "image not found: {}",
            path.display()
        ))),
        Err(e) => Err(ServiceError::internal(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

/// The specialist as seen by the orchestrator
#[async_trait]
pub trait Specialist: Send + Sync {
    async fn analyze(&self, image: &ImageRef) -> Result<ClassificationResult, ServiceError>;
}

/// `200` body of `POST /predict_retina`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictResponse {
    pub status: RetinaLabel,
    pub confianza: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub puntuaciones: Vec<f32>,
}

impl From<&ClassificationResult> for PredictResponse {
    fn from(r: &ClassificationResult) -> Self {
        Self {
            status: r.label,
            confianza: r.confidence,
            puntuaciones: r.raw_scores.clone(),
        }
    }
}

impl PredictResponse {
    /// Rebuild a full result. Older servers omit the score vector; it is
    /// reconstructed from the reported confidence, and must still agree
    /// with the reported status.
    pub fn into_result(self, mapping: &LabelMapping) -> Result<ClassificationResult, ServiceError> {
        let raw_scores = if self.puntuaciones.is_empty() {
            self.rebuild_scores(mapping)?
        } else {
            self.puntuaciones
        };
        let result = ClassificationResult::from_scores(raw_scores, mapping)
            .map_err(|e| ServiceError::internal(format!("malformed specialist response: {e}")))?;
        if result.label != self.status {
            return Err(ServiceError::internal(format!(
                "malformed specialist response: status {} disagrees with its scores",
                self.status
            )));
        }
        Ok(result)
    }

    fn rebuild_scores(&self, mapping: &LabelMapping) -> Result<Vec<f32>, ServiceError> {
        if !self.confianza.is_finite() || !(0.0..=1.0).contains(&self.confianza) {
            return Err(ServiceError::internal(format!(
                "malformed specialist response: confidence {} outside [0, 1]",
                self.confianza
            )));
        }
        let class_index = mapping.index_of(self.status).ok_or_else(|| {
            ServiceError::internal(format!("no class index for {}", self.status))
        })?;
        let others = mapping.len().saturating_sub(1).max(1) as f32;
        let mut raw_scores = vec![(1.0 - self.confianza) / others; mapping.len()];
        raw_scores[class_index] = self.confianza;
        Ok(raw_scores)
    }
}

/// Error body of `POST /predict_retina`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ServiceErrorKind>,
}

impl From<&ServiceError> for ErrorBody {
    fn from(e: &ServiceError) -> Self {
        Self {
            error: e.message.clone(),
            kind: Some(e.kind),
        }
    }
}
