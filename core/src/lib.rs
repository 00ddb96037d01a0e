// Retina Core Library
// Specialist retina classifier wrapped in an LLM tool-use session

pub mod classifier;
pub mod config;
pub mod conversation;
pub mod imaging;
pub mod llm;
pub mod orchestrator;
pub mod patient;
pub mod specialist;
pub mod telemetry;
pub mod tools;

// Export core types
pub use classifier::{ClassificationResult, ClassifierError, LabelMapping, RetinaLabel, SpecialistClassifier};
pub use config::DiagnosticsConfig;
pub use conversation::{ContentBlock, Conversation, Turn};
pub use imaging::{ImageError, ImageNormalizer, ImageSource, ImageTensor};
pub use orchestrator::{DiagnosticReport, DiagnosticRequest, Orchestrator, OrchestratorOptions, SessionError, SessionFailure, SessionState};
pub use patient::PatientContext;
pub use specialist::{ImageRef, ServiceError, ServiceErrorKind, Specialist};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RetinaError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Classifier error: {0}")]
    ClassifierError(#[from] ClassifierError),

    #[error("Image error: {0}")]
    ImageError(#[from] ImageError),

    #[error("Session error: {0}")]
    SessionError(#[from] SessionError),

    #[error("Tool error: {0}")]
    ToolError(#[from] tools::ToolError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, RetinaError>;
